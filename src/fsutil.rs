//! Filename handling for hostile remote names.
//!
//! XDCC bots announce arbitrary byte strings as filenames; the sanitizer
//! maps them onto a conservative ASCII alphabet before they touch the
//! filesystem. The unique-path chooser probes for a free `name-N.ext`
//! variant when a caller must not clobber an existing file.

use std::path::{Path, PathBuf};

use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Returned when sanitizing leaves nothing usable behind.
const FALLBACK_NAME: &str = "unnamed_file";

fn is_allowed(c: char) -> bool {
    c.is_ascii_alphanumeric()
        || matches!(
            c,
            '_' | ',' | ' ' | '(' | ')' | '@' | '.' | '-' | '[' | ']'
        )
}

/// Maps any input to a filesystem-safe ASCII name.
///
/// Accented letters are transliterated to their base form (`café` →
/// `cafe`); everything outside the allowed set becomes `_`; leading and
/// trailing dots and spaces are trimmed and runs of underscores are
/// collapsed. Inputs that sanitize to nothing yield `unnamed_file`.
/// The function is idempotent.
pub fn sanitize_filename(name: &str) -> String {
    if name.is_empty() {
        return FALLBACK_NAME.to_string();
    }

    // Decompose, drop combining marks, recompose: é → e.
    let folded: String = name
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .nfc()
        .collect();

    let replaced: String = folded
        .chars()
        .map(|c| if is_allowed(c) { c } else { '_' })
        .collect();

    let mut out = replaced
        .trim_matches(|c| c == ' ' || c == '.')
        .to_string();

    while out.contains("__") {
        out = out.replace("__", "_");
    }

    if out.is_empty() || out.chars().all(|c| c == '_') {
        return FALLBACK_NAME.to_string();
    }
    out
}

/// Returns `path` if it does not exist, otherwise the first free
/// `dir/base-N.ext` for `N = 1, 2, …`. Multi-dot names split on the last
/// dot only (`archive.tar.gz` → `archive.tar-1.gz`); extensionless names
/// get a plain `-N` suffix.
///
/// Advisory only: the path may be taken between the check and the open.
/// Callers that need true uniqueness must open with create-exclusive
/// semantics.
pub fn unique_path(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }

    let dir = path.parent().unwrap_or_else(|| Path::new(""));
    let name = path
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    let (stem, ext) = match name.rfind('.') {
        Some(idx) if idx > 0 => (&name[..idx], Some(&name[idx + 1..])),
        _ => (name.as_str(), None),
    };

    let mut n: u32 = 1;
    loop {
        let candidate = match ext {
            Some(ext) => dir.join(format!("{stem}-{n}.{ext}")),
            None => dir.join(format!("{stem}-{n}")),
        };
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    #[test]
    fn test_sanitize_vectors() {
        let cases = [
            (
                "[HorribleSubs] Anime - 01.mkv",
                "[HorribleSubs] Anime - 01.mkv",
            ),
            ("../../../etc/passwd", "_.._.._etc_passwd"),
            ("file; rm -rf /", "file_ rm -rf _"),
            ("café_résumé.pdf", "cafe_resume.pdf"),
            ("file\x00name\n.txt", "file_name_.txt"),
            ("<script>alert(1)</script>.html", "_script_alert(1)_script_.html"),
            ("file:name*?.txt", "file_name_.txt"),
            ("", "unnamed_file"),
            ("///\\\\\\", "unnamed_file"),
            ("file___name.txt", "file_name.txt"),
            ("...file.txt...", "file.txt"),
            ("   file.txt   ", "file.txt"),
        ];
        for (input, expected) in cases {
            assert_eq!(sanitize_filename(input), expected, "input: {input:?}");
        }
    }

    #[test]
    fn test_sanitize_idempotent() {
        let inputs = [
            "../../../etc/passwd",
            "café_résumé.pdf",
            "<script>alert(1)</script>.html",
            "///\\\\\\",
            "...file.txt...",
            "weird\u{202e}name.exe",
            "unnamed_file",
        ];
        for input in inputs {
            let once = sanitize_filename(input);
            assert_eq!(sanitize_filename(&once), once, "input: {input:?}");
        }
    }

    #[test]
    fn test_sanitize_output_alphabet() {
        let inputs = [
            "völlig unmöglich.bin",
            "\x01\x02\x03",
            "mixed/path\\and:stuff*?.mkv",
            "ファイル名.txt",
        ];
        for input in inputs {
            let out = sanitize_filename(input);
            assert!(out.chars().all(is_allowed), "output: {out:?}");
            assert!(!out.starts_with(' ') && !out.starts_with('.'));
            assert!(!out.ends_with(' ') && !out.ends_with('.'));
            assert!(!out.contains("__"), "output: {out:?}");
        }
    }

    #[test]
    fn test_unique_path_free() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("testfile.mp3");
        assert_eq!(unique_path(&path), path);
    }

    #[test]
    fn test_unique_path_suffixes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("testfile.mp3");

        File::create(&path).unwrap();
        let second = unique_path(&path);
        assert_eq!(second, dir.path().join("testfile-1.mp3"));

        File::create(&second).unwrap();
        assert_eq!(unique_path(&path), dir.path().join("testfile-2.mp3"));
    }

    #[test]
    fn test_unique_path_multi_dot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("archive.tar.gz");
        File::create(&path).unwrap();
        assert_eq!(unique_path(&path), dir.path().join("archive.tar-1.gz"));
    }

    #[test]
    fn test_unique_path_no_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("README");
        File::create(&path).unwrap();
        assert_eq!(unique_path(&path), dir.path().join("README-1"));
    }

    #[test]
    fn test_unique_path_result_is_free() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        for _ in 0..4 {
            let next = unique_path(&path);
            assert!(!next.exists());
            File::create(&next).unwrap();
        }
    }
}
