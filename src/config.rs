//! Per-transfer configuration and IRC identity helpers.

use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Nickname prefix; a random decimal suffix is appended per connection.
const NICK_PREFIX: &str = "xdcc-cli";

/// Settings shared by every transfer in a batch. Built once at the CLI
/// layer and handed to each transfer behind an `Arc`.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory downloads land in. Existing files are appended to,
    /// never truncated.
    pub out_dir: PathBuf,
    /// Only attempt strict TLS; disables the insecure-TLS and plaintext
    /// fallbacks.
    pub ssl_only: bool,
    /// Map remote filenames through the sanitizer before opening.
    pub sanitize_filenames: bool,
    /// Reconnect attempts per connection flavor before giving up.
    pub max_conn_attempts: u32,
    /// Back-off between reconnect attempts.
    pub reconnect_delay: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            out_dir: PathBuf::from("."),
            ssl_only: false,
            sanitize_filenames: false,
            max_conn_attempts: 5,
            reconnect_delay: Duration::from_secs(1),
        }
    }
}

/// `xdcc-cli` plus a time-seeded decimal suffix. Called again whenever
/// the server reports the nickname in use (433).
pub fn random_nick() -> String {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| (d.as_nanos() % 10_000) as u16)
        .unwrap_or(1234);
    format!("{NICK_PREFIX}{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(!config.ssl_only);
        assert!(!config.sanitize_filenames);
        assert_eq!(config.max_conn_attempts, 5);
        assert_eq!(config.reconnect_delay, Duration::from_secs(1));
    }

    #[test]
    fn test_random_nick_shape() {
        let nick = random_nick();
        assert!(nick.starts_with("xdcc-cli"));
        let suffix = &nick["xdcc-cli".len()..];
        assert!(!suffix.is_empty());
        assert!(suffix.chars().all(|c| c.is_ascii_digit()));
    }
}
