//! XDCC transfer core.
//!
//! This module owns everything between a parsed `irc://` URL and bytes
//! on disk: the IRC control connection, the DCC SEND handshake, the
//! transfer state machine, and the retry/fallback policy around them.

mod client;
mod dcc;
pub mod event;
mod retry;
mod transfer;

// Re-export public API items
pub use client::{IrcLine, SslMode};
pub use dcc::{parse_ctcp, CtcpMessage, Offer};
pub use event::TransferEvent;
pub use retry::{run_with_fallback, TransferOutcome};
pub use transfer::{AttemptEnd, SpeedMeter, Transfer, TransferPhase, TransferState};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Parsed XDCC IRC URL
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct XdccUrl {
    pub network: String,
    pub port: Option<u16>,
    pub channel: String,
    pub bot: String,
    pub slot: u32,
}

impl XdccUrl {
    /// Parse an IRC URL in the format: `irc://host[:port]/channel/bot/slot`.
    ///
    /// The channel token is percent-decoded and gets a leading `#` unless
    /// it already starts with `#` or `&`. The slot must be a positive
    /// integer.
    pub fn parse(url: &str) -> Result<Self, XdccError> {
        let path = url
            .strip_prefix("irc://")
            .ok_or_else(|| XdccError::InvalidUrl("URL must start with irc://".into()))?;

        let parts: Vec<&str> = path.split('/').collect();
        if parts.len() != 4 {
            return Err(XdccError::InvalidUrl(
                "URL must have format: irc://network/channel/bot/slot".into(),
            ));
        }

        let (network, port) = match parts[0].rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| XdccError::InvalidUrl(format!("invalid port: {}", parts[0])))?;
                (host, Some(port))
            }
            None => (parts[0], None),
        };
        if network.is_empty() {
            return Err(XdccError::InvalidUrl("URL has no host".into()));
        }

        let decoded = urlencoding::decode(parts[1])
            .map_err(|_| XdccError::InvalidUrl(format!("invalid channel encoding: {}", parts[1])))?;
        let mut channel = decoded.into_owned();
        if channel.is_empty() {
            return Err(XdccError::InvalidUrl("URL has no channel".into()));
        }
        if !channel.starts_with('#') && !channel.starts_with('&') {
            channel = format!("#{}", channel);
        }

        let bot = urlencoding::decode(parts[2])
            .map_err(|_| XdccError::InvalidUrl(format!("invalid bot encoding: {}", parts[2])))?
            .into_owned();
        if bot.is_empty() {
            return Err(XdccError::InvalidUrl("URL has no bot".into()));
        }

        // Tolerate a '#' prefix on the slot ("/Bot/#42")
        let slot_str = parts[3].trim_start_matches('#');
        let slot = slot_str
            .parse::<u32>()
            .map_err(|_| XdccError::InvalidUrl(format!("invalid slot number: {}", parts[3])))?;
        if slot == 0 {
            return Err(XdccError::InvalidUrl("slot must be positive".into()));
        }

        Ok(Self {
            network: network.to_string(),
            port,
            channel,
            bot,
            slot,
        })
    }

    /// Convert back to the canonical URL string.
    pub fn to_url(&self) -> String {
        let authority = match self.port {
            Some(port) => format!("{}:{}", self.network, port),
            None => self.network.clone(),
        };
        format!(
            "irc://{}/{}/{}/{}",
            authority,
            self.channel.trim_start_matches('#'),
            self.bot,
            self.slot
        )
    }
}

impl fmt::Display for XdccUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_url())
    }
}

/// Transfer core errors. `error_type` gives the wire vocabulary used in
/// JSONL `error` events.
#[derive(Debug, Clone)]
pub enum XdccError {
    InvalidUrl(String),
    Network(String),
    Irc(String),
    File(String),
    Parse(String),
    Ssl(String),
    Other(String),
}

impl XdccError {
    pub fn error_type(&self) -> &'static str {
        match self {
            XdccError::InvalidUrl(_) | XdccError::Parse(_) => "parse",
            XdccError::Network(_) => "network",
            XdccError::Irc(_) => "irc",
            XdccError::File(_) => "file",
            XdccError::Ssl(_) => "ssl",
            XdccError::Other(_) => "unknown",
        }
    }
}

impl fmt::Display for XdccError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            XdccError::InvalidUrl(msg) => write!(f, "invalid URL: {}", msg),
            XdccError::Network(msg) => write!(f, "network error: {}", msg),
            XdccError::Irc(msg) => write!(f, "IRC error: {}", msg),
            XdccError::File(msg) => write!(f, "file error: {}", msg),
            XdccError::Parse(msg) => write!(f, "parse error: {}", msg),
            XdccError::Ssl(msg) => write!(f, "TLS error: {}", msg),
            XdccError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for XdccError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_xdcc_url() {
        let url = XdccUrl::parse("irc://irc.rizon.net/some-channel/TestBot/123").unwrap();
        assert_eq!(url.network, "irc.rizon.net");
        assert_eq!(url.port, None);
        assert_eq!(url.channel, "#some-channel");
        assert_eq!(url.bot, "TestBot");
        assert_eq!(url.slot, 123);
    }

    #[test]
    fn test_parse_encoded_channel() {
        let url = XdccUrl::parse("irc://irc.example.org/%23news/Bot/1").unwrap();
        assert_eq!(url.channel, "#news");
    }

    #[test]
    fn test_parse_encoded_bot() {
        let url = XdccUrl::parse("irc://irc.example.org/news/XDCC%7CBot/42").unwrap();
        assert_eq!(url.network, "irc.example.org");
        assert_eq!(url.channel, "#news");
        assert_eq!(url.bot, "XDCC|Bot");
        assert_eq!(url.slot, 42);
    }

    #[test]
    fn test_parse_with_port() {
        let url = XdccUrl::parse("irc://irc.example.org:7000/chan/Bot/7").unwrap();
        assert_eq!(url.network, "irc.example.org");
        assert_eq!(url.port, Some(7000));
    }

    #[test]
    fn test_parse_with_hash() {
        let url = XdccUrl::parse("irc://irc.rizon.net/#test/Bot/#42").unwrap();
        assert_eq!(url.channel, "#test");
        assert_eq!(url.slot, 42);
    }

    #[test]
    fn test_parse_ampersand_channel() {
        let url = XdccUrl::parse("irc://irc.rizon.net/&local/Bot/3").unwrap();
        assert_eq!(url.channel, "&local");
    }

    #[test]
    fn test_invalid_url() {
        assert!(XdccUrl::parse("http://example.com").is_err());
        assert!(XdccUrl::parse("irc://network/channel").is_err());
        assert!(XdccUrl::parse("irc://network/channel/bot/slot/extra").is_err());
        assert!(XdccUrl::parse("irc:///channel/bot/1").is_err());
        assert!(XdccUrl::parse("irc://network/channel/bot/abc").is_err());
        assert!(XdccUrl::parse("irc://network/channel/bot/-3").is_err());
    }

    #[test]
    fn test_zero_slot_invalid() {
        assert!(XdccUrl::parse("irc://x/y/z/0").is_err());
    }

    #[test]
    fn test_url_roundtrip() {
        for raw in [
            "irc://irc.rizon.net/test/Bot/1",
            "irc://irc.example.org:6667/news/SomeBot/42",
            "irc://host/#chan/Bot/9",
        ] {
            let url = XdccUrl::parse(raw).unwrap();
            let canonical = url.to_url();
            let reparsed = XdccUrl::parse(&canonical).unwrap();
            assert_eq!(reparsed.to_url(), canonical);
        }
    }

    #[test]
    fn test_error_type_vocabulary() {
        assert_eq!(XdccError::InvalidUrl("x".into()).error_type(), "parse");
        assert_eq!(XdccError::Network("x".into()).error_type(), "network");
        assert_eq!(XdccError::Ssl("x".into()).error_type(), "ssl");
        assert_eq!(XdccError::File("x".into()).error_type(), "file");
        assert_eq!(XdccError::Irc("x".into()).error_type(), "irc");
        assert_eq!(XdccError::Other("x".into()).error_type(), "unknown");
    }
}
