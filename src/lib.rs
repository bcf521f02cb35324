//! Command-line XDCC downloader.
//!
//! The crate is split into the transfer core ([`xdcc`]), the outbound
//! socket factory ([`proxy`]), filename utilities ([`fsutil`]) and the
//! stdout event formatters ([`output`]). The `xdcc` binary wires these
//! together; the library surface exists so integration tests can drive
//! transfers against an in-process harness.

pub mod config;
pub mod fsutil;
pub mod output;
pub mod proxy;
pub mod xdcc;
