//! CTCP payload dispatch and the DCC SEND offer parser.

use std::net::Ipv4Addr;

use super::XdccError;

/// A file offer decoded from `DCC SEND <name> <ip-u32> <port> <size>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Offer {
    pub filename: String,
    pub ipv4: Ipv4Addr,
    pub port: u16,
    pub size: u64,
}

/// A CTCP payload with the `\x01` framing already stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CtcpMessage {
    /// `VERSION` query; answered, otherwise ignored.
    Version,
    /// A parsed file offer.
    DccSend(Offer),
    /// Anything else (ACTION, PING, unknown DCC subcommands).
    Other,
}

/// Dispatches a CTCP payload on its first token. Only a malformed
/// `DCC SEND` is an error; unknown CTCP commands are [`CtcpMessage::Other`].
pub fn parse_ctcp(payload: &str) -> Result<CtcpMessage, XdccError> {
    let trimmed = payload.trim();
    let mut tokens = trimmed.splitn(2, char::is_whitespace);

    match tokens.next() {
        Some("VERSION") => Ok(CtcpMessage::Version),
        // The offer may arrive as "DCC SEND ..." or bare "SEND ..."
        Some("DCC") => match tokens.next().map(str::trim_start) {
            Some(rest) => parse_after_dcc(rest),
            None => Ok(CtcpMessage::Other),
        },
        Some("SEND") => tokens
            .next()
            .map(|rest| parse_send(rest).map(CtcpMessage::DccSend))
            .unwrap_or_else(|| Err(XdccError::Parse("DCC SEND with no arguments".into()))),
        _ => Ok(CtcpMessage::Other),
    }
}

fn parse_after_dcc(rest: &str) -> Result<CtcpMessage, XdccError> {
    let mut tokens = rest.splitn(2, char::is_whitespace);
    match tokens.next() {
        Some("SEND") => tokens
            .next()
            .map(|args| parse_send(args).map(CtcpMessage::DccSend))
            .unwrap_or_else(|| Err(XdccError::Parse("DCC SEND with no arguments".into()))),
        _ => Ok(CtcpMessage::Other),
    }
}

/// Parses the four `SEND` arguments: `<filename> <ip-as-u32> <port> <size>`.
/// Filenames containing spaces arrive double-quoted. The IP is expanded
/// from big-endian byte order.
fn parse_send(args: &str) -> Result<Offer, XdccError> {
    let args = args.trim();

    let (filename, rest) = if let Some(stripped) = args.strip_prefix('"') {
        let end = stripped
            .find('"')
            .ok_or_else(|| XdccError::Parse("unterminated quoted filename in DCC SEND".into()))?;
        (stripped[..end].to_string(), &stripped[end + 1..])
    } else {
        match args.split_once(char::is_whitespace) {
            Some((name, rest)) => (name.to_string(), rest),
            None => {
                return Err(XdccError::Parse(format!(
                    "DCC SEND expects <file> <ip> <port> <size>, got: {}",
                    args
                )))
            }
        }
    };

    if filename.is_empty() {
        return Err(XdccError::Parse("DCC SEND has an empty filename".into()));
    }

    let fields: Vec<&str> = rest.split_whitespace().collect();
    if fields.len() != 3 {
        return Err(XdccError::Parse(format!(
            "DCC SEND expects <file> <ip> <port> <size>, got {} trailing fields",
            fields.len()
        )));
    }

    let ip_raw = fields[0]
        .parse::<u32>()
        .map_err(|_| XdccError::Parse(format!("invalid IP in DCC SEND: {}", fields[0])))?;
    let port = fields[1]
        .parse::<u16>()
        .map_err(|_| XdccError::Parse(format!("invalid port in DCC SEND: {}", fields[1])))?;
    let size = fields[2]
        .parse::<u64>()
        .map_err(|_| XdccError::Parse(format!("invalid size in DCC SEND: {}", fields[2])))?;

    Ok(Offer {
        filename,
        ipv4: Ipv4Addr::from(ip_raw),
        port,
        size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_send() {
        let msg = parse_ctcp("SEND filename.bin 3232235521 9000 1048576").unwrap();
        let CtcpMessage::DccSend(offer) = msg else {
            panic!("expected DccSend, got {msg:?}");
        };
        assert_eq!(offer.filename, "filename.bin");
        assert_eq!(offer.ipv4, Ipv4Addr::new(192, 168, 0, 1));
        assert_eq!(offer.port, 9000);
        assert_eq!(offer.size, 1048576);
    }

    #[test]
    fn test_parse_dcc_send_prefix() {
        let msg = parse_ctcp("DCC SEND file.mkv 2130706433 5000 42").unwrap();
        let CtcpMessage::DccSend(offer) = msg else {
            panic!("expected DccSend, got {msg:?}");
        };
        assert_eq!(offer.ipv4, Ipv4Addr::LOCALHOST);
        assert_eq!(offer.port, 5000);
        assert_eq!(offer.size, 42);
    }

    #[test]
    fn test_parse_quoted_filename() {
        let msg = parse_ctcp("DCC SEND \"name with spaces.mkv\" 16909060 1234 99").unwrap();
        let CtcpMessage::DccSend(offer) = msg else {
            panic!("expected DccSend, got {msg:?}");
        };
        assert_eq!(offer.filename, "name with spaces.mkv");
        assert_eq!(offer.ipv4, Ipv4Addr::new(1, 2, 3, 4));
    }

    #[test]
    fn test_wrong_arity_fails() {
        assert!(parse_ctcp("SEND a b c").is_err());
        assert!(parse_ctcp("SEND file.bin 1 2 3 4").is_err());
        assert!(parse_ctcp("DCC SEND file.bin").is_err());
    }

    #[test]
    fn test_non_numeric_fields_fail() {
        assert!(parse_ctcp("SEND file.bin notanip 9000 10").is_err());
        assert!(parse_ctcp("SEND file.bin 3232235521 bad 10").is_err());
        assert!(parse_ctcp("SEND file.bin 3232235521 9000 huge").is_err());
        // port out of u16 range
        assert!(parse_ctcp("SEND file.bin 3232235521 99999 10").is_err());
    }

    #[test]
    fn test_version_and_other() {
        assert_eq!(parse_ctcp("VERSION").unwrap(), CtcpMessage::Version);
        assert_eq!(parse_ctcp("PING 12345").unwrap(), CtcpMessage::Other);
        assert_eq!(parse_ctcp("DCC CHAT chat 1 2").unwrap(), CtcpMessage::Other);
        assert_eq!(parse_ctcp("ACTION waves").unwrap(), CtcpMessage::Other);
    }
}
