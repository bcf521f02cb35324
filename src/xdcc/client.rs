//! IRC control connection.
//!
//! One persistent line-framed connection per transfer attempt, plain or
//! TLS per the current fallback mode. The connection handles the
//! protocol floor itself — registration, `PING`/`PONG`, nick collisions —
//! and surfaces everything the transfer cares about as typed
//! [`IrcEvent`]s.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time::timeout;

use super::XdccError;
use crate::config::random_nick;
use crate::proxy::Dialer;

/// TLS handshake deadline, separate from the dialer's connect timeout.
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// TLS posture of a connection attempt, in fallback order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SslMode {
    /// TLS with strict certificate verification.
    Verified,
    /// TLS, certificate and hostname checks disabled.
    Insecure,
    /// Plaintext.
    Off,
}

impl SslMode {
    pub fn is_tls(self) -> bool {
        !matches!(self, SslMode::Off)
    }

    /// Conventional IRC port for this mode, used when the URL names none.
    pub fn default_port(self) -> u16 {
        if self.is_tls() {
            6697
        } else {
            6667
        }
    }
}

impl std::fmt::Display for SslMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            SslMode::Verified => "tls",
            SslMode::Insecure => "tls-insecure",
            SslMode::Off => "plaintext",
        })
    }
}

/// One inbound line split into prefix, command, args and trailing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrcLine {
    pub prefix: Option<String>,
    pub command: String,
    pub args: Vec<String>,
    pub trailing: Option<String>,
}

impl IrcLine {
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            return None;
        }

        let (prefix, rest) = match line.strip_prefix(':') {
            Some(rest) => {
                let (prefix, rest) = rest.split_once(' ')?;
                (Some(prefix.to_string()), rest)
            }
            None => (None, line),
        };

        let (front, trailing) = match rest.split_once(" :") {
            Some((front, trailing)) => (front, Some(trailing.to_string())),
            None => (rest, None),
        };

        let mut tokens = front.split_ascii_whitespace();
        let command = tokens.next()?.to_string();
        let args = tokens.map(str::to_string).collect();

        Some(Self {
            prefix,
            command,
            args,
            trailing,
        })
    }

    /// Nick part of a `nick!user@host` prefix.
    pub fn prefix_nick(&self) -> Option<&str> {
        let prefix = self.prefix.as_deref()?;
        prefix.split(['!', '@']).next()
    }
}

/// Typed control-channel events delivered to the transfer.
#[derive(Debug)]
pub enum IrcEvent {
    /// Registration completed (001).
    Welcome,
    /// The server echoed our JOIN for this channel.
    Joined(String),
    Privmsg { from: String, text: String },
    Notice { from: String, text: String },
    /// CTCP payload with the `\x01` framing stripped.
    Ctcp { from: String, payload: String },
    /// Server-sent ERROR line. The connection usually dies right after.
    ServerError(String),
}

/// A registered IRC control connection.
pub struct IrcConnection {
    reader: BufReader<BoxedRead>,
    writer: BoxedWrite,
    nick: String,
    buf: Vec<u8>,
}

impl IrcConnection {
    /// Dials `host:port` through `dialer`, performs the TLS handshake
    /// when the mode asks for one (SNI = `host`), and sends the
    /// registration lines. The welcome arrives later as
    /// [`IrcEvent::Welcome`].
    pub async fn connect(
        dialer: &Dialer,
        host: &str,
        port: u16,
        mode: SslMode,
    ) -> Result<Self, XdccError> {
        let tcp = dialer
            .connect(host, port)
            .await
            .map_err(|e| XdccError::Network(format!("connect {}:{}: {}", host, port, e)))?;
        tracing::info!("connected to {}:{} ({})", host, port, mode);

        let (reader, writer): (BoxedRead, BoxedWrite) = if mode.is_tls() {
            let mut builder = native_tls::TlsConnector::builder();
            if mode == SslMode::Insecure {
                builder.danger_accept_invalid_certs(true);
                builder.danger_accept_invalid_hostnames(true);
            }
            let connector = builder
                .build()
                .map_err(|e| XdccError::Ssl(format!("TLS setup failed: {}", e)))?;
            let connector = tokio_native_tls::TlsConnector::from(connector);

            let tls = timeout(TLS_HANDSHAKE_TIMEOUT, connector.connect(host, tcp))
                .await
                .map_err(|_| XdccError::Ssl(format!("TLS handshake with {} timed out", host)))?
                .map_err(|e| XdccError::Ssl(format!("TLS handshake with {} failed: {}", host, e)))?;
            let (r, w) = tokio::io::split(tls);
            (Box::new(r), Box::new(w))
        } else {
            let (r, w) = tokio::io::split(tcp);
            (Box::new(r), Box::new(w))
        };

        let mut conn = Self {
            reader: BufReader::new(reader),
            writer,
            nick: random_nick(),
            buf: Vec::with_capacity(1024),
        };
        conn.register().await?;
        Ok(conn)
    }

    pub fn nick(&self) -> &str {
        &self.nick
    }

    async fn register(&mut self) -> Result<(), XdccError> {
        let nick = self.nick.clone();
        self.send_raw(&format!("NICK {}", nick)).await?;
        self.send_raw(&format!("USER {} 8 * :{}", nick, nick)).await
    }

    pub async fn send_raw(&mut self, line: &str) -> Result<(), XdccError> {
        tracing::debug!("IRC > {}", line);
        self.writer
            .write_all(format!("{}\r\n", line).as_bytes())
            .await
            .map_err(|e| XdccError::Network(format!("write error: {}", e)))?;
        self.writer
            .flush()
            .await
            .map_err(|e| XdccError::Network(format!("write error: {}", e)))
    }

    pub async fn join(&mut self, channel: &str) -> Result<(), XdccError> {
        self.send_raw(&format!("JOIN {}", channel)).await
    }

    pub async fn privmsg(&mut self, target: &str, text: &str) -> Result<(), XdccError> {
        self.send_raw(&format!("PRIVMSG {} :{}", target, text)).await
    }

    pub async fn notice(&mut self, target: &str, text: &str) -> Result<(), XdccError> {
        self.send_raw(&format!("NOTICE {} :{}", target, text)).await
    }

    pub async fn quit(&mut self, message: &str) -> Result<(), XdccError> {
        self.send_raw(&format!("QUIT :{}", message)).await
    }

    /// Reads lines until one becomes an [`IrcEvent`]. `PING` and nick
    /// collisions are answered here and never surface. Any read error
    /// or EOF is a disconnect.
    pub async fn next_event(&mut self) -> Result<IrcEvent, XdccError> {
        loop {
            let line = self.read_line().await?;
            tracing::debug!("IRC < {}", line);

            let Some(msg) = IrcLine::parse(&line) else {
                continue;
            };

            match msg.command.as_str() {
                "PING" => {
                    let token = msg
                        .trailing
                        .as_deref()
                        .or_else(|| msg.args.first().map(String::as_str))
                        .unwrap_or("");
                    self.send_raw(&format!("PONG :{}", token)).await?;
                }
                // Nickname in use: pick a fresh one and retry.
                "433" => {
                    self.nick = random_nick();
                    tracing::info!("nickname in use, retrying as {}", self.nick);
                    let nick = self.nick.clone();
                    self.send_raw(&format!("NICK {}", nick)).await?;
                }
                "001" => return Ok(IrcEvent::Welcome),
                "JOIN" => {
                    if msg.prefix_nick() == Some(self.nick.as_str()) {
                        let channel = msg
                            .trailing
                            .clone()
                            .or_else(|| msg.args.first().cloned())
                            .unwrap_or_default();
                        return Ok(IrcEvent::Joined(channel));
                    }
                }
                "PRIVMSG" | "NOTICE" => {
                    let from = msg.prefix_nick().unwrap_or_default().to_string();
                    let text = msg.trailing.clone().unwrap_or_default();
                    if let Some(payload) = ctcp_payload(&text) {
                        return Ok(IrcEvent::Ctcp {
                            from,
                            payload: payload.to_string(),
                        });
                    }
                    return Ok(if msg.command == "PRIVMSG" {
                        IrcEvent::Privmsg { from, text }
                    } else {
                        IrcEvent::Notice { from, text }
                    });
                }
                "ERROR" => {
                    return Ok(IrcEvent::ServerError(
                        msg.trailing.clone().unwrap_or_default(),
                    ))
                }
                _ => {}
            }
        }
    }

    /// Reads one CRLF line as bytes and decodes it lossily; IRC servers
    /// routinely relay non-UTF-8 data.
    async fn read_line(&mut self) -> Result<String, XdccError> {
        self.buf.clear();
        let n = self
            .reader
            .read_until(b'\n', &mut self.buf)
            .await
            .map_err(|e| XdccError::Network(format!("read error: {}", e)))?;
        if n == 0 {
            return Err(XdccError::Network("connection closed by server".into()));
        }
        Ok(String::from_utf8_lossy(&self.buf)
            .trim_end_matches(['\r', '\n'])
            .to_string())
    }
}

fn ctcp_payload(text: &str) -> Option<&str> {
    let inner = text.strip_prefix('\u{1}')?;
    Some(inner.strip_suffix('\u{1}').unwrap_or(inner))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_line() {
        let msg =
            IrcLine::parse(":bot!ident@host PRIVMSG nick42 :\u{1}DCC SEND f 1 2 3\u{1}").unwrap();
        assert_eq!(msg.prefix.as_deref(), Some("bot!ident@host"));
        assert_eq!(msg.command, "PRIVMSG");
        assert_eq!(msg.args, vec!["nick42"]);
        assert_eq!(msg.trailing.as_deref(), Some("\u{1}DCC SEND f 1 2 3\u{1}"));
        assert_eq!(msg.prefix_nick(), Some("bot"));
    }

    #[test]
    fn test_parse_no_prefix() {
        let msg = IrcLine::parse("PING :irc.example.org").unwrap();
        assert_eq!(msg.prefix, None);
        assert_eq!(msg.command, "PING");
        assert_eq!(msg.trailing.as_deref(), Some("irc.example.org"));
    }

    #[test]
    fn test_parse_numeric() {
        let msg = IrcLine::parse(":server 001 nick42 :Welcome to the network").unwrap();
        assert_eq!(msg.command, "001");
        assert_eq!(msg.args, vec!["nick42"]);
        assert_eq!(msg.trailing.as_deref(), Some("Welcome to the network"));
    }

    #[test]
    fn test_parse_args_without_trailing() {
        let msg = IrcLine::parse(":nick!u@h JOIN #channel").unwrap();
        assert_eq!(msg.command, "JOIN");
        assert_eq!(msg.args, vec!["#channel"]);
        assert_eq!(msg.trailing, None);
    }

    #[test]
    fn test_parse_server_prefix_nick() {
        let msg = IrcLine::parse(":irc.example.org NOTICE * :*** Looking up your hostname").unwrap();
        assert_eq!(msg.prefix_nick(), Some("irc.example.org"));
    }

    #[test]
    fn test_parse_empty_and_garbage() {
        assert!(IrcLine::parse("").is_none());
        assert!(IrcLine::parse("\r\n").is_none());
        assert!(IrcLine::parse(":loneprefix").is_none());
    }

    #[test]
    fn test_ctcp_payload_framing() {
        assert_eq!(
            ctcp_payload("\u{1}DCC SEND f 1 2 3\u{1}"),
            Some("DCC SEND f 1 2 3")
        );
        // tolerate a missing closing delimiter
        assert_eq!(ctcp_payload("\u{1}VERSION"), Some("VERSION"));
        assert_eq!(ctcp_payload("plain message"), None);
    }

    #[test]
    fn test_default_ports() {
        assert_eq!(SslMode::Verified.default_port(), 6697);
        assert_eq!(SslMode::Insecure.default_port(), 6697);
        assert_eq!(SslMode::Off.default_port(), 6667);
    }
}
