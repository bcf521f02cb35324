//! Transfer state machine.
//!
//! One [`Transfer`] per fallback attempt drives connect → join →
//! request → receive over a single control connection, spawning the DCC
//! data receive onto its own task once the bot's offer arrives. The
//! transfer owns its control connection, data socket, file handle and
//! event channel; nothing else touches them.

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use super::client::{IrcConnection, IrcEvent, SslMode};
use super::dcc::{self, CtcpMessage, Offer};
use super::event::{self, EventTx, TransferEvent};
use super::{XdccError, XdccUrl};
use crate::config::Config;
use crate::fsutil;
use crate::proxy::Dialer;

/// Read buffer for the DCC data socket. Bots send short packets; a
/// small buffer keeps progress accounting prompt.
const RECV_BUF_SIZE: usize = 1024;

/// Lifecycle phase of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TransferPhase {
    Init,
    Connecting,
    Connected,
    Joined,
    Requested,
    Receiving,
    Completed,
    Aborted,
}

/// Mutable per-transfer bookkeeping, touched only by the transfer's own
/// task.
#[derive(Debug)]
pub struct TransferState {
    pub phase: TransferPhase,
    pub conn_attempts: u32,
    pub started_at: Option<Instant>,
    pub bytes_received: u64,
    pub total_bytes: u64,
    pub ssl_mode: SslMode,
}

/// Sliding one-second window over the data socket's reads.
#[derive(Debug)]
pub struct SpeedMeter {
    window_start: Instant,
    window_bytes: u64,
    cum_bytes: u64,
}

impl SpeedMeter {
    pub fn new() -> Self {
        Self {
            window_start: Instant::now(),
            window_bytes: 0,
            cum_bytes: 0,
        }
    }

    /// Records `n` received bytes. Returns the window rate in bytes/s
    /// once the current window exceeds one second, then starts a new
    /// window.
    pub fn add(&mut self, n: u64) -> Option<f64> {
        self.window_bytes += n;
        self.cum_bytes += n;

        let elapsed = self.window_start.elapsed();
        if elapsed < Duration::from_secs(1) {
            return None;
        }
        let rate = self.window_bytes as f64 / elapsed.as_secs_f64();
        self.window_start = Instant::now();
        self.window_bytes = 0;
        Some(rate)
    }

    pub fn cumulative(&self) -> u64 {
        self.cum_bytes
    }
}

impl Default for SpeedMeter {
    fn default() -> Self {
        Self::new()
    }
}

/// How a single fallback attempt ended.
#[derive(Debug)]
pub enum AttemptEnd {
    /// The attempt ran to a terminal event; `true` means the file
    /// arrived in full.
    Finished(bool),
    /// The first control connection could not be established. The
    /// fallback ladder may demote to the next mode.
    StartFailed(XdccError),
}

enum ControlEnd {
    DataStarted(JoinHandle<Result<(), XdccError>>),
    Fatal(XdccError),
    Disconnected(String),
}

/// A single transfer attempt in one TLS mode.
pub struct Transfer {
    url: XdccUrl,
    config: Arc<Config>,
    dialer: Arc<Dialer>,
    events: EventTx,
    /// Cancelling this stops the spawned data task as well; the task
    /// would otherwise outlive a dropped `run()` future.
    cancel: CancellationToken,
    state: TransferState,
    /// Set once the DCC receive has been spawned; a re-join after a
    /// control reconnect must not issue a second `xdcc send`. Only the
    /// control-reader path writes this.
    started: bool,
}

impl Transfer {
    pub fn new(
        url: XdccUrl,
        config: Arc<Config>,
        dialer: Arc<Dialer>,
        events: EventTx,
        ssl_mode: SslMode,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            url,
            config,
            dialer,
            events,
            cancel,
            state: TransferState {
                phase: TransferPhase::Init,
                conn_attempts: 0,
                started_at: None,
                bytes_received: 0,
                total_bytes: 0,
                ssl_mode,
            },
            started: false,
        }
    }

    pub fn state(&self) -> &TransferState {
        &self.state
    }

    /// Runs this attempt to a terminal event, reconnecting the control
    /// channel within the retry budget. Only a failure to establish the
    /// first connection is reported as [`AttemptEnd::StartFailed`].
    pub async fn run(&mut self) -> AttemptEnd {
        self.state.phase = TransferPhase::Connecting;
        self.events.emit(TransferEvent::Connecting(event::Connecting {
            url: self.url.to_url(),
            network: self.url.network.clone(),
            channel: self.url.channel.clone(),
            bot: self.url.bot.clone(),
            slot: self.url.slot,
            ssl: self.state.ssl_mode.is_tls(),
        }));

        let mut conn = match self.connect_control().await {
            Ok(conn) => conn,
            Err(e) => return AttemptEnd::StartFailed(e),
        };

        loop {
            match self.drive_control(&mut conn).await {
                ControlEnd::DataStarted(handle) => {
                    return match self.ride_data(&mut conn, handle).await {
                        Ok(()) => {
                            self.state.phase = TransferPhase::Completed;
                            self.state.bytes_received = self.state.total_bytes;
                            let _ = conn.quit("transfer complete").await;
                            AttemptEnd::Finished(true)
                        }
                        Err(e) => {
                            self.emit_fatal(e);
                            AttemptEnd::Finished(false)
                        }
                    };
                }
                ControlEnd::Fatal(e) => {
                    self.emit_fatal(e);
                    return AttemptEnd::Finished(false);
                }
                ControlEnd::Disconnected(reason) => match self.reconnect(reason).await {
                    Some(new_conn) => conn = new_conn,
                    None => return AttemptEnd::Finished(false),
                },
            }
        }
    }

    async fn connect_control(&self) -> Result<IrcConnection, XdccError> {
        let port = self
            .url
            .port
            .unwrap_or_else(|| self.state.ssl_mode.default_port());
        IrcConnection::connect(&self.dialer, &self.url.network, port, self.state.ssl_mode).await
    }

    /// Drives the control connection until the DCC receive starts, a
    /// fatal error occurs, or the connection drops.
    async fn drive_control(&mut self, conn: &mut IrcConnection) -> ControlEnd {
        loop {
            let ev = match conn.next_event().await {
                Ok(ev) => ev,
                Err(e) => return ControlEnd::Disconnected(e.to_string()),
            };

            match ev {
                IrcEvent::Welcome => {
                    self.state.conn_attempts = 0;
                    self.state.phase = TransferPhase::Connected;
                    self.events.emit(TransferEvent::Connected(event::Connected {
                        url: self.url.to_url(),
                    }));
                    if let Err(e) = conn.join(&self.url.channel).await {
                        return ControlEnd::Disconnected(e.to_string());
                    }
                }
                IrcEvent::Joined(channel) => {
                    if channel.eq_ignore_ascii_case(&self.url.channel) && !self.started {
                        self.state.phase = TransferPhase::Joined;
                        tracing::info!("joined {}, requesting pack #{}", channel, self.url.slot);
                        let request = format!("xdcc send #{}", self.url.slot);
                        if let Err(e) = conn.privmsg(&self.url.bot, &request).await {
                            return ControlEnd::Disconnected(e.to_string());
                        }
                        self.state.phase = TransferPhase::Requested;
                    }
                }
                IrcEvent::Ctcp { from, payload } => match dcc::parse_ctcp(&payload) {
                    Ok(CtcpMessage::Version) => {
                        let reply =
                            format!("\u{1}VERSION xdcc-cli {}\u{1}", env!("CARGO_PKG_VERSION"));
                        if let Err(e) = conn.notice(&from, &reply).await {
                            return ControlEnd::Disconnected(e.to_string());
                        }
                    }
                    Ok(CtcpMessage::DccSend(offer)) => {
                        if self.started {
                            tracing::warn!("duplicate DCC SEND from {}, ignoring", from);
                            continue;
                        }
                        tracing::info!(
                            "DCC SEND from {}: {} ({} bytes) at {}:{}",
                            from,
                            offer.filename,
                            offer.size,
                            offer.ipv4,
                            offer.port
                        );
                        match self.begin_receive(offer).await {
                            Ok(handle) => return ControlEnd::DataStarted(handle),
                            Err(e) => return ControlEnd::Fatal(e),
                        }
                    }
                    Ok(CtcpMessage::Other) => {}
                    Err(e) => return ControlEnd::Fatal(e),
                },
                IrcEvent::Notice { from, text } => {
                    if from.eq_ignore_ascii_case(&self.url.bot) {
                        tracing::info!("notice from {}: {}", from, text);
                    }
                }
                IrcEvent::Privmsg { .. } => {}
                IrcEvent::ServerError(message) => {
                    self.events.emit(TransferEvent::Error(event::ErrorEvent {
                        url: self.url.to_url(),
                        error: message,
                        error_type: "irc".into(),
                        fatal: false,
                    }));
                }
            }
        }
    }

    /// Waits for the data task while keeping the control connection
    /// serviced. A control drop at this point is tolerated: the data
    /// socket is independent.
    async fn ride_data(
        &mut self,
        conn: &mut IrcConnection,
        mut handle: JoinHandle<Result<(), XdccError>>,
    ) -> Result<(), XdccError> {
        loop {
            tokio::select! {
                res = &mut handle => return flatten_join(res),
                ev = conn.next_event() => match ev {
                    Ok(IrcEvent::ServerError(message)) => {
                        self.events.emit(TransferEvent::Error(event::ErrorEvent {
                            url: self.url.to_url(),
                            error: message,
                            error_type: "irc".into(),
                            fatal: false,
                        }));
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!("control connection lost mid-transfer ({}), riding out the data socket", e);
                        return flatten_join((&mut handle).await);
                    }
                },
            }
        }
    }

    /// Opens the target file and the data socket, then spawns the
    /// receive loop. `Started`, `Progress` and `Completed` are all
    /// emitted from that task.
    async fn begin_receive(
        &mut self,
        offer: Offer,
    ) -> Result<JoinHandle<Result<(), XdccError>>, XdccError> {
        let filename = if self.config.sanitize_filenames {
            fsutil::sanitize_filename(&offer.filename)
        } else {
            offer.filename.clone()
        };
        let path = self.config.out_dir.join(&filename);

        // Append, never truncate: a pre-existing file grows.
        let mut options = tokio::fs::OpenOptions::new();
        options.append(true).create(true);
        #[cfg(unix)]
        options.mode(0o644);
        let file = options
            .open(&path)
            .await
            .map_err(|e| XdccError::File(format!("open {}: {}", path.display(), e)))?;

        // No TLS on the data path.
        let stream = self
            .dialer
            .connect(&offer.ipv4.to_string(), offer.port)
            .await
            .map_err(|e| {
                XdccError::Network(format!("DCC connect {}:{}: {}", offer.ipv4, offer.port, e))
            })?;

        self.started = true;
        self.state.phase = TransferPhase::Receiving;
        self.state.total_bytes = offer.size;
        self.state.started_at = Some(Instant::now());

        let events = self.events.clone();
        let url = self.url.to_url();
        let cancel = self.cancel.clone();
        Ok(tokio::spawn(receive_data(
            stream, file, offer, filename, path, events, url, cancel,
        )))
    }

    async fn reconnect(&mut self, mut reason: String) -> Option<IrcConnection> {
        loop {
            self.state.conn_attempts += 1;
            if self.state.conn_attempts > self.config.max_conn_attempts {
                self.state.phase = TransferPhase::Aborted;
                self.events.emit(TransferEvent::Aborted(event::Aborted {
                    url: self.url.to_url(),
                    reason: format!(
                        "giving up after {} connection attempts: {}",
                        self.config.max_conn_attempts, reason
                    ),
                }));
                return None;
            }

            self.events.emit(TransferEvent::Retry(event::Retry {
                url: self.url.to_url(),
                attempt: self.state.conn_attempts,
                max_attempts: self.config.max_conn_attempts,
                reason: reason.clone(),
            }));
            sleep(self.config.reconnect_delay).await;

            self.state.phase = TransferPhase::Connecting;
            match self.connect_control().await {
                Ok(conn) => return Some(conn),
                Err(e) => reason = e.to_string(),
            }
        }
    }

    fn emit_fatal(&mut self, error: XdccError) {
        self.state.phase = TransferPhase::Aborted;
        self.events.emit(TransferEvent::Error(event::ErrorEvent {
            url: self.url.to_url(),
            error: error.to_string(),
            error_type: error.error_type().into(),
            fatal: true,
        }));
    }
}

fn flatten_join(res: Result<Result<(), XdccError>, tokio::task::JoinError>) -> Result<(), XdccError> {
    match res {
        Ok(inner) => inner,
        Err(e) => Err(XdccError::Other(format!("data task failed: {}", e))),
    }
}

/// DCC data receive loop. Reads until the announced size has arrived,
/// acking cumulative progress, and emits the `Started`/`Progress`/
/// `Completed` bookends in order. The loop races every read against
/// `cancel` so an interrupt stops the task and releases its event
/// channel even after the owning transfer future is gone.
#[allow(clippy::too_many_arguments)]
async fn receive_data(
    mut stream: TcpStream,
    mut file: File,
    offer: Offer,
    filename: String,
    path: PathBuf,
    events: EventTx,
    url: String,
    cancel: CancellationToken,
) -> Result<(), XdccError> {
    events.emit(TransferEvent::Started(event::Started {
        url: url.clone(),
        file_name: filename.clone(),
        file_size: offer.size,
        file_path: path.display().to_string(),
    }));

    let started_at = Instant::now();
    let mut meter = SpeedMeter::new();
    let mut buf = [0u8; RECV_BUF_SIZE];

    while meter.cumulative() < offer.size {
        let n = tokio::select! {
            res = stream.read(&mut buf) => {
                res.map_err(|e| XdccError::Network(format!("data read: {}", e)))?
            }
            _ = cancel.cancelled() => {
                tracing::info!(
                    "interrupted after {} of {} bytes, closing data socket",
                    meter.cumulative(),
                    offer.size
                );
                let _ = file.flush().await;
                return Err(XdccError::Other("interrupted".into()));
            }
        };
        if n == 0 {
            return Err(XdccError::Network(format!(
                "data connection closed after {} of {} bytes",
                meter.cumulative(),
                offer.size
            )));
        }

        // Never write past the announced size.
        let take = n.min((offer.size - meter.cumulative()) as usize);
        file.write_all(&buf[..take])
            .await
            .map_err(|e| XdccError::File(format!("write {}: {}", path.display(), e)))?;

        let rate = meter.add(take as u64);

        // Cumulative acknowledgement, big-endian. Advisory; many bots
        // never read it.
        let ack = (meter.cumulative() as u32).to_be_bytes();
        let _ = stream.write_all(&ack).await;

        if let Some(rate) = rate {
            let percentage = if offer.size > 0 {
                meter.cumulative() as f64 / offer.size as f64 * 100.0
            } else {
                0.0
            };
            events.emit(TransferEvent::Progress(event::Progress {
                url: url.clone(),
                bytes_transferred: meter.cumulative(),
                total_bytes: offer.size,
                percentage,
                transfer_rate: rate,
            }));
        }
    }

    file.flush()
        .await
        .map_err(|e| XdccError::File(format!("flush {}: {}", path.display(), e)))?;

    let duration = started_at.elapsed().as_secs_f64();
    let avg_rate = if duration > 0.0 {
        offer.size as f64 / duration
    } else {
        0.0
    };
    tracing::info!(
        "transfer complete: {} ({} bytes in {:.1}s, {:.1} KB/s)",
        filename,
        offer.size,
        duration,
        avg_rate / 1024.0
    );

    events.emit(TransferEvent::Completed(event::Completed {
        url,
        file_name: filename,
        file_size: offer.size,
        file_path: path.display().to_string(),
        duration,
        avg_rate,
    }));

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_ordering() {
        assert!(TransferPhase::Init < TransferPhase::Connecting);
        assert!(TransferPhase::Connected < TransferPhase::Joined);
        assert!(TransferPhase::Requested < TransferPhase::Receiving);
        assert!(TransferPhase::Receiving < TransferPhase::Completed);
    }

    #[test]
    fn test_speed_meter_below_window() {
        let mut meter = SpeedMeter::new();
        assert_eq!(meter.add(100), None);
        assert_eq!(meter.add(50), None);
        assert_eq!(meter.cumulative(), 150);
    }

    #[test]
    fn test_speed_meter_window_rolls() {
        let mut meter = SpeedMeter::new();
        meter.add(512);
        std::thread::sleep(Duration::from_millis(1050));
        let rate = meter.add(512).expect("window should have rolled");
        // ~1024 bytes over ~1.05s
        assert!(rate > 500.0 && rate < 1100.0, "rate: {rate}");
        assert_eq!(meter.cumulative(), 1024);
        // new window starts empty
        assert_eq!(meter.add(1), None);
    }
}
