//! Transfer event stream.
//!
//! Transfers publish [`TransferEvent`] values on a bounded channel; the
//! output formatters consume them in production order. The channel is
//! lossy on overflow: progress events are regenerable (the next one
//! supersedes the last), so a slow consumer drops events instead of
//! back-pressuring the download.

use serde::Serialize;
use tokio::sync::mpsc;

/// Capacity of a transfer's event channel. Large enough that bursty
/// progress traffic does not push the non-idempotent bookend events
/// (`started`, `completed`, `aborted`) off the end.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Events emitted during an XDCC transfer, plus the batch-level
/// `finished` summary. Serializes to the JSONL wire shape (the
/// formatter adds the `timestamp` field).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransferEvent {
    Connecting(Connecting),
    Connected(Connected),
    Started(Started),
    Progress(Progress),
    Completed(Completed),
    Error(ErrorEvent),
    Aborted(Aborted),
    Retry(Retry),
    Finished(Finished),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Connecting {
    pub url: String,
    pub network: String,
    pub channel: String,
    pub bot: String,
    pub slot: u32,
    pub ssl: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Connected {
    pub url: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Started {
    pub url: String,
    pub file_name: String,
    pub file_size: u64,
    pub file_path: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub url: String,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    pub percentage: f64,
    /// Current window rate in bytes per second.
    pub transfer_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Completed {
    pub url: String,
    pub file_name: String,
    pub file_size: u64,
    pub file_path: String,
    /// Wall-clock seconds between `started` and completion.
    pub duration: f64,
    /// Average rate in bytes per second over the whole transfer.
    pub avg_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEvent {
    pub url: String,
    pub error: String,
    /// One of: network, irc, file, parse, ssl, unknown.
    pub error_type: String,
    pub fatal: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Aborted {
    pub url: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Retry {
    pub url: String,
    pub attempt: u32,
    pub max_attempts: u32,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Finished {
    pub total_transfers: usize,
    pub successful: usize,
    pub failed: usize,
}

impl TransferEvent {
    /// Variant name as it appears on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            TransferEvent::Connecting(_) => "connecting",
            TransferEvent::Connected(_) => "connected",
            TransferEvent::Started(_) => "started",
            TransferEvent::Progress(_) => "progress",
            TransferEvent::Completed(_) => "completed",
            TransferEvent::Error(_) => "error",
            TransferEvent::Aborted(_) => "aborted",
            TransferEvent::Retry(_) => "retry",
            TransferEvent::Finished(_) => "finished",
        }
    }
}

/// Producer half of a transfer's event channel.
#[derive(Debug, Clone)]
pub struct EventTx {
    tx: mpsc::Sender<TransferEvent>,
}

/// Creates an event channel with the standard capacity.
pub fn channel() -> (EventTx, mpsc::Receiver<TransferEvent>) {
    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    (EventTx { tx }, rx)
}

impl EventTx {
    /// Non-blocking send. A full channel drops the event; a closed one
    /// (consumer gone) discards it silently.
    pub fn emit(&self, event: TransferEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(ev)) => {
                tracing::debug!("event channel full, dropping {} event", ev.kind());
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shape() {
        let ev = TransferEvent::Started(Started {
            url: "irc://net/chan/bot/1".into(),
            file_name: "file.bin".into(),
            file_size: 1024,
            file_path: "/tmp/file.bin".into(),
        });
        let value = serde_json::to_value(&ev).unwrap();
        assert_eq!(value["type"], "started");
        assert_eq!(value["fileName"], "file.bin");
        assert_eq!(value["fileSize"], 1024);
        assert_eq!(value["filePath"], "/tmp/file.bin");
    }

    #[test]
    fn test_error_event_shape() {
        let ev = TransferEvent::Error(ErrorEvent {
            url: "irc://net/chan/bot/1".into(),
            error: "boom".into(),
            error_type: "network".into(),
            fatal: true,
        });
        let value = serde_json::to_value(&ev).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["errorType"], "network");
        assert_eq!(value["fatal"], true);
    }

    #[tokio::test]
    async fn test_channel_drops_on_overflow() {
        let (tx, mut rx) = channel();
        for i in 0..(EVENT_CHANNEL_CAPACITY + 50) {
            tx.emit(TransferEvent::Progress(Progress {
                url: "irc://net/chan/bot/1".into(),
                bytes_transferred: i as u64,
                total_bytes: 0,
                percentage: 0.0,
                transfer_rate: 0.0,
            }));
        }
        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, EVENT_CHANNEL_CAPACITY);
    }
}
