//! Connection-flavor fallback.
//!
//! A transfer tries TLS with verification, TLS without, then plaintext,
//! in that order. Successive attempts are fresh [`Transfer`] instances
//! wired into the same event channel, so the consumer sees one
//! continuous stream. The ladder demotes only when an attempt fails to
//! establish its first control connection; an attempt that got going
//! and then died has already produced its own terminal event.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::client::SslMode;
use super::event::{self, EventTx, TransferEvent};
use super::transfer::{AttemptEnd, Transfer};
use super::{XdccError, XdccUrl};
use crate::config::Config;
use crate::proxy::Dialer;

const FALLBACK_LADDER: [SslMode; 3] = [SslMode::Verified, SslMode::Insecure, SslMode::Off];

/// Terminal outcome of a transfer after the full fallback ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    Completed,
    Failed,
}

/// Runs one transfer through the fallback ladder (or only strict TLS
/// under `ssl_only`), resolving once a terminal event has been emitted.
/// Cancelling `cancel` aborts the in-flight attempt with an `aborted`
/// event.
pub async fn run_with_fallback(
    url: XdccUrl,
    config: Arc<Config>,
    dialer: Arc<Dialer>,
    events: EventTx,
    cancel: CancellationToken,
) -> TransferOutcome {
    let modes: &[SslMode] = if config.ssl_only {
        &FALLBACK_LADDER[..1]
    } else {
        &FALLBACK_LADDER[..]
    };

    let mut last_error: Option<XdccError> = None;
    for &mode in modes {
        // The transfer gets the same token so its spawned data task
        // shuts down too; dropping `run()` alone would leave that task
        // holding the event channel open.
        let mut transfer = Transfer::new(
            url.clone(),
            config.clone(),
            dialer.clone(),
            events.clone(),
            mode,
            cancel.clone(),
        );

        let end = tokio::select! {
            end = transfer.run() => end,
            _ = cancel.cancelled() => {
                events.emit(TransferEvent::Aborted(event::Aborted {
                    url: url.to_url(),
                    reason: "interrupted".into(),
                }));
                return TransferOutcome::Failed;
            }
        };

        match end {
            AttemptEnd::Finished(true) => return TransferOutcome::Completed,
            AttemptEnd::Finished(false) => return TransferOutcome::Failed,
            AttemptEnd::StartFailed(e) => {
                tracing::info!("{} connection to {} failed: {}", mode, url.network, e);
                last_error = Some(e);
            }
        }
    }

    events.emit(TransferEvent::Aborted(event::Aborted {
        url: url.to_url(),
        reason: last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "connection failed".into()),
    }));
    TransferOutcome::Failed
}
