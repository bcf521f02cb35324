//! Event sinks: human progress bars and the JSONL stream.
//!
//! Both formatters implement [`EventSink`], one method per event
//! variant; [`dispatch`] fans a channel event out to the right one.
//! Stdout discipline: one line per write, formatter behind a single
//! lock, so concurrent transfers interleave cleanly.

use std::collections::HashMap;
use std::io::{self, Write};

use chrono::{SecondsFormat, Utc};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use crate::xdcc::event::{
    Aborted, Completed, Connected, Connecting, ErrorEvent, Finished, Progress, Retry, Started,
};
use crate::xdcc::TransferEvent;

/// One handler per event variant. Formatters implement only what they
/// render.
pub trait EventSink {
    fn connecting(&mut self, _ev: &Connecting) {}
    fn connected(&mut self, _ev: &Connected) {}
    fn started(&mut self, _ev: &Started) {}
    fn progress(&mut self, _ev: &Progress) {}
    fn completed(&mut self, _ev: &Completed) {}
    fn error(&mut self, _ev: &ErrorEvent) {}
    fn aborted(&mut self, _ev: &Aborted) {}
    fn retry(&mut self, _ev: &Retry) {}
    fn finished(&mut self, _ev: &Finished) {}
}

/// Routes an event to its handler.
pub fn dispatch(sink: &mut dyn EventSink, event: &TransferEvent) {
    match event {
        TransferEvent::Connecting(ev) => sink.connecting(ev),
        TransferEvent::Connected(ev) => sink.connected(ev),
        TransferEvent::Started(ev) => sink.started(ev),
        TransferEvent::Progress(ev) => sink.progress(ev),
        TransferEvent::Completed(ev) => sink.completed(ev),
        TransferEvent::Error(ev) => sink.error(ev),
        TransferEvent::Aborted(ev) => sink.aborted(ev),
        TransferEvent::Retry(ev) => sink.retry(ev),
        TransferEvent::Finished(ev) => sink.finished(ev),
    }
}

/// Streams every event as one minified JSON object per line with an
/// RFC3339 UTC `timestamp`, flushing after each line.
pub struct JsonlFormatter<W: Write> {
    out: W,
}

impl JsonlFormatter<io::Stdout> {
    pub fn stdout() -> Self {
        Self { out: io::stdout() }
    }
}

impl<W: Write> JsonlFormatter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    fn write_event(&mut self, event: &TransferEvent) {
        let Ok(mut value) = serde_json::to_value(event) else {
            return;
        };
        if let serde_json::Value::Object(map) = &mut value {
            map.insert(
                "timestamp".into(),
                Utc::now()
                    .to_rfc3339_opts(SecondsFormat::Millis, true)
                    .into(),
            );
        }
        // A broken pipe here means the consumer went away; nothing
        // useful to do but drop the line.
        if serde_json::to_writer(&mut self.out, &value).is_ok() {
            let _ = self.out.write_all(b"\n");
            let _ = self.out.flush();
        }
    }
}

impl<W: Write> EventSink for JsonlFormatter<W> {
    fn connecting(&mut self, ev: &Connecting) {
        self.write_event(&TransferEvent::Connecting(ev.clone()));
    }
    fn connected(&mut self, ev: &Connected) {
        self.write_event(&TransferEvent::Connected(ev.clone()));
    }
    fn started(&mut self, ev: &Started) {
        self.write_event(&TransferEvent::Started(ev.clone()));
    }
    fn progress(&mut self, ev: &Progress) {
        self.write_event(&TransferEvent::Progress(ev.clone()));
    }
    fn completed(&mut self, ev: &Completed) {
        self.write_event(&TransferEvent::Completed(ev.clone()));
    }
    fn error(&mut self, ev: &ErrorEvent) {
        self.write_event(&TransferEvent::Error(ev.clone()));
    }
    fn aborted(&mut self, ev: &Aborted) {
        self.write_event(&TransferEvent::Aborted(ev.clone()));
    }
    fn retry(&mut self, ev: &Retry) {
        self.write_event(&TransferEvent::Retry(ev.clone()));
    }
    fn finished(&mut self, ev: &Finished) {
        self.write_event(&TransferEvent::Finished(ev.clone()));
    }
}

struct BarState {
    bar: ProgressBar,
    last_bytes: u64,
}

/// Progress-bar renderer for interactive use: one bar per transfer,
/// created on `started`. Connection chatter is not rendered.
pub struct HumanFormatter {
    multi: MultiProgress,
    bars: HashMap<String, BarState>,
}

impl HumanFormatter {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: HashMap::new(),
        }
    }

    fn bar_style() -> ProgressStyle {
        ProgressStyle::with_template(
            "{msg} [{bar:40}] {bytes}/{total_bytes} {bytes_per_sec} ({eta})",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-")
    }
}

impl Default for HumanFormatter {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for HumanFormatter {
    fn started(&mut self, ev: &Started) {
        let bar = self.multi.add(ProgressBar::new(ev.file_size));
        bar.set_style(Self::bar_style());
        bar.set_message(ev.file_name.clone());
        self.bars.insert(
            ev.url.clone(),
            BarState {
                bar,
                last_bytes: 0,
            },
        );
    }

    fn progress(&mut self, ev: &Progress) {
        if let Some(state) = self.bars.get_mut(&ev.url) {
            let delta = ev.bytes_transferred.saturating_sub(state.last_bytes);
            state.bar.inc(delta);
            state.last_bytes = ev.bytes_transferred;
        }
    }

    fn completed(&mut self, ev: &Completed) {
        if let Some(state) = self.bars.get_mut(&ev.url) {
            state.bar.set_position(ev.file_size);
            state.bar.finish_with_message(format!("{} done", ev.file_name));
        }
    }

    fn aborted(&mut self, ev: &Aborted) {
        match self.bars.get_mut(&ev.url) {
            Some(state) => state.bar.abandon_with_message(format!("aborted: {}", ev.reason)),
            None => {
                let _ = self.multi.println(format!("{}: aborted: {}", ev.url, ev.reason));
            }
        }
    }

    fn error(&mut self, ev: &ErrorEvent) {
        if !ev.fatal {
            return;
        }
        match self.bars.get_mut(&ev.url) {
            Some(state) => state.bar.abandon_with_message(format!("failed: {}", ev.error)),
            None => {
                let _ = self.multi.println(format!("{}: failed: {}", ev.url, ev.error));
            }
        }
    }

    fn finished(&mut self, ev: &Finished) {
        let _ = self.multi.println(format!(
            "{} transfer(s): {} completed, {} failed",
            ev.total_transfers, ev.successful, ev.failed
        ));
    }
}
