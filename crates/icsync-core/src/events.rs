//! Typed lifecycle and warning event stream
//!
//! Components report progress and non-fatal problems through a single typed
//! channel instead of loosely named emitter events. The top-level supervisor
//! owns the receiving end; everything else holds a cheap [`EventSink`] clone.

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::warn;

use crate::domain::errors::AppError;

/// Events emitted over the lifetime of a sync or daemon run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Daemon computed the next fire time
    Scheduled { next: DateTime<Utc> },
    /// A sync run began
    RunStarted,
    /// A sync run completed successfully
    Done {
        assets_added: usize,
        assets_removed: usize,
        albums_changed: usize,
    },
    /// A failed run will be retried after a backoff
    Retry { attempt: u32, delay_secs: u64 },
    /// A run failed terminally (the next scheduled tick is unaffected)
    Failed { message: String },
    /// MFA input is being awaited on the intake server
    MfaAwaited { port: u16 },
    /// A non-fatal problem was observed and handled
    Warning { area: &'static str, message: String },
}

/// Cloneable sending half of the event stream.
///
/// Sending never blocks and never fails the caller: when the supervisor has
/// gone away the event is dropped after a log line.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<Event>,
}

impl EventSink {
    /// Creates a sink together with its receiving end.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// A sink with no receiver, for tests and fire-and-forget contexts.
    pub fn disconnected() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self { tx }
    }

    pub fn emit(&self, event: Event) {
        if self.tx.send(event).is_err() {
            warn!("Event receiver gone, dropping event");
        }
    }

    /// Surfaces a warning-severity error as an [`Event::Warning`].
    pub fn warn(&self, err: &AppError) {
        self.emit(Event::Warning {
            area: err.kind.area(),
            message: err.to_string(),
        });
    }
}
