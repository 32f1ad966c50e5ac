//! Cron-driven daemon loop
//!
//! Parses the configured cron expression and invokes a fresh end-to-end
//! sync on every tick. A failed run is retried on a fixed backoff ladder
//! (10s, 30s, 90s) and then reported failed; the next scheduled tick is
//! unaffected either way. The scheduler keeps no state between ticks
//! beyond the timer itself.

use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use chrono::Utc;
use cron::Schedule;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use icsync_core::domain::errors::{AppError, DaemonError};
use icsync_core::events::{Event, EventSink};

use crate::engine::SyncSummary;

/// Backoff ladder for a failed scheduled run.
pub const RETRY_DELAYS: [Duration; 3] = [
    Duration::from_secs(10),
    Duration::from_secs(30),
    Duration::from_secs(90),
];

/// Cron-driven supervisor for scheduled syncs.
#[derive(Debug)]
pub struct Scheduler {
    schedule: Schedule,
    events: EventSink,
    cancel: CancellationToken,
}

impl Scheduler {
    /// Parses the cron expression (classic 5-field form accepted).
    pub fn new(
        expression: &str,
        events: EventSink,
        cancel: CancellationToken,
    ) -> Result<Self, AppError> {
        let normalized = normalize_cron(expression);
        let schedule = Schedule::from_str(&normalized).map_err(|e| {
            AppError::new(DaemonError(format!(
                "invalid schedule {expression:?}: {e}"
            )))
        })?;
        Ok(Self {
            schedule,
            events,
            cancel,
        })
    }

    /// Runs until cancelled, invoking `run_sync` on each cron tick.
    pub async fn run<F, Fut>(&self, mut run_sync: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<SyncSummary, AppError>>,
    {
        info!("Daemon scheduler starting");

        loop {
            let Some(next) = self.schedule.upcoming(Utc).next() else {
                warn!("Schedule yields no future fire time, stopping daemon");
                break;
            };
            self.events.emit(Event::Scheduled { next });
            info!(next = %next, "Next sync scheduled");

            let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.cancel.cancelled() => break,
            }

            run_with_retry(&mut run_sync, &self.events, &self.cancel, &RETRY_DELAYS).await;
        }

        info!("Daemon scheduler stopped");
    }
}

/// Runs one scheduled sync, retrying on the given backoff ladder.
///
/// Returns whether the run eventually succeeded. Interrupts abort without
/// a `Failed` event; the process is going down anyway.
async fn run_with_retry<F, Fut>(
    run_sync: &mut F,
    events: &EventSink,
    cancel: &CancellationToken,
    delays: &[Duration],
) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<SyncSummary, AppError>>,
{
    for attempt in 0..=delays.len() {
        if cancel.is_cancelled() {
            return false;
        }

        match run_sync().await {
            Ok(summary) => {
                info!(?summary, "Scheduled sync complete");
                return true;
            }
            Err(err) if err.is_interrupt() => return false,
            Err(err) if attempt < delays.len() => {
                let delay = delays[attempt];
                warn!(error = %err, delay_secs = delay.as_secs(), "Scheduled sync failed, will retry");
                events.emit(Event::Retry {
                    attempt: attempt as u32 + 1,
                    delay_secs: delay.as_secs(),
                });
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return false,
                }
            }
            Err(err) => {
                let wrapped = AppError::new(DaemonError(err.to_string()));
                warn!(error = %wrapped, "Scheduled sync failed terminally");
                events.emit(Event::Failed {
                    message: wrapped.to_string(),
                });
            }
        }
    }
    false
}

/// Accepts the classic 5-field cron form by prepending a seconds column.
fn normalize_cron(expression: &str) -> String {
    let fields = expression.split_whitespace().count();
    if fields == 5 {
        format!("0 {expression}")
    } else {
        expression.to_string()
    }
}
