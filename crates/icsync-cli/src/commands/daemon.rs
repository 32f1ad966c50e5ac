//! `icsync daemon` - run syncs on a cron schedule

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use icsync_core::config::Config;
use icsync_core::domain::errors::AppError;
use icsync_core::events::EventSink;
use icsync_icloud::ICloudRemote;
use icsync_sync::{Scheduler, SyncEngine};

use super::with_lock;

/// Holds the lock for the process lifetime and syncs on every cron tick.
pub async fn execute(
    config: &Config,
    events: &EventSink,
    cancel: &CancellationToken,
) -> Result<(), AppError> {
    // Parse the schedule before authenticating; a bad expression should
    // fail fast.
    let scheduler = Scheduler::new(&config.schedule, events.clone(), cancel.clone())?;

    with_lock(config, events, || async {
        let remote = Arc::new(ICloudRemote::connect(config, events.clone()).await?);
        let engine = Arc::new(SyncEngine::new(
            remote,
            config,
            events.clone(),
            cancel.clone(),
        ));

        info!(schedule = config.schedule, "Daemon running");
        scheduler
            .run(|| {
                let engine = engine.clone();
                async move { engine.run().await }
            })
            .await;
        Ok(())
    })
    .await
}
