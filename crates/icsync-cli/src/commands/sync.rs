//! `icsync sync` - run one full synchronization

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use icsync_core::config::Config;
use icsync_core::domain::errors::AppError;
use icsync_core::events::EventSink;
use icsync_icloud::ICloudRemote;
use icsync_sync::SyncEngine;

use super::with_lock;

pub async fn execute(
    config: &Config,
    events: &EventSink,
    cancel: &CancellationToken,
) -> Result<(), AppError> {
    with_lock(config, events, || async {
        let remote = Arc::new(ICloudRemote::connect(config, events.clone()).await?);
        let engine = SyncEngine::new(remote, config, events.clone(), cancel.clone());

        let summary = engine.run().await?;
        info!(
            added = summary.assets_added,
            removed = summary.assets_removed,
            skipped = summary.assets_skipped,
            albums = summary.albums_changed,
            links = summary.links_changed,
            "Synchronization finished"
        );
        println!(
            "Synced: {} added, {} removed, {} skipped, {} album ops",
            summary.assets_added,
            summary.assets_removed,
            summary.assets_skipped,
            summary.albums_changed
        );
        Ok(())
    })
    .await
}
