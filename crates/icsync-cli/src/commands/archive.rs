//! `icsync archive` - freeze an album folder locally

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use tokio_util::sync::CancellationToken;
use tracing::info;

use icsync_core::config::Config;
use icsync_core::domain::errors::{AppError, ArchiveError};
use icsync_core::events::EventSink;
use icsync_core::ports::RemoteLibrary;
use icsync_icloud::ICloudRemote;
use icsync_sync::{ArchiveEngine, SyncEngine};

use super::with_lock;

#[derive(Debug, Args)]
pub struct ArchiveArgs {
    /// Path of the album to archive (relative paths resolve in the data dir)
    pub path: PathBuf,

    /// Also delete the album's non-favorite assets from the remote library
    #[arg(long)]
    pub remote_delete: bool,
}

/// Syncs first so the archive freezes current state, then runs the archive.
pub async fn execute(
    config: &Config,
    args: ArchiveArgs,
    events: &EventSink,
    cancel: &CancellationToken,
) -> Result<(), AppError> {
    with_lock(config, events, || async {
        let remote = Arc::new(ICloudRemote::connect(config, events.clone()).await?);

        let engine = SyncEngine::new(remote.clone(), config, events.clone(), cancel.clone());
        engine.run().await?;

        let remote_assets = if args.remote_delete {
            remote
                .fetch_assets()
                .await
                .map_err(|e| AppError::new(ArchiveError::Failed(format!("{e:#}"))))?
        } else {
            Vec::new()
        };

        let archiver = ArchiveEngine::new(remote, config.data_dir.clone(), events.clone());
        let materialized = archiver
            .archive_path(&args.path, &remote_assets, args.remote_delete)
            .await?;

        info!(
            path = %args.path.display(),
            materialized,
            "Archive finished"
        );
        println!("Archived {} ({materialized} files)", args.path.display());
        Ok(())
    })
    .await
}
