//! The sync transaction
//!
//! One [`SyncEngine::run`] call is the transaction. All intermediate state
//! lives in the filesystem, so a crashed or interrupted sync is safely
//! re-runnable: the next run rebuilds the local projection, recomputes the
//! plan and only performs whatever is still missing.
//!
//! ## Phases
//!
//! 1. Downloads, in parallel with bounded concurrency. Each download is
//!    temp-write / size-verify / rename / mtime. Expired signed URLs
//!    (410/403) trigger a record re-fetch; persistent failures skip the
//!    asset with a warning and the run continues.
//! 2. Album operations: create (parent-first), unstash, move, stash,
//!    relocate to Lost+Found, delete.
//! 3. Album link reconciliation.
//! 4. Asset removals, last, once nothing references them.
//!
//! Phase boundaries are barriers and cancellation points. A fatal error
//! retries the whole sync up to `max_retries` times with refreshed auth.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use icsync_core::config::Config;
use icsync_core::domain::errors::{
    AppError, InterruptError, LibraryError, SyncError, SyncWarning,
};
use icsync_core::domain::Asset;
use icsync_core::events::{Event, EventSink};
use icsync_core::ports::RemoteLibrary;
use icsync_library::{AlbumTree, AssetStore, PhotosLibrary};

use crate::diff::{compute_plan, SyncPlan};

/// Per-asset download attempts before the asset is skipped.
const DOWNLOAD_RETRIES: u32 = 4;

/// Base delay for the per-asset exponential backoff.
const BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Summary of one completed sync.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub assets_added: usize,
    pub assets_skipped: usize,
    pub assets_removed: usize,
    pub albums_changed: usize,
    pub links_changed: usize,
}

impl SyncSummary {
    /// True when the sync performed zero filesystem mutations.
    pub fn is_noop(&self) -> bool {
        *self == Self::default()
    }
}

/// Outcome of one asset download.
enum DownloadOutcome {
    Done,
    Skipped(String),
}

/// The sync engine. Owns the local projection for the duration of a run.
pub struct SyncEngine {
    remote: Arc<dyn RemoteLibrary>,
    root: PathBuf,
    download_threads: usize,
    max_retries: u32,
    events: EventSink,
    cancel: CancellationToken,
}

impl SyncEngine {
    pub fn new(
        remote: Arc<dyn RemoteLibrary>,
        config: &Config,
        events: EventSink,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            remote,
            root: config.data_dir.clone(),
            download_threads: config.download_threads,
            max_retries: config.max_retries,
            events,
            cancel,
        }
    }

    /// Runs the sync, retrying a fatal failure up to `max_retries` times
    /// with refreshed authentication in between. Interrupts never retry.
    pub async fn run(&self) -> Result<SyncSummary, AppError> {
        let mut last_error: Option<AppError> = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                warn!(attempt, "Retrying sync with refreshed session");
                self.remote.reauthenticate().await.map_err(to_app_error)?;
            }

            match self.sync_once().await {
                Ok(summary) => {
                    self.events.emit(Event::Done {
                        assets_added: summary.assets_added,
                        assets_removed: summary.assets_removed,
                        albums_changed: summary.albums_changed,
                    });
                    return Ok(summary);
                }
                Err(err) if err.is_interrupt() => {
                    // Leave no half-written assets behind.
                    let _ = AssetStore::new(&self.root).sweep_temp().await;
                    return Err(err);
                }
                Err(err) => {
                    warn!(attempt, error = %err, "Sync attempt failed");
                    last_error = Some(err);
                }
            }
        }

        let attempts = self.max_retries + 1;
        let err = AppError::new(SyncError::RetriesExhausted { attempts });
        Err(match last_error {
            Some(cause) => err.with_cause(cause),
            None => err,
        })
    }

    /// One full fetch/diff/apply pass.
    async fn sync_once(&self) -> Result<SyncSummary, AppError> {
        self.events.emit(Event::RunStarted);

        let store = AssetStore::new(&self.root);
        let tree = AlbumTree::new(&self.root);
        store.ensure().await.map_err(lib_err)?;
        tree.ensure().await.map_err(lib_err)?;
        store.sweep_temp().await.map_err(lib_err)?;

        // Fetch remote state; queries share the session and run in parallel.
        let (remote_assets, remote_albums) = tokio::try_join!(
            self.remote.fetch_assets(),
            self.remote.fetch_albums(),
        )
        .map_err(to_app_error)?;

        let local = PhotosLibrary::load(&self.root, &self.events)
            .await
            .map_err(lib_err)?;

        let plan = compute_plan(&remote_assets, &remote_albums, &local);
        info!(
            add = plan.assets_to_add.len(),
            keep = plan.assets_to_keep.len(),
            remove = plan.assets_to_remove.len(),
            album_ops = plan.album_ops(),
            "Plan computed"
        );

        // Size-verify kept assets; failures are deleted and re-queued.
        let mut to_download = plan.assets_to_add.clone();
        for asset in &plan.assets_to_keep {
            if !store.verify_asset(asset).await.map_err(lib_err)? {
                to_download.push(asset.clone());
            }
        }
        self.check_interrupt()?;

        // Phase 1: downloads.
        let (added, skipped) = self.download_all(&store, to_download).await?;
        self.check_interrupt()?;

        // Phase 2: album operations.
        let albums_changed = self.apply_album_ops(&tree, &plan).await?;
        self.check_interrupt()?;

        // Phase 3: link reconciliation. Links to skipped assets are held
        // back; the next sync re-plans them.
        let mut links_changed = 0;
        for change in &plan.link_changes {
            for name in &change.remove {
                tree.unlink_asset(&change.album_uuid, name)
                    .await
                    .map_err(lib_err)?;
                links_changed += 1;
            }
            for link in &change.add {
                if skipped.contains(&link.filename) {
                    continue;
                }
                tree.link_asset(&change.album_uuid, &link.link_name, &link.filename)
                    .await
                    .map_err(lib_err)?;
                links_changed += 1;
            }
        }

        // Phase 4: asset removals, now that no album references them.
        for filename in &plan.assets_to_remove {
            store.delete_asset(filename).await.map_err(lib_err)?;
        }

        Ok(SyncSummary {
            assets_added: added,
            assets_skipped: skipped.len(),
            assets_removed: plan.assets_to_remove.len(),
            albums_changed,
            links_changed,
        })
    }

    /// Applies album creations, stash transitions, moves and deletions in
    /// dependency-safe order.
    async fn apply_album_ops(&self, tree: &AlbumTree, plan: &SyncPlan) -> Result<usize, AppError> {
        for album in &plan.albums_to_add {
            tree.create_album(album).await.map_err(lib_err)?;
        }
        for mv in &plan.albums_to_unstash {
            tree.unstash(&mv.local.uuid, &mv.new_name, mv.new_parent.as_deref())
                .await
                .map_err(lib_err)?;
        }
        for mv in &plan.albums_to_move {
            tree.move_album(&mv.local, mv.new_parent.as_deref(), &mv.new_name)
                .await
                .map_err(lib_err)?;
        }
        // Stash before parents disappear, relocate before deletions for the
        // same reason: both only need their own name link to still resolve.
        for local in &plan.albums_to_stash {
            tree.stash(local).await.map_err(lib_err)?;
        }
        for local in &plan.albums_to_relocate {
            tree.relocate_to_lost_found(local).await.map_err(lib_err)?;
        }
        for local in &plan.albums_to_remove {
            tree.delete_album(local).await.map_err(lib_err)?;
        }
        Ok(plan.album_ops())
    }

    /// Downloads assets with bounded concurrency.
    ///
    /// Returns the number downloaded and the set of skipped filenames.
    async fn download_all(
        &self,
        store: &AssetStore,
        assets: Vec<Asset>,
    ) -> Result<(usize, BTreeSet<String>), AppError> {
        if assets.is_empty() {
            return Ok((0, BTreeSet::new()));
        }
        info!(
            count = assets.len(),
            threads = self.download_threads,
            "Downloading assets"
        );

        let outcomes: Vec<Result<DownloadOutcome, AppError>> =
            futures_util::stream::iter(assets.into_iter().map(|asset| {
                let store = store.clone();
                let remote = self.remote.clone();
                let cancel = self.cancel.clone();
                let events = self.events.clone();
                async move { download_one(remote, store, asset, cancel, events).await }
            }))
            .buffer_unordered(self.download_threads)
            .collect()
            .await;

        let mut added = 0;
        let mut skipped = BTreeSet::new();
        for outcome in outcomes {
            match outcome? {
                DownloadOutcome::Done => added += 1,
                DownloadOutcome::Skipped(filename) => {
                    skipped.insert(filename);
                }
            }
        }
        Ok((added, skipped))
    }

    fn check_interrupt(&self) -> Result<(), AppError> {
        if self.cancel.is_cancelled() {
            Err(InterruptError { signal: "signal" }.into())
        } else {
            Ok(())
        }
    }
}

/// Downloads one asset with per-asset retry.
///
/// An expired signed URL (410/403) re-fetches the record before the next
/// attempt. After [`DOWNLOAD_RETRIES`] failures the asset is skipped with a
/// [`SyncWarning`]; it will be planned again on the next sync.
async fn download_one(
    remote: Arc<dyn RemoteLibrary>,
    store: AssetStore,
    mut asset: Asset,
    cancel: CancellationToken,
    events: EventSink,
) -> Result<DownloadOutcome, AppError> {
    let filename = asset.asset_filename();
    let mut last_reason = String::new();

    for attempt in 0..=DOWNLOAD_RETRIES {
        if cancel.is_cancelled() {
            return Err(InterruptError { signal: "signal" }.into());
        }

        let result = async {
            let stream = remote.download(&asset).await?;
            store.write_asset(&asset, stream).await
        }
        .await;

        match result {
            Ok(_) => {
                if attempt > 0 {
                    events.warn(&AppError::new(SyncWarning::Retried(attempt)));
                }
                debug!(filename, "Asset downloaded");
                return Ok(DownloadOutcome::Done);
            }
            Err(err) if attempt < DOWNLOAD_RETRIES => {
                last_reason = format!("{err:#}");
                if is_expired_url(&err) {
                    // Signed URLs are short-lived; re-read the record.
                    match remote.refresh_asset(&asset).await {
                        Ok(fresh) => {
                            debug!(filename, "Refreshed expired download URL");
                            asset = fresh;
                        }
                        Err(refresh_err) => {
                            warn!(filename, error = %refresh_err, "Record re-fetch failed");
                        }
                    }
                }

                let delay = BACKOFF_BASE * 2u32.pow(attempt);
                warn!(
                    filename,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = last_reason,
                    "Download failed, backing off"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => {
                        return Err(InterruptError { signal: "signal" }.into());
                    }
                }
            }
            Err(err) => {
                last_reason = format!("{err:#}");
            }
        }
    }

    events.warn(&AppError::new(SyncWarning::AssetSkipped {
        filename: filename.clone(),
        attempts: DOWNLOAD_RETRIES + 1,
        reason: last_reason,
    }));
    Ok(DownloadOutcome::Skipped(filename))
}

/// Whether an adapter error means the signed download URL expired.
fn is_expired_url(err: &anyhow::Error) -> bool {
    err.downcast_ref::<AppError>()
        .and_then(AppError::http_status)
        .is_some_and(|status| status == 410 || status == 403)
}

/// Unwraps an adapter error back into an [`AppError`], or wraps it as a
/// sync failure.
fn to_app_error(err: anyhow::Error) -> AppError {
    match err.downcast::<AppError>() {
        Ok(app) => app,
        Err(other) => AppError::new(SyncError::Aborted(format!("{other:#}"))),
    }
}

/// Maps a filesystem-layer error into the library error kind.
fn lib_err(err: anyhow::Error) -> AppError {
    AppError::new(LibraryError::InvalidState(format!("{err:#}")))
}
