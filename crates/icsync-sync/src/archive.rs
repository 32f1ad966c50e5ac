//! Archive engine
//!
//! Freezes an album folder: every asset symlink inside is replaced by a
//! copy of its target (mtime preserved), the `.archive` sentinel pins the
//! referenced filenames, and from then on the album is invisible to the
//! sync diff. With remote deletion enabled, the album's non-favorite assets
//! are also deleted from the remote library.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use icsync_core::domain::errors::{AppError, ArchiveError, ArchiveWarning};
use icsync_core::domain::{AlbumType, Asset};
use icsync_core::events::EventSink;
use icsync_core::ports::RemoteLibrary;
use icsync_library::{AlbumTree, PhotosLibrary};

/// Freezes album folders in place.
pub struct ArchiveEngine {
    remote: Arc<dyn RemoteLibrary>,
    root: PathBuf,
    events: EventSink,
}

impl ArchiveEngine {
    pub fn new(remote: Arc<dyn RemoteLibrary>, root: PathBuf, events: EventSink) -> Self {
        Self {
            remote,
            root,
            events,
        }
    }

    /// Archives the album the given path points at.
    ///
    /// `path` must be a name link (symlink) to an album backing directory
    /// inside the library; relative paths resolve against the data dir.
    /// Returns the number of materialized files.
    pub async fn archive_path(
        &self,
        path: &Path,
        remote_assets: &[Asset],
        remote_delete: bool,
    ) -> Result<usize, AppError> {
        let uuid = self.resolve_album_uuid(path).await?;

        let local = PhotosLibrary::load(&self.root, &self.events)
            .await
            .map_err(|e| AppError::new(ArchiveError::Failed(format!("{e:#}"))))?;
        let album = local.albums.get(&uuid).ok_or_else(|| {
            AppError::new(ArchiveError::NotAnAlbum(path.display().to_string()))
        })?;

        match album.album_type {
            AlbumType::Album => {}
            AlbumType::Archived => {
                info!(uuid, "Album already archived, nothing to do");
                return Ok(0);
            }
            AlbumType::Folder => {
                return Err(AppError::new(ArchiveError::NotArchivable(
                    album.display_name.clone(),
                )))
            }
        }

        let filenames: Vec<String> = album.links.values().cloned().collect();
        let tree = AlbumTree::new(&self.root);

        // Pin first, then materialize: a crash in between leaves an
        // archived album whose links are still protected.
        tree.write_sentinel(&uuid, &filenames)
            .await
            .map_err(|e| AppError::new(ArchiveError::Failed(format!("{e:#}"))))?;
        let materialized = tree
            .materialize_links(&uuid)
            .await
            .map_err(|e| AppError::new(ArchiveError::Failed(format!("{e:#}"))))?;

        info!(
            uuid,
            name = album.display_name,
            materialized,
            "Album archived"
        );

        if remote_delete {
            self.delete_remote_assets(remote_assets, &filenames).await?;
        }

        Ok(materialized)
    }

    /// Resolves a user-supplied path to the album uuid behind its name link.
    async fn resolve_album_uuid(&self, path: &Path) -> Result<String, AppError> {
        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };

        let not_an_album = || AppError::new(ArchiveError::NotAnAlbum(path.display().to_string()));

        let meta = tokio::fs::symlink_metadata(&path)
            .await
            .map_err(|_| not_an_album())?;
        if !meta.file_type().is_symlink() {
            return Err(not_an_album());
        }

        let backing = tokio::fs::canonicalize(&path)
            .await
            .map_err(|_| not_an_album())?;
        let root = tokio::fs::canonicalize(&self.root)
            .await
            .map_err(|_| not_an_album())?;
        if backing.parent() != Some(root.as_path()) {
            return Err(not_an_album());
        }

        backing
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| name.strip_prefix('.'))
            .filter(|uuid| !uuid.is_empty())
            .map(str::to_string)
            .ok_or_else(not_an_album)
    }

    /// Deletes the archived album's assets remotely, keeping favorites.
    async fn delete_remote_assets(
        &self,
        remote_assets: &[Asset],
        filenames: &[String],
    ) -> Result<(), AppError> {
        let mut to_delete = Vec::new();
        for asset in remote_assets {
            if !filenames.contains(&asset.asset_filename()) {
                continue;
            }
            if asset.favorite {
                self.events.warn(&AppError::new(ArchiveWarning::FavoriteKept(
                    asset.record_name.clone(),
                )));
                continue;
            }
            let record = asset
                .asset_record_name
                .clone()
                .unwrap_or_else(|| asset.record_name.clone());
            if !to_delete.contains(&record) {
                to_delete.push(record);
            }
        }

        if to_delete.is_empty() {
            warn!("Remote delete requested but no deletable assets matched");
            return Ok(());
        }

        self.remote
            .delete_assets(&to_delete)
            .await
            .map_err(|e| AppError::new(ArchiveError::Failed(format!("{e:#}"))))?;
        info!(count = to_delete.len(), "Archived assets deleted remotely");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::BTreeSet;
    use std::sync::Mutex;

    use icsync_core::domain::errors::ErrorKind;
    use icsync_core::domain::{Album, AssetOrigin, FileType};
    use icsync_core::ports::AssetStream;
    use icsync_library::{ARCHIVE_SENTINEL, ASSET_DIR};

    #[derive(Default)]
    struct DeleteRecorder {
        deleted: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RemoteLibrary for DeleteRecorder {
        async fn fetch_assets(&self) -> anyhow::Result<Vec<Asset>> {
            Ok(vec![])
        }
        async fn fetch_albums(&self) -> anyhow::Result<Vec<Album>> {
            Ok(vec![])
        }
        async fn download(&self, _asset: &Asset) -> anyhow::Result<AssetStream> {
            anyhow::bail!("not used")
        }
        async fn refresh_asset(&self, asset: &Asset) -> anyhow::Result<Asset> {
            Ok(asset.clone())
        }
        async fn delete_assets(&self, record_names: &[String]) -> anyhow::Result<()> {
            self.deleted.lock().unwrap().extend_from_slice(record_names);
            Ok(())
        }
        async fn reauthenticate(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn asset(record: &str, checksum: &str, favorite: bool) -> Asset {
        Asset {
            record_name: record.to_string(),
            asset_record_name: Some(format!("cpl-{record}")),
            base_name: "IMG".to_string(),
            file_checksum: checksum.to_string(),
            size: 5,
            modified: 0,
            file_type: FileType::Jpeg,
            wrapping_key: None,
            reference_checksum: None,
            download_url: None,
            origin: AssetOrigin::Original,
            favorite,
        }
    }

    async fn seeded(dir: &tempfile::TempDir) -> (AlbumTree, Asset) {
        let tree = AlbumTree::new(dir.path());
        tree.ensure().await.unwrap();
        tokio::fs::create_dir_all(dir.path().join(ASSET_DIR))
            .await
            .unwrap();

        let a = asset("rec-a", "YWFh", false);
        std::fs::write(dir.path().join(ASSET_DIR).join(a.asset_filename()), b"aaaaa").unwrap();
        tree.create_album(&Album::new_album("U1", "Family"))
            .await
            .unwrap();
        tree.link_asset("U1", "A.jpeg", &a.asset_filename())
            .await
            .unwrap();
        (tree, a)
    }

    #[tokio::test]
    async fn test_archive_materializes_and_pins() {
        let dir = tempfile::tempdir().unwrap();
        let (_tree, a) = seeded(&dir).await;

        let engine = ArchiveEngine::new(
            Arc::new(DeleteRecorder::default()),
            dir.path().to_path_buf(),
            EventSink::disconnected(),
        );
        let materialized = engine
            .archive_path(Path::new("Family"), &[a.clone()], false)
            .await
            .unwrap();
        assert_eq!(materialized, 1);

        // The link is now a regular file owning its content
        let frozen = dir.path().join(".U1").join("A.jpeg");
        assert!(std::fs::symlink_metadata(&frozen)
            .unwrap()
            .file_type()
            .is_file());
        assert_eq!(std::fs::read(&frozen).unwrap(), b"aaaaa");

        // The sentinel pins the shared filename
        let sentinel =
            std::fs::read_to_string(dir.path().join(".U1").join(ARCHIVE_SENTINEL)).unwrap();
        assert!(sentinel.contains(&a.asset_filename()));
    }

    #[tokio::test]
    async fn test_archive_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (_tree, a) = seeded(&dir).await;

        let engine = ArchiveEngine::new(
            Arc::new(DeleteRecorder::default()),
            dir.path().to_path_buf(),
            EventSink::disconnected(),
        );
        engine
            .archive_path(Path::new("Family"), &[a.clone()], false)
            .await
            .unwrap();
        // Second call sees an archived album and no-ops
        let second = engine
            .archive_path(Path::new("Family"), &[a], false)
            .await
            .unwrap();
        assert_eq!(second, 0);
    }

    #[tokio::test]
    async fn test_archive_rejects_non_links() {
        let dir = tempfile::tempdir().unwrap();
        let (_tree, _a) = seeded(&dir).await;

        let engine = ArchiveEngine::new(
            Arc::new(DeleteRecorder::default()),
            dir.path().to_path_buf(),
            EventSink::disconnected(),
        );

        for bad in ["_All-Photos", ".U1", "missing"] {
            let err = engine
                .archive_path(Path::new(bad), &[], false)
                .await
                .unwrap_err();
            assert!(
                matches!(err.kind, ErrorKind::Archive(ArchiveError::NotAnAlbum(_))),
                "{bad}: {err}"
            );
        }
    }

    #[tokio::test]
    async fn test_remote_delete_spares_favorites() {
        let dir = tempfile::tempdir().unwrap();
        let tree = AlbumTree::new(dir.path());
        tree.ensure().await.unwrap();
        tokio::fs::create_dir_all(dir.path().join(ASSET_DIR))
            .await
            .unwrap();

        let plain = asset("rec-a", "YWFh", false);
        let favorite = asset("rec-b", "YmJi", true);
        for a in [&plain, &favorite] {
            std::fs::write(dir.path().join(ASSET_DIR).join(a.asset_filename()), b"xxxxx")
                .unwrap();
        }
        tree.create_album(&Album::new_album("U1", "Family"))
            .await
            .unwrap();
        tree.link_asset("U1", "A.jpeg", &plain.asset_filename())
            .await
            .unwrap();
        tree.link_asset("U1", "B.jpeg", &favorite.asset_filename())
            .await
            .unwrap();

        let recorder = Arc::new(DeleteRecorder::default());
        let (events, mut rx) = EventSink::channel();
        let engine = ArchiveEngine::new(recorder.clone(), dir.path().to_path_buf(), events);
        engine
            .archive_path(Path::new("Family"), &[plain, favorite], true)
            .await
            .unwrap();

        let deleted = recorder.deleted.lock().unwrap().clone();
        assert_eq!(deleted, vec!["cpl-rec-a".to_string()]);

        // The favorite skip is surfaced as a warning
        let mut saw_favorite = false;
        while let Ok(event) = rx.try_recv() {
            if format!("{event:?}").contains("favorite") {
                saw_favorite = true;
            }
        }
        assert!(saw_favorite);
    }

    #[tokio::test]
    async fn test_archived_album_survives_next_sync_shape() {
        // After archiving, loading the library classifies it archived with
        // the pinned filenames intact.
        let dir = tempfile::tempdir().unwrap();
        let (_tree, a) = seeded(&dir).await;

        let engine = ArchiveEngine::new(
            Arc::new(DeleteRecorder::default()),
            dir.path().to_path_buf(),
            EventSink::disconnected(),
        );
        engine
            .archive_path(Path::new("Family"), &[a.clone()], false)
            .await
            .unwrap();

        let lib = PhotosLibrary::load(dir.path(), &EventSink::disconnected())
            .await
            .unwrap();
        let album = &lib.albums["U1"];
        assert_eq!(album.album_type, AlbumType::Archived);
        let pinned: BTreeSet<String> = album.pinned_filenames.clone();
        assert!(pinned.contains(&a.asset_filename()));
    }
}
