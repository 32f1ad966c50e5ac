//! Content-addressed asset store (`_All-Photos/`)
//!
//! Each file in the store is one asset, named `<checksum>.<ext>` with the
//! asset's remote modification time as mtime. Writes are atomic: content
//! goes to a temp file in the same directory, is fsynced, and is renamed
//! into place, so a crash never leaves a half-written asset under its final
//! name. Leftover temp files are swept at sync start and on interrupt.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use anyhow::{bail, Context, Result};
use filetime::FileTime;
use tracing::{debug, warn};

use icsync_core::domain::Asset;
use icsync_core::ports::AssetStream;

use crate::{ASSET_DIR, TEMP_PREFIX};

/// An asset file as found on disk.
///
/// Local reconstruction only knows what the filesystem records: name (which
/// embeds the checksum and extension), size, and mtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalAsset {
    pub filename: String,
    pub size: u64,
    /// mtime, Unix milliseconds
    pub modified: i64,
}

/// Outcome of [`AssetStore::write_asset`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// File was downloaded and moved into place
    Written,
    /// A matching file already existed; nothing was touched
    AlreadyPresent,
}

/// Handle on the `_All-Photos/` directory.
#[derive(Debug, Clone)]
pub struct AssetStore {
    dir: PathBuf,
}

impl AssetStore {
    pub fn new(root: &Path) -> Self {
        Self {
            dir: root.join(ASSET_DIR),
        }
    }

    /// Creates the asset directory if missing.
    pub async fn ensure(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create asset dir {}", self.dir.display()))
    }

    /// Absolute path of an asset file.
    pub fn path_of(&self, filename: &str) -> PathBuf {
        self.dir.join(filename)
    }

    /// The store directory itself.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Scans the store into a filename-keyed map.
    ///
    /// Dot-entries (temp files, stray state) are skipped.
    pub async fn load(&self) -> Result<BTreeMap<String, LocalAsset>> {
        let mut assets = BTreeMap::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(assets),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read asset dir {}", self.dir.display()))
            }
        };

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            let meta = entry.metadata().await?;
            if !meta.is_file() {
                warn!(name, "Non-file entry in asset dir, ignoring");
                continue;
            }
            let modified = meta
                .modified()?
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as i64)
                .unwrap_or(0);
            assets.insert(
                name.clone(),
                LocalAsset {
                    filename: name,
                    size: meta.len(),
                    modified,
                },
            );
        }

        debug!(count = assets.len(), "Loaded asset store");
        Ok(assets)
    }

    /// Writes an asset atomically and stamps its mtime.
    ///
    /// No-op when a file with the final name already exists at the expected
    /// size; the filename embeds the checksum, so size is a sufficient check.
    pub async fn write_asset(&self, asset: &Asset, mut body: AssetStream) -> Result<WriteOutcome> {
        let filename = asset.asset_filename();
        let final_path = self.path_of(&filename);

        if let Ok(meta) = tokio::fs::metadata(&final_path).await {
            if meta.len() == asset.size {
                debug!(filename, "Asset already present, skipping write");
                return Ok(WriteOutcome::AlreadyPresent);
            }
            // Wrong size under the final name: replace it below.
            warn!(
                filename,
                on_disk = meta.len(),
                expected = asset.size,
                "Size mismatch on existing asset, rewriting"
            );
        }

        let tmp_path = self.dir.join(format!("{TEMP_PREFIX}{filename}"));
        let written = {
            let mut file = tokio::fs::File::create(&tmp_path)
                .await
                .with_context(|| format!("Failed to create temp file {}", tmp_path.display()))?;
            let written = tokio::io::copy(&mut body, &mut file)
                .await
                .context("Download stream failed")?;
            file.sync_all().await.context("fsync failed")?;
            written
        };

        if written != asset.size {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            bail!(
                "Downloaded {} bytes for {}, expected {}",
                written,
                filename,
                asset.size
            );
        }

        tokio::fs::rename(&tmp_path, &final_path)
            .await
            .with_context(|| format!("Failed to move {} into place", filename))?;

        let (secs, nanos) = asset.mtime_parts();
        filetime::set_file_mtime(&final_path, FileTime::from_unix_time(secs, nanos))
            .with_context(|| format!("Failed to set mtime on {}", filename))?;

        debug!(filename, bytes = written, "Asset written");
        Ok(WriteOutcome::Written)
    }

    /// Verifies an asset by size.
    ///
    /// Returns `true` when the file is present and matches. On mismatch the
    /// file is deleted and `false` is returned so the caller redownloads.
    /// Checksum verification is unnecessary: the filename embeds the
    /// checksum, so a matching name plus matching size is as strong as the
    /// remote's own report.
    pub async fn verify_asset(&self, asset: &Asset) -> Result<bool> {
        let filename = asset.asset_filename();
        let path = self.path_of(&filename);

        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.len() == asset.size => Ok(true),
            Ok(meta) => {
                warn!(
                    filename,
                    on_disk = meta.len(),
                    expected = asset.size,
                    "Asset failed size verification, deleting for redownload"
                );
                tokio::fs::remove_file(&path).await?;
                Ok(false)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("Failed to stat {}", filename)),
        }
    }

    /// Unlinks an asset file. Callers must ensure no album still links to it.
    pub async fn delete_asset(&self, filename: &str) -> Result<()> {
        let path = self.path_of(filename);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(filename, "Asset deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to delete {}", filename)),
        }
    }

    /// Removes leftover temp files from interrupted downloads.
    pub async fn sweep_temp(&self) -> Result<usize> {
        let mut removed = 0;
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(TEMP_PREFIX) {
                tokio::fs::remove_file(entry.path()).await?;
                removed += 1;
            }
        }
        if removed > 0 {
            warn!(removed, "Swept leftover temp files from asset dir");
        }
        Ok(removed)
    }
}
