//! Symlink-based album tree
//!
//! Every album is backed by a dot-hidden directory `.<uuid>/` directly under
//! the library root; the tree shape is expressed purely through relative
//! symlinks:
//!
//! ```text
//! <root>/People            -> .<U2>              top-level name link
//! <root>/.<U2>/Family      -> ../.<U1>           nested name link
//! <root>/.<U1>/IMG_1.jpeg  -> ../_All-Photos/<checksum>.jpeg
//! ```
//!
//! Because backing directories never move, a re-parented album only swaps
//! name links and its asset links stay valid. The `_Archive/` holding area
//! contains `.stash/<uuid>/` for archived albums awaiting relocation and
//! `Lost+Found/` for archived albums whose remote counterpart disappeared.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use filetime::FileTime;
use tracing::{debug, warn};

use icsync_core::domain::{Album, AlbumType};

use crate::{ARCHIVE_DIR, ARCHIVE_SENTINEL, ASSET_DIR, LOST_FOUND_DIR, STASH_DIR};

/// An album as reconstructed from the on-disk link structure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalAlbum {
    pub uuid: String,
    pub display_name: String,
    pub parent_uuid: Option<String>,
    pub album_type: AlbumType,
    /// Link name -> asset filename in `_All-Photos/`
    pub links: BTreeMap<String, String>,
    /// Asset filenames recorded in the `.archive` sentinel at archive time.
    /// Kept even after the album's symlinks were materialized into copies,
    /// so the shared files stay protected from removal.
    pub pinned_filenames: BTreeSet<String>,
    /// Whether the backing dir currently sits in `_Archive/.stash/`
    pub stashed: bool,
}

impl LocalAlbum {
    pub fn is_archived(&self) -> bool {
        self.album_type == AlbumType::Archived
    }

    /// The set of asset filenames this album references, via live symlinks
    /// or via the archive sentinel.
    pub fn linked_filenames(&self) -> impl Iterator<Item = &str> {
        self.links
            .values()
            .map(String::as_str)
            .chain(self.pinned_filenames.iter().map(String::as_str))
    }
}

/// Filesystem operations on the album tree. All operations are idempotent.
#[derive(Debug, Clone)]
pub struct AlbumTree {
    root: PathBuf,
}

impl AlbumTree {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Backing directory of an album.
    pub fn backing_dir(&self, uuid: &str) -> PathBuf {
        self.root.join(format!(".{uuid}"))
    }

    /// Stash location of an archived album pending relocation.
    pub fn stash_dir(&self, uuid: &str) -> PathBuf {
        self.root.join(ARCHIVE_DIR).join(STASH_DIR).join(uuid)
    }

    /// The `_Archive/Lost+Found/` directory.
    pub fn lost_found_dir(&self) -> PathBuf {
        self.root.join(ARCHIVE_DIR).join(LOST_FOUND_DIR)
    }

    /// Path of the name link for an album under the given parent.
    pub fn name_link_path(&self, parent_uuid: Option<&str>, display_name: &str) -> PathBuf {
        match parent_uuid {
            None => self.root.join(display_name),
            Some(parent) => self.backing_dir(parent).join(display_name),
        }
    }

    /// Relative target of a name link as seen from its location.
    fn name_link_target(parent_uuid: Option<&str>, uuid: &str) -> PathBuf {
        match parent_uuid {
            None => PathBuf::from(format!(".{uuid}")),
            Some(_) => PathBuf::from(format!("../.{uuid}")),
        }
    }

    /// Creates the `_Archive` holding areas.
    pub async fn ensure(&self) -> Result<()> {
        tokio::fs::create_dir_all(self.root.join(ARCHIVE_DIR).join(STASH_DIR)).await?;
        tokio::fs::create_dir_all(self.lost_found_dir()).await?;
        Ok(())
    }

    // ========================================================================
    // Album operations
    // ========================================================================

    /// Creates an album: backing dir plus name link. Parent must exist.
    pub async fn create_album(&self, album: &Album) -> Result<()> {
        if let Some(parent) = album.parent_uuid.as_deref() {
            if !self.backing_dir(parent).is_dir() {
                bail!("Parent album {parent} has no backing dir");
            }
        }

        let dir = self.backing_dir(&album.uuid);
        if !dir.is_dir() {
            tokio::fs::create_dir(&dir)
                .await
                .with_context(|| format!("Failed to create album dir {}", dir.display()))?;
        }

        self.ensure_symlink(
            &self.name_link_path(album.parent_uuid.as_deref(), &album.display_name),
            &Self::name_link_target(album.parent_uuid.as_deref(), &album.uuid),
        )
        .await?;

        debug!(uuid = album.uuid, name = album.display_name, "Album created");
        Ok(())
    }

    /// Deletes an album's name link and backing dir.
    ///
    /// The backing dir may still contain asset links (they point into
    /// `_All-Photos/` and carry no data); anything else is a caller bug.
    pub async fn delete_album(&self, local: &LocalAlbum) -> Result<()> {
        let link = self.name_link_path(local.parent_uuid.as_deref(), &local.display_name);
        remove_if_symlink(&link).await?;

        let dir = self.backing_dir(&local.uuid);
        if dir.is_dir() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let ty = entry.file_type().await?;
                if !ty.is_symlink() {
                    bail!(
                        "Refusing to delete album {}: non-link entry {}",
                        local.uuid,
                        entry.file_name().to_string_lossy()
                    );
                }
                tokio::fs::remove_file(entry.path()).await?;
            }
            tokio::fs::remove_dir(&dir).await?;
        }

        debug!(uuid = local.uuid, "Album deleted");
        Ok(())
    }

    /// Re-parents an album by swapping name links; the backing dir stays put.
    pub async fn move_album(
        &self,
        local: &LocalAlbum,
        new_parent: Option<&str>,
        new_name: &str,
    ) -> Result<()> {
        if let Some(parent) = new_parent {
            if !self.backing_dir(parent).is_dir() {
                bail!("Cannot move album {} under missing parent {parent}", local.uuid);
            }
        }

        let old_link = self.name_link_path(local.parent_uuid.as_deref(), &local.display_name);
        remove_if_symlink(&old_link).await?;

        self.ensure_symlink(
            &self.name_link_path(new_parent, new_name),
            &Self::name_link_target(new_parent, &local.uuid),
        )
        .await?;

        debug!(uuid = local.uuid, ?new_parent, "Album moved");
        Ok(())
    }

    // ========================================================================
    // Asset links
    // ========================================================================

    /// Links an asset into an album under its pretty name.
    pub async fn link_asset(&self, album_uuid: &str, pretty: &str, filename: &str) -> Result<()> {
        let link = self.backing_dir(album_uuid).join(pretty);
        let target = PathBuf::from(format!("../{ASSET_DIR}/{filename}"));
        self.ensure_symlink(&link, &target).await
    }

    /// Removes an asset link by its link name.
    pub async fn unlink_asset(&self, album_uuid: &str, link_name: &str) -> Result<()> {
        remove_if_symlink(&self.backing_dir(album_uuid).join(link_name)).await
    }

    // ========================================================================
    // Archive lifecycle
    // ========================================================================

    /// Writes the `.archive` sentinel into an album's backing dir.
    ///
    /// The sentinel records the asset filenames the album referenced at
    /// archive time, one per line, so the shared files stay protected from
    /// removal after the symlinks are replaced by copies.
    pub async fn write_sentinel(&self, uuid: &str, filenames: &[String]) -> Result<()> {
        let path = self.backing_dir(uuid).join(ARCHIVE_SENTINEL);
        let mut content = filenames.join("\n");
        if !content.is_empty() {
            content.push('\n');
        }
        tokio::fs::write(&path, content)
            .await
            .with_context(|| format!("Failed to write archive sentinel {}", path.display()))
    }

    /// Replaces every asset symlink in an album dir by a copy of its target,
    /// preserving the target's mtime. Used when freezing an album.
    pub async fn materialize_links(&self, uuid: &str) -> Result<usize> {
        let dir = self.backing_dir(uuid);
        let mut replaced = 0;

        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .with_context(|| format!("Failed to read album dir {}", dir.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_symlink() {
                continue;
            }
            let link_path = entry.path();
            let target = tokio::fs::canonicalize(&link_path)
                .await
                .with_context(|| format!("Dangling link {}", link_path.display()))?;
            if target.is_dir() {
                // Child album link; freezing applies to asset links only.
                continue;
            }

            let meta = tokio::fs::metadata(&target).await?;
            tokio::fs::remove_file(&link_path).await?;
            tokio::fs::copy(&target, &link_path).await.with_context(|| {
                format!("Failed to copy {} over its link", target.display())
            })?;
            filetime::set_file_mtime(&link_path, FileTime::from_last_modification_time(&meta))?;
            replaced += 1;
        }

        debug!(uuid, replaced, "Album links materialized");
        Ok(replaced)
    }

    /// Moves an archived album's backing dir into `_Archive/.stash/<uuid>/`
    /// until a future sync re-creates its parent.
    pub async fn stash(&self, local: &LocalAlbum) -> Result<()> {
        let link = self.name_link_path(local.parent_uuid.as_deref(), &local.display_name);
        remove_if_symlink(&link).await?;

        let from = self.backing_dir(&local.uuid);
        let to = self.stash_dir(&local.uuid);
        tokio::fs::create_dir_all(to.parent().expect("stash dir has a parent")).await?;
        tokio::fs::rename(&from, &to)
            .await
            .with_context(|| format!("Failed to stash album {}", local.uuid))?;

        warn!(uuid = local.uuid, "Archived album stashed pending relocation");
        Ok(())
    }

    /// Pulls an album out of the stash and links it under an extant parent.
    pub async fn unstash(
        &self,
        uuid: &str,
        display_name: &str,
        new_parent: Option<&str>,
    ) -> Result<()> {
        let from = self.stash_dir(uuid);
        let to = self.backing_dir(uuid);
        tokio::fs::rename(&from, &to)
            .await
            .with_context(|| format!("Failed to unstash album {uuid}"))?;

        self.ensure_symlink(
            &self.name_link_path(new_parent, display_name),
            &Self::name_link_target(new_parent, uuid),
        )
        .await?;

        debug!(uuid, "Album recovered from stash");
        Ok(())
    }

    /// Moves an archived album whose remote counterpart disappeared into
    /// `_Archive/Lost+Found/`, under its display name (uuid-suffixed on
    /// collision).
    pub async fn relocate_to_lost_found(&self, local: &LocalAlbum) -> Result<PathBuf> {
        let link = self.name_link_path(local.parent_uuid.as_deref(), &local.display_name);
        remove_if_symlink(&link).await?;

        let from = if local.stashed {
            self.stash_dir(&local.uuid)
        } else {
            self.backing_dir(&local.uuid)
        };

        let lost_found = self.lost_found_dir();
        tokio::fs::create_dir_all(&lost_found).await?;
        let mut to = lost_found.join(&local.display_name);
        if to.exists() {
            to = lost_found.join(format!("{}-{}", local.display_name, local.uuid));
        }

        tokio::fs::rename(&from, &to)
            .await
            .with_context(|| format!("Failed to relocate album {} to Lost+Found", local.uuid))?;

        warn!(
            uuid = local.uuid,
            dest = %to.display(),
            "Archived album moved to Lost+Found (remote counterpart gone)"
        );
        Ok(to)
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    /// Creates a symlink, replacing an existing link with a different target.
    async fn ensure_symlink(&self, link: &Path, target: &Path) -> Result<()> {
        match tokio::fs::read_link(link).await {
            Ok(existing) if existing == target => return Ok(()),
            Ok(_) => tokio::fs::remove_file(link).await?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to inspect {}", link.display()))
            }
        }
        tokio::fs::symlink(target, link)
            .await
            .with_context(|| format!("Failed to link {} -> {}", link.display(), target.display()))
    }
}

/// Removes a path only when it is a symlink; absence is fine.
async fn remove_if_symlink(path: &Path) -> Result<()> {
    match tokio::fs::symlink_metadata(path).await {
        Ok(meta) if meta.file_type().is_symlink() => Ok(tokio::fs::remove_file(path).await?),
        Ok(_) => bail!("{} exists but is not a symlink", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
