//! Loading the on-disk library into the in-memory projection
//!
//! [`PhotosLibrary`] is rebuilt from the filesystem at the start of every
//! sync and discarded afterwards; the link structure on disk is the only
//! durable state. Loading is tolerant: dangling links are skipped with a
//! warning, and a directory dirtied by non-safe files is reclassified as
//! archived rather than failing the run.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use icsync_core::domain::errors::{AppError, LibraryWarning};
use icsync_core::domain::AlbumType;
use icsync_core::events::EventSink;

use crate::albums::{AlbumTree, LocalAlbum};
use crate::store::{AssetStore, LocalAsset};
use crate::{ARCHIVE_DIR, ARCHIVE_SENTINEL, ASSET_DIR, STASH_DIR};

/// Root entries that are never album backing dirs or name links.
const RESERVED: &[&str] = &[ASSET_DIR, ARCHIVE_DIR, ".reports"];

/// In-memory projection of the local library state.
#[derive(Debug)]
pub struct PhotosLibrary {
    pub root: PathBuf,
    /// Asset-dir contents, keyed by filename
    pub assets: BTreeMap<String, LocalAsset>,
    /// Albums keyed by uuid, including stashed archived albums
    pub albums: BTreeMap<String, LocalAlbum>,
}

impl PhotosLibrary {
    /// Constructs the projection by walking the data directory.
    pub async fn load(root: &Path, events: &EventSink) -> Result<Self> {
        let store = AssetStore::new(root);
        let tree = AlbumTree::new(root);
        let assets = store.load().await?;

        let mut albums: BTreeMap<String, LocalAlbum> = BTreeMap::new();
        // uuid -> (display name, parent uuid)
        let mut names: BTreeMap<String, (String, Option<String>)> = BTreeMap::new();

        // Pass 1: top-level name links and the set of backing dirs.
        let mut backing: Vec<String> = Vec::new();
        let mut entries = tokio::fs::read_dir(root)
            .await
            .with_context(|| format!("Failed to read library root {}", root.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if RESERVED.contains(&name.as_str()) {
                continue;
            }
            let ty = entry.file_type().await?;
            if ty.is_symlink() {
                if let Some(uuid) = link_target_uuid(&tokio::fs::read_link(entry.path()).await?) {
                    names.insert(uuid, (name, None));
                }
            } else if ty.is_dir() && name.starts_with('.') {
                backing.push(name[1..].to_string());
            }
        }

        // Pass 2: contents of each backing dir.
        for uuid in &backing {
            let dir = tree.backing_dir(uuid);
            let mut links = BTreeMap::new();
            let mut pinned: BTreeSet<String> = BTreeSet::new();
            let mut archived = false;
            let mut has_children = false;

            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                let ty = entry.file_type().await?;

                if ty.is_symlink() {
                    let target = tokio::fs::read_link(entry.path()).await?;
                    if let Some(filename) = asset_link_target(&target) {
                        if assets.contains_key(&filename) {
                            links.insert(name, filename);
                        } else {
                            let path = entry.path().display().to_string();
                            events.warn(&AppError::new(LibraryWarning::DanglingLink(path)));
                        }
                    } else if let Some(child) = link_target_uuid(&target) {
                        has_children = true;
                        names.insert(child, (name, Some(uuid.clone())));
                    } else {
                        warn!(link = name, "Unrecognized symlink target in album dir");
                    }
                } else if name == ARCHIVE_SENTINEL {
                    archived = true;
                    let content = tokio::fs::read_to_string(entry.path()).await?;
                    pinned.extend(content.lines().filter(|l| !l.is_empty()).map(str::to_string));
                } else if !name.starts_with('.') && ty.is_file() {
                    // Non-safe file: the user wrote into the album dir.
                    events.warn(&AppError::new(LibraryWarning::NonSafeFile {
                        uuid: uuid.clone(),
                        file: name,
                    }));
                    archived = true;
                }
            }

            let album_type = if archived {
                AlbumType::Archived
            } else if !links.is_empty() || !has_children {
                AlbumType::Album
            } else {
                AlbumType::Folder
            };

            albums.insert(
                uuid.clone(),
                LocalAlbum {
                    uuid: uuid.clone(),
                    display_name: uuid.clone(), // fixed up from `names` below
                    parent_uuid: None,
                    album_type,
                    links,
                    pinned_filenames: pinned,
                    stashed: false,
                },
            );
        }

        for (uuid, (display_name, parent)) in names {
            if let Some(album) = albums.get_mut(&uuid) {
                album.display_name = display_name;
                album.parent_uuid = parent;
            }
        }

        // Pass 3: stashed archived albums.
        let stash_root = root.join(ARCHIVE_DIR).join(STASH_DIR);
        if stash_root.is_dir() {
            let mut entries = tokio::fs::read_dir(&stash_root).await?;
            while let Some(entry) = entries.next_entry().await? {
                if !entry.file_type().await?.is_dir() {
                    continue;
                }
                let uuid = entry.file_name().to_string_lossy().into_owned();
                let sentinel = entry.path().join(ARCHIVE_SENTINEL);
                let pinned = match tokio::fs::read_to_string(&sentinel).await {
                    Ok(content) => content
                        .lines()
                        .filter(|l| !l.is_empty())
                        .map(str::to_string)
                        .collect(),
                    Err(_) => BTreeSet::new(),
                };
                albums.insert(
                    uuid.clone(),
                    LocalAlbum {
                        uuid: uuid.clone(),
                        display_name: uuid,
                        parent_uuid: None,
                        album_type: AlbumType::Archived,
                        links: BTreeMap::new(),
                        pinned_filenames: pinned,
                        stashed: true,
                    },
                );
            }
        }

        debug!(
            assets = assets.len(),
            albums = albums.len(),
            "Library projection loaded"
        );
        Ok(Self {
            root: root.to_path_buf(),
            assets,
            albums,
        })
    }

    /// Filenames linked by at least one archived album.
    ///
    /// These are protected from removal: the archived album still depends on
    /// the shared file until its links are materialized.
    pub fn archived_linked_filenames(&self) -> std::collections::BTreeSet<String> {
        self.albums
            .values()
            .filter(|a| a.is_archived())
            .flat_map(|a| a.linked_filenames().map(str::to_string))
            .collect()
    }
}

/// Extracts the album uuid from a name-link target (`.U1` or `../.U1`).
fn link_target_uuid(target: &Path) -> Option<String> {
    let mut components = target.components();
    let first = components.next()?;
    let name = match first {
        Component::ParentDir => match components.next()? {
            Component::Normal(name) => name,
            _ => return None,
        },
        Component::Normal(name) => name,
        _ => return None,
    };
    if components.next().is_some() {
        return None;
    }
    let name = name.to_string_lossy();
    name.strip_prefix('.').map(str::to_string)
}

/// Extracts the asset filename from an asset-link target
/// (`../_All-Photos/<filename>`).
fn asset_link_target(target: &Path) -> Option<String> {
    let mut components = target.components();
    if components.next()? != Component::ParentDir {
        return None;
    }
    match components.next()? {
        Component::Normal(dir) if dir == ASSET_DIR => {}
        _ => return None,
    }
    match components.next()? {
        Component::Normal(name) if components.next().is_none() => {
            Some(name.to_string_lossy().into_owned())
        }
        _ => None,
    }
}
