//! Plan computation
//!
//! [`compute_plan`] is a pure function from `(remote assets, remote albums,
//! local projection)` to the minimal set of mutations that reconciles local
//! with remote. The engine applies the plan in phases; nothing here touches
//! the filesystem or the network.
//!
//! Archived albums are carved out of the normal three-way diff:
//!
//! - still tracked remotely: ignored entirely (their content is frozen),
//!   except that a vanishing local parent diverts them to the stash
//! - gone from remote: relocated to `_Archive/Lost+Found/`
//! - stashed, with their remote parent extant again: recovered from the
//!   stash under that parent
//!
//! Assets referenced by any archived album are never removed.

use std::collections::{BTreeMap, BTreeSet};

use icsync_core::domain::album::toposort_by_parent;
use icsync_core::domain::{Album, AlbumType, Asset};
use icsync_library::{LocalAlbum, PhotosLibrary};

/// One asset link to create inside an album directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSpec {
    pub link_name: String,
    pub filename: String,
}

/// Link reconciliation for a single album.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkChange {
    pub album_uuid: String,
    pub add: Vec<LinkSpec>,
    pub remove: Vec<String>,
}

/// An album re-parent/rename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlbumMove {
    pub local: LocalAlbum,
    pub new_parent: Option<String>,
    pub new_name: String,
}

/// The minimal mutation set reconciling local with remote.
#[derive(Debug, Default)]
pub struct SyncPlan {
    /// Remote assets with no local counterpart; to download
    pub assets_to_add: Vec<Asset>,
    /// Remote assets already present locally; to verify by size
    pub assets_to_keep: Vec<Asset>,
    /// Local filenames with no remote counterpart and no archive protection
    pub assets_to_remove: Vec<String>,
    /// New albums, ordered parent-before-child
    pub albums_to_add: Vec<Album>,
    /// Albums recovered from the stash (their remote parent exists again)
    pub albums_to_unstash: Vec<AlbumMove>,
    /// Albums whose parent or name changed remotely
    pub albums_to_move: Vec<AlbumMove>,
    /// Archived albums whose local parent is going away
    pub albums_to_stash: Vec<LocalAlbum>,
    /// Archived albums whose remote counterpart disappeared
    pub albums_to_relocate: Vec<LocalAlbum>,
    /// Non-archived albums deleted remotely
    pub albums_to_remove: Vec<LocalAlbum>,
    /// Per-album link reconciliation
    pub link_changes: Vec<LinkChange>,
}

impl SyncPlan {
    /// True when applying the plan would perform zero mutations.
    pub fn is_empty(&self) -> bool {
        self.assets_to_add.is_empty()
            && self.assets_to_remove.is_empty()
            && self.albums_to_add.is_empty()
            && self.albums_to_unstash.is_empty()
            && self.albums_to_move.is_empty()
            && self.albums_to_stash.is_empty()
            && self.albums_to_relocate.is_empty()
            && self.albums_to_remove.is_empty()
            && self.link_changes.is_empty()
    }

    /// Number of album-level operations in the plan.
    pub fn album_ops(&self) -> usize {
        self.albums_to_add.len()
            + self.albums_to_unstash.len()
            + self.albums_to_move.len()
            + self.albums_to_stash.len()
            + self.albums_to_relocate.len()
            + self.albums_to_remove.len()
    }
}

/// Computes the plan. Pure; serialized before any application begins.
pub fn compute_plan(
    remote_assets: &[Asset],
    remote_albums: &[Album],
    local: &PhotosLibrary,
) -> SyncPlan {
    let mut plan = SyncPlan::default();

    // ------------------------------------------------------------------
    // Asset diff, keyed by the checksum-derived filename
    // ------------------------------------------------------------------
    let remote_by_filename: BTreeMap<String, &Asset> = remote_assets
        .iter()
        .map(|a| (a.asset_filename(), a))
        .collect();
    let protected = local.archived_linked_filenames();

    for (filename, asset) in &remote_by_filename {
        if local.assets.contains_key(filename) {
            plan.assets_to_keep.push((*asset).clone());
        } else {
            plan.assets_to_add.push((*asset).clone());
        }
    }
    for filename in local.assets.keys() {
        if !remote_by_filename.contains_key(filename) && !protected.contains(filename) {
            plan.assets_to_remove.push(filename.clone());
        }
    }

    // ------------------------------------------------------------------
    // Album diff, three-way by UUID
    // ------------------------------------------------------------------
    let remote_by_uuid: BTreeMap<&str, &Album> =
        remote_albums.iter().map(|a| (a.uuid.as_str(), a)).collect();

    let mut added: Vec<Album> = Vec::new();
    for album in remote_albums {
        match local.albums.get(&album.uuid) {
            None => added.push(album.clone()),
            Some(l) if l.is_archived() => {
                // Frozen; remote changes to it do not apply. Stash recovery
                // is handled below once the added set is known.
            }
            Some(l) => {
                if l.parent_uuid != album.parent_uuid || l.display_name != album.display_name {
                    plan.albums_to_move.push(AlbumMove {
                        local: l.clone(),
                        new_parent: album.parent_uuid.clone(),
                        new_name: album.display_name.clone(),
                    });
                }
                if album.album_type == AlbumType::Album {
                    if let Some(change) = link_change(album, Some(l), &remote_by_filename) {
                        plan.link_changes.push(change);
                    }
                }
            }
        }
    }

    let added_uuids: BTreeSet<&str> = added.iter().map(|a| a.uuid.as_str()).collect();

    // Removals: local albums with no remote counterpart.
    for (uuid, l) in &local.albums {
        if remote_by_uuid.contains_key(uuid.as_str()) {
            continue;
        }
        if l.is_archived() {
            plan.albums_to_relocate.push(l.clone());
        } else {
            plan.albums_to_remove.push(l.clone());
        }
    }
    let removed_uuids: BTreeSet<&str> = plan
        .albums_to_remove
        .iter()
        .map(|l| l.uuid.as_str())
        .collect();

    // Archived albums still tracked remotely, in relation to their parent:
    // stash when the parent is going away, unstash when it is back.
    for (uuid, l) in &local.albums {
        if !l.is_archived() || !remote_by_uuid.contains_key(uuid.as_str()) {
            continue;
        }
        let remote = remote_by_uuid[uuid.as_str()];
        if l.stashed {
            let parent_ok = match remote.parent_uuid.as_deref() {
                None => true,
                Some(p) => {
                    added_uuids.contains(p)
                        || local.albums.get(p).is_some_and(|pl| !pl.stashed)
                }
            };
            if parent_ok {
                plan.albums_to_unstash.push(AlbumMove {
                    local: l.clone(),
                    new_parent: remote.parent_uuid.clone(),
                    new_name: remote.display_name.clone(),
                });
            }
        } else if let Some(parent) = l.parent_uuid.as_deref() {
            if removed_uuids.contains(parent) {
                plan.albums_to_stash.push(l.clone());
            }
        }
    }

    // Creation order is parent-before-child.
    plan.albums_to_add = toposort_by_parent(&added);
    for album in &plan.albums_to_add {
        if album.album_type == AlbumType::Album {
            if let Some(change) = link_change(album, None, &remote_by_filename) {
                plan.link_changes.push(change);
            }
        }
    }

    plan
}

/// Desired link set of a remote album: every asset derived from each linked
/// record (original, edit, live), under its pretty name.
fn desired_links(
    album: &Album,
    remote_by_filename: &BTreeMap<String, &Asset>,
) -> BTreeMap<String, String> {
    let mut links = BTreeMap::new();
    for asset in remote_by_filename.values() {
        if album.asset_record_names.contains(&asset.record_name) {
            links.insert(asset.pretty_filename(), asset.asset_filename());
        }
    }
    links
}

/// Computes the add/remove link sets for one album; `None` when unchanged.
fn link_change(
    album: &Album,
    local: Option<&LocalAlbum>,
    remote_by_filename: &BTreeMap<String, &Asset>,
) -> Option<LinkChange> {
    let desired = desired_links(album, remote_by_filename);
    let empty = BTreeMap::new();
    let current = local.map(|l| &l.links).unwrap_or(&empty);

    let add: Vec<LinkSpec> = desired
        .iter()
        .filter(|(name, filename)| current.get(*name) != Some(filename))
        .map(|(name, filename)| LinkSpec {
            link_name: name.clone(),
            filename: filename.clone(),
        })
        .collect();
    let remove: Vec<String> = current
        .keys()
        .filter(|name| !desired.contains_key(*name))
        .cloned()
        .collect();

    if add.is_empty() && remove.is_empty() {
        None
    } else {
        Some(LinkChange {
            album_uuid: album.uuid.clone(),
            add,
            remove,
        })
    }
}
