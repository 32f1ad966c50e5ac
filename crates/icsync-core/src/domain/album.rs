//! Album entity - a grouping node in the remote library
//!
//! Albums form a rooted tree via `parent_uuid`. A `Folder` contains only
//! sub-albums; an `Album` contains asset links; an `Archived` album is a
//! locally frozen copy that no longer tracks a remote counterpart and is
//! ignored by every future diff.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Kind of an album node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlbumType {
    /// Contains sub-albums, never assets
    Folder,
    /// Contains asset links
    Album,
    /// Locally frozen; owns copies of its files, excluded from diffs
    Archived,
}

/// A folder or ordinary album in the library tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Album {
    /// Remote UUID; also the name of the local backing directory `.<uuid>/`
    pub uuid: String,
    /// User-visible name; may collide between siblings
    pub display_name: String,
    /// Parent album UUID; `None` for top-level albums
    pub parent_uuid: Option<String>,
    pub album_type: AlbumType,
    /// Record names of linked assets; empty unless `album_type == Album`
    pub asset_record_names: BTreeSet<String>,
}

impl Album {
    pub fn new_folder(uuid: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            display_name: name.into(),
            parent_uuid: None,
            album_type: AlbumType::Folder,
            asset_record_names: BTreeSet::new(),
        }
    }

    pub fn new_album(uuid: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            display_name: name.into(),
            parent_uuid: None,
            album_type: AlbumType::Album,
            asset_record_names: BTreeSet::new(),
        }
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent_uuid = Some(parent.into());
        self
    }

    pub fn with_assets<I, S>(mut self, records: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.asset_record_names = records.into_iter().map(Into::into).collect();
        self
    }

    /// Whether this album is excluded from sync diffs.
    pub fn is_archived(&self) -> bool {
        self.album_type == AlbumType::Archived
    }
}

/// Orders albums parent-before-child so creation can proceed top-down.
///
/// Albums whose parent is absent from the input (top-level albums, or
/// children of an already-existing album) sort first. A cycle would leave
/// its members unordered, so they are appended at the end; the remote is a
/// tree and the query layer breaks cycles defensively, so this is a
/// last-resort guard rather than an expected path.
pub fn toposort_by_parent(albums: &[Album]) -> Vec<Album> {
    let by_uuid: BTreeMap<&str, &Album> = albums.iter().map(|a| (a.uuid.as_str(), a)).collect();
    let mut ordered: Vec<Album> = Vec::with_capacity(albums.len());
    let mut placed: BTreeSet<&str> = BTreeSet::new();

    // Repeatedly emit albums whose parent is either external or already placed.
    let mut remaining: Vec<&Album> = albums.iter().collect();
    while !remaining.is_empty() {
        let mut progressed = false;
        remaining.retain(|album| {
            let ready = match album.parent_uuid.as_deref() {
                None => true,
                Some(parent) => !by_uuid.contains_key(parent) || placed.contains(parent),
            };
            if ready {
                placed.insert(album.uuid.as_str());
                ordered.push((*album).clone());
                progressed = true;
            }
            !ready
        });
        if !progressed {
            // Cycle: append the leftovers in input order.
            ordered.extend(remaining.iter().map(|a| (*a).clone()));
            break;
        }
    }

    ordered
}
