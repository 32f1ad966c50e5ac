//! Local library model
//!
//! All local state lives in the filesystem; the layout *is* the
//! serialization format. This crate owns it:
//!
//! - [`lock`] - the advisory per-data-dir process lock
//! - [`store`] - the `_All-Photos/` content-addressed asset store
//! - [`albums`] - the symlink-based album tree and archive holding areas
//! - [`library`] - loading the on-disk state into the in-memory projection

pub mod albums;
pub mod library;
pub mod lock;
pub mod store;

pub use albums::{AlbumTree, LocalAlbum};
pub use library::PhotosLibrary;
pub use lock::LibraryLock;
pub use store::{AssetStore, LocalAsset};

/// Name of the content-addressed asset directory.
pub const ASSET_DIR: &str = "_All-Photos";

/// Name of the archive holding area.
pub const ARCHIVE_DIR: &str = "_Archive";

/// Stash for archived albums pending relocation, under [`ARCHIVE_DIR`].
pub const STASH_DIR: &str = ".stash";

/// Destination for archived albums whose remote counterpart disappeared,
/// under [`ARCHIVE_DIR`].
pub const LOST_FOUND_DIR: &str = "Lost+Found";

/// Sentinel dot-file marking an album directory as archived.
pub const ARCHIVE_SENTINEL: &str = ".archive";

/// Prefix for in-flight download temp files inside the asset dir.
pub const TEMP_PREFIX: &str = ".tmp-";
