//! Remote library port (driven/secondary port)
//!
//! The sync and archive engines consume the remote library through this
//! trait. The production implementation is `icsync-icloud`'s `PhotosClient`;
//! tests script a mock against the same surface.
//!
//! Errors at this boundary are adapter-specific, so the port uses
//! `anyhow::Result` and leaves domain classification to the engine.

use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::domain::{Album, Asset};

/// Streaming body of an asset download.
pub type AssetStream = Box<dyn AsyncRead + Send + Unpin>;

/// Read (and narrowly write) access to the remote photo library.
#[async_trait]
pub trait RemoteLibrary: Send + Sync {
    /// Enumerates every asset in the remote library, originals and edits.
    async fn fetch_assets(&self) -> anyhow::Result<Vec<Asset>>;

    /// Enumerates the remote album tree.
    async fn fetch_albums(&self) -> anyhow::Result<Vec<Album>>;

    /// Opens a streaming download of the asset's current signed URL.
    async fn download(&self, asset: &Asset) -> anyhow::Result<AssetStream>;

    /// Re-fetches the asset record to obtain a fresh signed download URL.
    ///
    /// Download URLs are short-lived; a 410/403 on download means the record
    /// must be re-read, not that the asset is gone.
    async fn refresh_asset(&self, asset: &Asset) -> anyhow::Result<Asset>;

    /// Deletes the given records remotely (archive `--remote-delete` only).
    async fn delete_assets(&self, record_names: &[String]) -> anyhow::Result<()>;

    /// Re-runs authentication after a session expiry (HTTP 401).
    async fn reauthenticate(&self) -> anyhow::Result<()>;
}
