//! One module per CLI command

pub mod archive;
pub mod daemon;
pub mod sync;
pub mod token;

use icsync_core::config::Config;
use icsync_core::domain::errors::AppError;
use icsync_core::events::EventSink;
use icsync_library::LibraryLock;
use tracing::warn;

/// Runs `work` while holding the library lock.
///
/// The lock is released on every path, success, failure or interrupt;
/// a release failure is logged but never masks the work's own result.
pub async fn with_lock<F, Fut>(
    config: &Config,
    events: &EventSink,
    work: F,
) -> Result<(), AppError>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<(), AppError>>,
{
    let lock = LibraryLock::acquire(&config.data_dir, config.force, events)?;
    let result = work().await;

    if let Err(release_err) = lock.release(config.force) {
        warn!(error = %release_err, "Failed to release library lock");
        if result.is_ok() {
            return Err(release_err);
        }
    }
    result
}
