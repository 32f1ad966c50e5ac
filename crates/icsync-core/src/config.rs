//! Runtime configuration
//!
//! The CLI assembles a [`Config`] from flags and environment variables
//! (flags win) and hands it to every component. Secrets are redacted from
//! the `Debug` rendering so a logged config never leaks credentials.

use std::fmt;
use std::path::{Path, PathBuf};

/// Default location of the local library.
pub const DEFAULT_DATA_DIR: &str = "/opt/icloud-photos-library";

/// Default port for the MFA intake server.
pub const DEFAULT_MFA_PORT: u16 = 80;

/// Default bounded concurrency for asset downloads.
pub const DEFAULT_DOWNLOAD_THREADS: usize = 16;

/// Default cron expression for daemon mode (daily at 02:00).
pub const DEFAULT_SCHEDULE: &str = "0 2 * * *";

/// Default per-request timeout in seconds.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;

/// Default number of full-sync retries after a fatal error.
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Placeholder substituted for the password in any rendered output.
pub const PASSWORD_PLACEHOLDER: &str = "<APPLE ID PASSWORD>";

/// Placeholder substituted for the trust token in any rendered output.
pub const TRUST_TOKEN_PLACEHOLDER: &str = "<TRUST TOKEN>";

/// Fully resolved runtime configuration.
#[derive(Clone)]
pub struct Config {
    /// Apple ID username
    pub username: String,
    /// Apple ID password
    pub password: String,
    /// Trust token override; when unset the persisted token file is used
    pub trust_token: Option<String>,
    /// Data directory holding the mirrored library and state files
    pub data_dir: PathBuf,
    /// Port the MFA intake server binds to
    pub mfa_port: u16,
    /// Override an existing library lock
    pub force: bool,
    /// Discard any persisted trust token before authenticating
    pub refresh_token: bool,
    /// Fail instead of waiting for MFA input (unattended environments)
    pub fail_on_mfa: bool,
    /// Bounded concurrency for asset downloads
    pub download_threads: usize,
    /// Cron expression driving daemon mode
    pub schedule: String,
    /// Persist and upload error reports
    pub enable_crash_reporting: bool,
    /// Log filter level: trace, debug, info, warn, error
    pub log_level: String,
    /// Per-request timeout in seconds
    pub request_timeout_secs: u64,
    /// Full-sync retries after a fatal error
    pub max_retries: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            username: String::new(),
            password: String::new(),
            trust_token: None,
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            mfa_port: DEFAULT_MFA_PORT,
            force: false,
            refresh_token: false,
            fail_on_mfa: false,
            download_threads: DEFAULT_DOWNLOAD_THREADS,
            schedule: DEFAULT_SCHEDULE.to_string(),
            enable_crash_reporting: false,
            log_level: "info".to_string(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl Config {
    /// Path of the advisory lock file.
    pub fn lock_path(&self) -> PathBuf {
        self.data_dir.join(".library.lock")
    }

    /// Path of the persisted trust token.
    pub fn trust_token_path(&self) -> PathBuf {
        self.data_dir.join(".trust-token.icloud")
    }

    /// Path of the log file, truncated at each process start.
    pub fn log_path(&self) -> PathBuf {
        self.data_dir.join(".icloud-photos-sync.log")
    }

    /// Directory for persisted error reports.
    pub fn reports_dir(&self) -> PathBuf {
        self.data_dir.join(".reports")
    }

    /// Basic sanity checks; credentials presence is checked per command.
    pub fn validate(&self) -> Result<(), String> {
        if self.download_threads == 0 {
            return Err("download-threads must be at least 1".to_string());
        }
        if !Path::new(&self.data_dir).is_absolute() {
            return Err(format!(
                "data-dir must be absolute, got {}",
                self.data_dir.display()
            ));
        }
        Ok(())
    }
}

// Secrets never appear in Debug output; the log file captures config at
// startup and must stay shareable.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("username", &self.username)
            .field("password", &PASSWORD_PLACEHOLDER)
            .field(
                "trust_token",
                &self.trust_token.as_ref().map(|_| TRUST_TOKEN_PLACEHOLDER),
            )
            .field("data_dir", &self.data_dir)
            .field("mfa_port", &self.mfa_port)
            .field("force", &self.force)
            .field("refresh_token", &self.refresh_token)
            .field("fail_on_mfa", &self.fail_on_mfa)
            .field("download_threads", &self.download_threads)
            .field("schedule", &self.schedule)
            .field("enable_crash_reporting", &self.enable_crash_reporting)
            .field("log_level", &self.log_level)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.data_dir, PathBuf::from(DEFAULT_DATA_DIR));
        assert_eq!(config.mfa_port, DEFAULT_MFA_PORT);
        assert_eq!(config.download_threads, DEFAULT_DOWNLOAD_THREADS);
        assert_eq!(config.max_retries, DEFAULT_MAX_RETRIES);
        assert!(!config.force);
    }

    #[test]
    fn test_state_file_paths() {
        let config = Config {
            data_dir: PathBuf::from("/data"),
            ..Config::default()
        };
        assert_eq!(config.lock_path(), PathBuf::from("/data/.library.lock"));
        assert_eq!(
            config.trust_token_path(),
            PathBuf::from("/data/.trust-token.icloud")
        );
        assert_eq!(
            config.log_path(),
            PathBuf::from("/data/.icloud-photos-sync.log")
        );
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let config = Config {
            username: "user@icloud.com".to_string(),
            password: "hunter2".to_string(),
            trust_token: Some("opaque-token".to_string()),
            ..Config::default()
        };
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("opaque-token"));
        assert!(rendered.contains(PASSWORD_PLACEHOLDER));
        assert!(rendered.contains("user@icloud.com"));
    }

    #[test]
    fn test_validate_rejects_zero_threads() {
        let config = Config {
            download_threads: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_relative_data_dir() {
        let config = Config {
            data_dir: PathBuf::from("relative/dir"),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
