//! Closed error taxonomy
//!
//! Every failure in icsync is one of a closed set of kinds, each carrying a
//! severity, a human message, an optional cause chain and a free-form
//! structured context map. Warnings are logged and surfaced on the event
//! stream; fatals abort the current operation and bubble to the top-level
//! handler, which stamps them with a report UUID.

use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};

use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// Per-area error kinds
// ============================================================================

/// Auth, setup and query-layer failures against the iCloud endpoints.
#[derive(Debug, Error)]
pub enum ICloudError {
    #[error("Unexpected HTTP status {0}")]
    UnexpectedHttp(u16),

    #[error("Unexpected response shape: {0}")]
    UnexpectedResponse(String),

    #[error("Account setup response does not expose the photos webservice")]
    PhotosServiceUnavailable,

    #[error("Query for {record_type} returned {count} records, at the server record ceiling")]
    RecordCeiling { record_type: String, count: usize },

    #[error("Request failed: {0}")]
    Request(String),
}

/// Invalid credentials or a failed MFA submission.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Username/password does not seem to match an Apple ID")]
    BadCredentials,

    #[error("Apple ID does not exist or is locked")]
    UnknownUser,

    #[error("MFA code rejected")]
    BadMfaCode,

    #[error("MFA required but disallowed by --fail-on-mfa")]
    MfaRequired,

    #[error("Auth secret {0} missing from response")]
    MissingSecret(&'static str),
}

/// Retryable MFA problems; the intake server stays up so the user can retry.
#[derive(Debug, Error)]
pub enum MfaWarning {
    #[error("Failed to resend MFA code via {method}: {reason}")]
    ResendFailed { method: String, reason: String },

    #[error("Malformed MFA input: {0}")]
    MalformedInput(String),
}

/// Lock conflicts and irrecoverable filesystem state.
#[derive(Debug, Error)]
pub enum LibraryError {
    #[error("Locked by PID {0}")]
    Locked(u32),

    #[error("No lock held on the library")]
    NoLock,

    #[error("Lock held by PID {0}, not this process")]
    ForeignLock(u32),

    #[error("Invalid library state: {0}")]
    InvalidState(String),
}

/// Non-fatal library observations, e.g. auto-archival of a dirtied album.
#[derive(Debug, Error)]
pub enum LibraryWarning {
    #[error("Album {uuid} contains non-safe file {file}, treating as archived")]
    NonSafeFile { uuid: String, file: String },

    #[error("Dangling symlink {0} ignored")]
    DanglingLink(String),

    #[error("Removed stale lock left by dead PID {0}")]
    StaleLock(u32),
}

/// Sync-transaction failures.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Sync failed after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    #[error("Sync aborted: {0}")]
    Aborted(String),
}

/// Per-asset skips and other recoverable sync conditions.
#[derive(Debug, Error)]
pub enum SyncWarning {
    #[error("Skipped asset {filename} after {attempts} download attempts: {reason}")]
    AssetSkipped {
        filename: String,
        attempts: u32,
        reason: String,
    },

    #[error("Retried {0} times")]
    Retried(u32),
}

/// Archive-operation failures.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("Path {0} is not an album inside the library")]
    NotAnAlbum(String),

    #[error("Only albums of type ALBUM can be archived, {0} is a folder")]
    NotArchivable(String),

    #[error("Archive failed: {0}")]
    Failed(String),
}

/// Recoverable archive conditions.
#[derive(Debug, Error)]
pub enum ArchiveWarning {
    #[error("Remote delete skipped for favorite asset {0}")]
    FavoriteKept(String),
}

/// Trust-token acquisition or persistence failures.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("Trust token missing from trust response")]
    NotIssued,

    #[error("Failed to persist trust token: {0}")]
    Persist(String),
}

/// Delivered on SIGINT/SIGTERM; never uploaded as a crash report.
#[derive(Debug, Error)]
#[error("Interrupted by {signal}")]
pub struct InterruptError {
    pub signal: &'static str,
}

/// Wrap for a failed scheduled run inside the daemon.
#[derive(Debug, Error)]
#[error("Scheduled run failed: {0}")]
pub struct DaemonError(pub String);

// ============================================================================
// Severity and the unified AppError
// ============================================================================

/// Whether an error aborts the current operation or is merely surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warn,
    Fatal,
}

/// The closed union of all error kinds.
#[derive(Debug, Error)]
pub enum ErrorKind {
    #[error(transparent)]
    ICloud(#[from] ICloudError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Mfa(#[from] MfaWarning),
    #[error(transparent)]
    Library(#[from] LibraryError),
    #[error(transparent)]
    LibraryWarning(#[from] LibraryWarning),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    SyncWarning(#[from] SyncWarning),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error(transparent)]
    ArchiveWarning(#[from] ArchiveWarning),
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error(transparent)]
    Interrupt(#[from] InterruptError),
    #[error(transparent)]
    Daemon(#[from] DaemonError),
}

impl ErrorKind {
    pub fn severity(&self) -> Severity {
        match self {
            Self::Mfa(_) | Self::LibraryWarning(_) | Self::SyncWarning(_) | Self::ArchiveWarning(_) => {
                Severity::Warn
            }
            _ => Severity::Fatal,
        }
    }

    /// Short area name used in event payloads and report filenames.
    pub fn area(&self) -> &'static str {
        match self {
            Self::ICloud(_) => "icloud",
            Self::Auth(_) => "auth",
            Self::Mfa(_) => "mfa",
            Self::Library(_) | Self::LibraryWarning(_) => "library",
            Self::Sync(_) | Self::SyncWarning(_) => "sync",
            Self::Archive(_) | Self::ArchiveWarning(_) => "archive",
            Self::Token(_) => "token",
            Self::Interrupt(_) => "interrupt",
            Self::Daemon(_) => "daemon",
        }
    }

    /// Process exit code for a fatal of this kind.
    ///
    /// 0/1 are reserved (success, CLI misuse); 2 is interrupt.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Interrupt(_) => 2,
            Self::ICloud(_) => 3,
            Self::Auth(_) => 4,
            Self::Mfa(_) => 5,
            Self::Library(_) | Self::LibraryWarning(_) => 6,
            Self::Sync(_) | Self::SyncWarning(_) => 7,
            Self::Archive(_) | Self::ArchiveWarning(_) => 8,
            Self::Token(_) => 9,
            Self::Daemon(_) => 10,
        }
    }
}

/// An error kind plus report UUID, cause chain and structured context.
#[derive(Debug)]
pub struct AppError {
    pub kind: ErrorKind,
    /// Stamped when the error reaches the top-level handler.
    pub report_id: Uuid,
    cause: Option<Box<dyn std::error::Error + Send + Sync>>,
    context: BTreeMap<String, serde_json::Value>,
}

impl AppError {
    pub fn new(kind: impl Into<ErrorKind>) -> Self {
        Self {
            kind: kind.into(),
            report_id: Uuid::new_v4(),
            cause: None,
            context: BTreeMap::new(),
        }
    }

    pub fn with_cause(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn severity(&self) -> Severity {
        self.kind.severity()
    }

    pub fn context(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.context
    }

    pub fn exit_code(&self) -> i32 {
        self.kind.exit_code()
    }

    /// The HTTP status behind this error, when it is an HTTP-shaped failure.
    pub fn http_status(&self) -> Option<u16> {
        match self.kind {
            ErrorKind::ICloud(ICloudError::UnexpectedHttp(status)) => Some(status),
            _ => None,
        }
    }

    pub fn is_interrupt(&self) -> bool {
        matches!(self.kind, ErrorKind::Interrupt(_))
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(cause) = &self.cause {
            write!(f, ": {cause}")?;
        }
        Ok(())
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|c| c as &(dyn std::error::Error + 'static))
    }
}

macro_rules! impl_from_kind {
    ($($kind:ty),* $(,)?) => {
        $(impl From<$kind> for AppError {
            fn from(kind: $kind) -> Self {
                Self::new(kind)
            }
        })*
    };
}

impl_from_kind!(
    ICloudError,
    AuthError,
    MfaWarning,
    LibraryError,
    LibraryWarning,
    SyncError,
    SyncWarning,
    ArchiveError,
    ArchiveWarning,
    TokenError,
    InterruptError,
    DaemonError,
);
