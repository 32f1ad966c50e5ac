//! Error report generation, persistence and upload

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use icsync_core::domain::errors::{AppError, Severity};

/// Default endpoint error reports are POSTed to.
const REPORT_ENDPOINT: &str = "https://icsync.enigmora.com/api/reports";

/// A structured error report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReport {
    /// The error's report UUID, also shown to the user on abort
    pub id: String,
    pub timestamp: String,
    pub version: String,
    /// Error area (auth, sync, library, ...)
    pub area: String,
    pub fatal: bool,
    pub message: String,
    /// Cause chain, outermost first
    pub causes: Vec<String>,
    /// The error's structured context bag
    pub context: BTreeMap<String, serde_json::Value>,
    /// Path of the log file covering the failed run
    pub log_path: Option<String>,
}

impl ErrorReport {
    /// Builds a report from a fatal error.
    pub fn from_error(err: &AppError, log_path: Option<&Path>) -> Self {
        let mut causes = Vec::new();
        let mut source = std::error::Error::source(err);
        while let Some(cause) = source {
            causes.push(cause.to_string());
            source = cause.source();
        }

        Self {
            id: err.report_id.to_string(),
            timestamp: Utc::now().to_rfc3339(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            area: err.kind.area().to_string(),
            fatal: err.severity() == Severity::Fatal,
            message: err.to_string(),
            causes,
            context: err.context().clone(),
            log_path: log_path.map(|p| p.display().to_string()),
        }
    }
}

/// Persists and optionally uploads error reports.
pub struct Reporter {
    reports_dir: PathBuf,
    enabled: bool,
    endpoint: String,
}

impl Reporter {
    pub fn new(reports_dir: PathBuf, enabled: bool) -> Self {
        Self {
            reports_dir,
            enabled,
            endpoint: REPORT_ENDPOINT.to_string(),
        }
    }

    /// Overrides the upload endpoint (tests only).
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Handles a fatal error: persist locally, then upload when enabled.
    ///
    /// Interrupts are skipped entirely. Reporting failures are logged and
    /// swallowed; a broken reporter must never mask the original error.
    pub async fn report(&self, err: &AppError, log_path: Option<&Path>) -> Option<PathBuf> {
        if !self.enabled || err.is_interrupt() {
            return None;
        }

        let report = ErrorReport::from_error(err, log_path);
        let path = match self.persist(&report) {
            Ok(path) => path,
            Err(persist_err) => {
                warn!(error = %persist_err, "Failed to persist error report");
                return None;
            }
        };

        if let Err(upload_err) = self.upload(&report).await {
            warn!(error = %upload_err, "Failed to upload error report");
        }
        Some(path)
    }

    /// Writes the report as pretty JSON. File name: `error-{date}-{uuid8}.json`.
    fn persist(&self, report: &ErrorReport) -> anyhow::Result<PathBuf> {
        std::fs::create_dir_all(&self.reports_dir)?;

        let date = Utc::now().format("%Y%m%d");
        let short_id = &report.id[..8];
        let path = self.reports_dir.join(format!("error-{date}-{short_id}.json"));

        std::fs::write(&path, serde_json::to_string_pretty(report)?)?;
        debug!(path = %path.display(), "Error report persisted");
        Ok(path)
    }

    async fn upload(&self, report: &ErrorReport) -> anyhow::Result<()> {
        let response = reqwest::Client::new()
            .post(&self.endpoint)
            .json(report)
            .send()
            .await?;
        response.error_for_status()?;
        debug!(id = report.id, "Error report uploaded");
        Ok(())
    }
}
