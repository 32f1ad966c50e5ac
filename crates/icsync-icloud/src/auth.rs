//! Apple ID authentication state machine
//!
//! Drives the login sequence against the private Apple account endpoints:
//!
//! ```text
//! Unauthenticated --signin 200--> Trusted
//! Unauthenticated --signin 409--> MfaRequired --submit ok--> Authenticated
//! Authenticated   --trust-------> Trusted
//! Trusted         --setup-------> SetupDone
//! SetupDone       --warm-up------> Ready
//! ```
//!
//! The machine owns the session secrets captured from response headers and
//! the trust token persisted under the data directory. Cookies (`aasp` from
//! idmsa, the cloud session cookies from setup) live in a cookie store
//! shared with the photos client so every later request carries them.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, SET_COOKIE};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, info, warn};

use icsync_core::domain::errors::{
    AppError, AuthError, ICloudError, MfaWarning, TokenError,
};

use crate::mfa::MfaMethod;

/// Public widget key identifying the web photos client to idmsa.
const AUTH_CLIENT_ID: &str = "d39ba9916b7251055b22c7f910e2ea796ee65e98b2ddecea8f5dde8d9d1a815d";

/// Default base for the Apple ID auth endpoints.
const AUTH_BASE: &str = "https://idmsa.apple.com/appleauth/auth";

/// Default base for the iCloud setup endpoints.
const SETUP_BASE: &str = "https://setup.icloud.com/setup/ws/1";

// ============================================================================
// Session state
// ============================================================================

/// Position in the login sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    /// Signin returned 409; awaiting MFA input from the intake channel
    MfaRequired,
    /// MFA accepted; trust tokens not yet acquired
    Authenticated,
    /// Session token (and possibly a fresh trust token) in hand
    Trusted,
    /// Cloud cookies and photos domain acquired
    SetupDone,
    /// Warm-up query against the photos endpoint succeeded
    Ready,
}

/// Secrets captured from the signin response headers.
#[derive(Clone)]
pub struct AuthSecrets {
    pub scnt: String,
    pub session_id: String,
    pub aasp: String,
}

/// Tokens worth persisting across runs, captured from the trust response.
#[derive(Clone)]
pub struct AccountTokens {
    pub session_token: String,
    pub trust_token: Option<String>,
}

/// Endpoint bases, overridable for tests.
#[derive(Debug, Clone)]
pub struct AuthEndpoints {
    pub auth_base: String,
    pub setup_base: String,
}

impl Default for AuthEndpoints {
    fn default() -> Self {
        Self {
            auth_base: AUTH_BASE.to_string(),
            setup_base: SETUP_BASE.to_string(),
        }
    }
}

// ============================================================================
// Setup response wire types
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetupResponse {
    webservices: Option<Webservices>,
}

#[derive(Debug, Deserialize)]
struct Webservices {
    ckdatabasews: Option<WebserviceEntry>,
}

#[derive(Debug, Deserialize)]
struct WebserviceEntry {
    url: Option<String>,
}

// ============================================================================
// ICloudAuth
// ============================================================================

/// The auth state machine. One instance per process.
pub struct ICloudAuth {
    http: Client,
    endpoints: AuthEndpoints,
    username: String,
    password: String,
    state: AuthState,
    secrets: Option<AuthSecrets>,
    tokens: Option<AccountTokens>,
    photos_domain: Option<String>,
    trust_token_path: PathBuf,
}

impl ICloudAuth {
    /// Creates the machine with a cookie store shared with the photos client.
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        trust_token_path: PathBuf,
        cookies: Arc<reqwest::cookie::Jar>,
        timeout: Duration,
    ) -> Result<Self, AppError> {
        let http = Client::builder()
            .cookie_provider(cookies)
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::new(ICloudError::Request(e.to_string())))?;

        Ok(Self {
            http,
            endpoints: AuthEndpoints::default(),
            username: username.into(),
            password: password.into(),
            state: AuthState::Unauthenticated,
            secrets: None,
            tokens: None,
            photos_domain: None,
            trust_token_path,
        })
    }

    /// Overrides endpoint bases (tests only).
    pub fn with_endpoints(mut self, endpoints: AuthEndpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    pub fn photos_domain(&self) -> Option<&str> {
        self.photos_domain.as_deref()
    }

    /// Marks the warm-up query as done; the machine is fully ready.
    pub fn mark_ready(&mut self) {
        self.state = AuthState::Ready;
    }

    // ========================================================================
    // Trust token persistence
    // ========================================================================

    /// Reads the persisted trust token, if any.
    pub fn load_trust_token(&self) -> Option<String> {
        let token = std::fs::read_to_string(&self.trust_token_path).ok()?;
        let token = token.trim().to_string();
        if token.is_empty() {
            None
        } else {
            debug!("Loaded persisted trust token");
            Some(token)
        }
    }

    /// Deletes the persisted trust token (`--refresh-token`).
    pub fn clear_trust_token(&self) {
        if std::fs::remove_file(&self.trust_token_path).is_ok() {
            info!("Cleared persisted trust token");
        }
    }

    /// Persists the current trust token after a successful trust transition.
    pub fn persist_trust_token(&self) -> Result<(), AppError> {
        let Some(token) = self.tokens.as_ref().and_then(|t| t.trust_token.as_deref()) else {
            return Ok(());
        };
        std::fs::write(&self.trust_token_path, token)
            .map_err(|e| AppError::new(TokenError::Persist(e.to_string())))?;
        info!(path = %self.trust_token_path.display(), "Trust token persisted");
        Ok(())
    }

    // ========================================================================
    // Signin
    // ========================================================================

    /// POSTs `/signin`, transitioning to `Trusted` (200) or `MfaRequired`
    /// (409).
    pub async fn authenticate(&mut self) -> Result<AuthState, AppError> {
        info!(username = self.username, "Authenticating against idmsa");

        let trust_token = self.load_trust_token().unwrap_or_default();
        let body = serde_json::json!({
            "accountName": self.username,
            "password": self.password,
            "trustTokens": [trust_token],
        });

        let response = self
            .http
            .post(format!("{}/signin", self.endpoints.auth_base))
            .header("X-Apple-Widget-Key", AUTH_CLIENT_ID)
            .header("Accept", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::new(ICloudError::Request(e.to_string())))?;

        let status = response.status();
        match status {
            StatusCode::OK => {
                self.capture_signin_secrets(response.headers())?;
                // A trusted signin carries the session token directly.
                let session_token = header_value(response.headers(), "X-Apple-Session-Token")
                    .ok_or(AppError::new(AuthError::MissingSecret("X-Apple-Session-Token")))?;
                self.tokens = Some(AccountTokens {
                    session_token,
                    trust_token: None,
                });
                self.state = AuthState::Trusted;
                info!("Signin accepted, device already trusted");
            }
            StatusCode::CONFLICT => {
                self.capture_signin_secrets(response.headers())?;
                self.state = AuthState::MfaRequired;
                info!("Signin accepted, MFA challenge pending");
            }
            StatusCode::UNAUTHORIZED => return Err(AuthError::BadCredentials.into()),
            StatusCode::FORBIDDEN => return Err(AuthError::UnknownUser.into()),
            other => {
                return Err(AppError::new(ICloudError::UnexpectedHttp(other.as_u16()))
                    .with_context("endpoint", "signin"))
            }
        }

        Ok(self.state)
    }

    /// Captures `scnt`, the session id and the `aasp` cookie value.
    fn capture_signin_secrets(&mut self, headers: &HeaderMap) -> Result<(), AppError> {
        let scnt = header_value(headers, "scnt")
            .ok_or(AppError::new(AuthError::MissingSecret("scnt")))?;
        let session_id = header_value(headers, "X-Apple-ID-Session-Id")
            .ok_or(AppError::new(AuthError::MissingSecret("X-Apple-ID-Session-Id")))?;
        let aasp = headers
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .find_map(|cookie| {
                cookie
                    .strip_prefix("aasp=")
                    .map(|rest| rest.split(';').next().unwrap_or(rest).to_string())
            })
            .ok_or(AppError::new(AuthError::MissingSecret("aasp")))?;

        self.secrets = Some(AuthSecrets {
            scnt,
            session_id,
            aasp,
        });
        Ok(())
    }

    /// Headers required on every MFA/trust request.
    fn mfa_headers(&self) -> Result<HeaderMap, AppError> {
        let secrets = self
            .secrets
            .as_ref()
            .ok_or(AppError::new(AuthError::MissingSecret("auth secrets")))?;

        let mut headers = HeaderMap::new();
        headers.insert(
            "X-Apple-Widget-Key",
            HeaderValue::from_static(AUTH_CLIENT_ID),
        );
        headers.insert("Accept", HeaderValue::from_static("application/json"));
        headers.insert(
            "scnt",
            HeaderValue::from_str(&secrets.scnt)
                .map_err(|_| AppError::new(AuthError::MissingSecret("scnt")))?,
        );
        headers.insert(
            "X-Apple-ID-Session-Id",
            HeaderValue::from_str(&secrets.session_id)
                .map_err(|_| AppError::new(AuthError::MissingSecret("X-Apple-ID-Session-Id")))?,
        );
        Ok(headers)
    }

    // ========================================================================
    // MFA
    // ========================================================================

    /// Triggers a resend of the MFA code. Failure is a warning; the user can
    /// retry through the intake server.
    pub async fn resend_mfa(&self, method: &MfaMethod) -> Result<(), AppError> {
        info!(method = %method, "Requesting MFA code resend");

        let response = self
            .http
            .put(format!(
                "{}/{}",
                self.endpoints.auth_base,
                method.resend_path()
            ))
            .headers(self.mfa_headers()?)
            .json(&method.resend_payload())
            .send()
            .await
            .map_err(|e| {
                AppError::new(MfaWarning::ResendFailed {
                    method: method.to_string(),
                    reason: e.to_string(),
                })
            })?;

        if response.status() == method.resend_expected_status() {
            Ok(())
        } else {
            Err(AppError::new(MfaWarning::ResendFailed {
                method: method.to_string(),
                reason: format!("HTTP {}", response.status()),
            }))
        }
    }

    /// Submits an MFA code. A rejected code is fatal; the run ends.
    pub async fn submit_mfa(&mut self, method: &MfaMethod, code: &str) -> Result<(), AppError> {
        info!(method = %method, "Submitting MFA code");

        let response = self
            .http
            .post(format!(
                "{}/{}",
                self.endpoints.auth_base,
                method.submit_path()
            ))
            .headers(self.mfa_headers()?)
            .json(&method.submit_payload(code))
            .send()
            .await
            .map_err(|e| AppError::new(ICloudError::Request(e.to_string())))?;

        if response.status() != method.submit_expected_status() {
            warn!(status = %response.status(), "MFA code rejected");
            return Err(AppError::new(AuthError::BadMfaCode)
                .with_context("status", response.status().as_u16()));
        }

        self.state = AuthState::Authenticated;
        info!("MFA code accepted");
        Ok(())
    }

    // ========================================================================
    // Trust
    // ========================================================================

    /// GETs `/2sv/trust`, capturing the session token and a fresh trust
    /// token. These are the credentials worth persisting across runs.
    pub async fn trust(&mut self) -> Result<(), AppError> {
        debug!("Acquiring trust tokens");

        let response = self
            .http
            .get(format!("{}/2sv/trust", self.endpoints.auth_base))
            .headers(self.mfa_headers()?)
            .send()
            .await
            .map_err(|e| AppError::new(ICloudError::Request(e.to_string())))?;

        if !response.status().is_success() {
            return Err(AppError::new(ICloudError::UnexpectedHttp(
                response.status().as_u16(),
            ))
            .with_context("endpoint", "trust"));
        }

        let session_token = header_value(response.headers(), "X-Apple-Session-Token")
            .ok_or(AppError::new(TokenError::NotIssued))?;
        let trust_token = header_value(response.headers(), "X-Apple-TwoSV-Trust-Token");
        if trust_token.is_none() {
            warn!("Trust response carried no trust token; next run will MFA again");
        }

        self.tokens = Some(AccountTokens {
            session_token,
            trust_token,
        });
        self.state = AuthState::Trusted;
        info!("Trust established");
        Ok(())
    }

    // ========================================================================
    // Setup
    // ========================================================================

    /// POSTs the account login to the setup endpoint. The response cookies
    /// land in the shared cookie store; the body names the per-user photos
    /// domain.
    pub async fn setup(&mut self) -> Result<String, AppError> {
        let tokens = self
            .tokens
            .as_ref()
            .ok_or(AppError::new(AuthError::MissingSecret("session token")))?;

        debug!("Running account setup");
        let body = serde_json::json!({
            "dsWebAuthToken": tokens.session_token,
            "trustToken": tokens.trust_token.clone().unwrap_or_default(),
        });

        let response = self
            .http
            .post(format!("{}/accountLogin", self.endpoints.setup_base))
            .header("Accept", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::new(ICloudError::Request(e.to_string())))?;

        if !response.status().is_success() {
            return Err(AppError::new(ICloudError::UnexpectedHttp(
                response.status().as_u16(),
            ))
            .with_context("endpoint", "setup"));
        }

        let setup: SetupResponse = response
            .json()
            .await
            .map_err(|e| AppError::new(ICloudError::UnexpectedResponse(e.to_string())))?;

        let domain = setup
            .webservices
            .and_then(|ws| ws.ckdatabasews)
            .and_then(|entry| entry.url)
            .ok_or(AppError::new(ICloudError::PhotosServiceUnavailable))?;

        self.photos_domain = Some(domain.clone());
        self.state = AuthState::SetupDone;
        info!(domain, "Account setup complete");
        Ok(domain)
    }
}

/// Reads a header as an owned string.
fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine(dir: &tempfile::TempDir) -> ICloudAuth {
        ICloudAuth::new(
            "user@icloud.com",
            "secret",
            dir.path().join(".trust-token.icloud"),
            Arc::new(reqwest::cookie::Jar::default()),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn test_initial_state() {
        let dir = tempfile::tempdir().unwrap();
        let auth = machine(&dir);
        assert_eq!(auth.state(), AuthState::Unauthenticated);
        assert!(auth.photos_domain().is_none());
    }

    #[test]
    fn test_trust_token_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut auth = machine(&dir);
        assert!(auth.load_trust_token().is_none());

        auth.tokens = Some(AccountTokens {
            session_token: "session".to_string(),
            trust_token: Some("trusty".to_string()),
        });
        auth.persist_trust_token().unwrap();
        assert_eq!(auth.load_trust_token().as_deref(), Some("trusty"));

        auth.clear_trust_token();
        assert!(auth.load_trust_token().is_none());
    }

    #[test]
    fn test_persist_without_token_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let auth = machine(&dir);
        auth.persist_trust_token().unwrap();
        assert!(!dir.path().join(".trust-token.icloud").exists());
    }

    #[test]
    fn test_capture_signin_secrets() {
        let dir = tempfile::tempdir().unwrap();
        let mut auth = machine(&dir);

        let mut headers = HeaderMap::new();
        headers.insert("scnt", HeaderValue::from_static("scnt-value"));
        headers.insert(
            "X-Apple-ID-Session-Id",
            HeaderValue::from_static("session-id"),
        );
        headers.append(
            SET_COOKIE,
            HeaderValue::from_static("aasp=cookie-value; Secure; HttpOnly"),
        );

        auth.capture_signin_secrets(&headers).unwrap();
        let secrets = auth.secrets.as_ref().unwrap();
        assert_eq!(secrets.scnt, "scnt-value");
        assert_eq!(secrets.session_id, "session-id");
        assert_eq!(secrets.aasp, "cookie-value");
    }

    #[test]
    fn test_capture_signin_secrets_missing_aasp() {
        let dir = tempfile::tempdir().unwrap();
        let mut auth = machine(&dir);

        let mut headers = HeaderMap::new();
        headers.insert("scnt", HeaderValue::from_static("scnt-value"));
        headers.insert(
            "X-Apple-ID-Session-Id",
            HeaderValue::from_static("session-id"),
        );

        let err = auth.capture_signin_secrets(&headers).unwrap_err();
        assert!(err.to_string().contains("aasp"));
    }

    #[test]
    fn test_mfa_headers_require_secrets() {
        let dir = tempfile::tempdir().unwrap();
        let auth = machine(&dir);
        assert!(auth.mfa_headers().is_err());
    }
}
