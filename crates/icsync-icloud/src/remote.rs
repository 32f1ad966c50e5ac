//! The remote-library adapter
//!
//! [`ICloudRemote`] stitches the auth state machine and the photos client
//! into the [`RemoteLibrary`] port the sync engine consumes. It owns the
//! login orchestration (including the interactive MFA loop) and the
//! retry-once-on-401 policy of the query layer.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{info, warn};

use icsync_core::config::Config;
use icsync_core::domain::errors::{AppError, AuthError, ICloudError, TokenError};
use icsync_core::domain::{Album, Asset};
use icsync_core::events::{Event, EventSink};
use icsync_core::ports::{AssetStream, RemoteLibrary};

use crate::auth::{AuthState, ICloudAuth};
use crate::client::{is_unauthorized, PhotosClient};
use crate::mfa::{MfaInput, MfaServer};
use crate::records::RecordParser;

/// Production implementation of [`RemoteLibrary`] against iCloud.
pub struct ICloudRemote {
    auth: Mutex<ICloudAuth>,
    client: Mutex<PhotosClient>,
    cookies: Arc<reqwest::cookie::Jar>,
    timeout: Duration,
    mfa_port: u16,
    events: EventSink,
}

impl ICloudRemote {
    /// Authenticates end-to-end and returns a ready remote.
    ///
    /// Runs signin, the MFA loop when challenged, trust acquisition, account
    /// setup and the warm-up query. The trust token is persisted after every
    /// successful trust transition.
    pub async fn connect(config: &Config, events: EventSink) -> Result<Self, AppError> {
        let cookies = Arc::new(reqwest::cookie::Jar::default());
        let timeout = Duration::from_secs(config.request_timeout_secs);

        let mut auth = ICloudAuth::new(
            config.username.clone(),
            config.password.clone(),
            config.trust_token_path(),
            cookies.clone(),
            timeout,
        )?;

        if config.refresh_token {
            auth.clear_trust_token();
        }
        if let Some(token) = &config.trust_token {
            // An explicitly supplied token replaces whatever is persisted.
            std::fs::write(config.trust_token_path(), token)
                .map_err(|e| AppError::new(TokenError::Persist(e.to_string())))?;
        }

        login(&mut auth, config.mfa_port, config.fail_on_mfa, &events).await?;

        let domain = auth
            .photos_domain()
            .ok_or(AppError::new(ICloudError::PhotosServiceUnavailable))?
            .to_string();
        let client = PhotosClient::new(&domain, cookies.clone(), timeout)?;
        client.warmup().await?;
        auth.mark_ready();
        info!("iCloud session ready");

        Ok(Self {
            auth: Mutex::new(auth),
            client: Mutex::new(client),
            cookies,
            timeout,
            mfa_port: config.mfa_port,
            events,
        })
    }

    async fn current_client(&self) -> PhotosClient {
        self.client.lock().await.clone()
    }

    /// Re-runs the login sequence after a session expiry.
    ///
    /// The persisted trust token should bypass MFA; an MFA challenge during
    /// an unattended re-auth is fatal for this run.
    async fn refresh_session(&self) -> Result<(), AppError> {
        warn!("Session expired, re-authenticating");
        let mut auth = self.auth.lock().await;
        login(&mut auth, self.mfa_port, true, &self.events).await?;

        let domain = auth
            .photos_domain()
            .ok_or(AppError::new(ICloudError::PhotosServiceUnavailable))?
            .to_string();
        let client = PhotosClient::new(&domain, self.cookies.clone(), self.timeout)?;
        client.warmup().await?;
        auth.mark_ready();

        *self.client.lock().await = client;
        Ok(())
    }

    /// Runs `op` against the photos client, re-authenticating and retrying
    /// exactly once on a 401.
    async fn with_session<T, F, Fut>(&self, op: F) -> Result<T, AppError>
    where
        F: Fn(PhotosClient) -> Fut,
        Fut: std::future::Future<Output = Result<T, AppError>>,
    {
        match op(self.current_client().await).await {
            Err(err) if is_unauthorized(&err) => {
                self.refresh_session().await?;
                op(self.current_client().await).await
            }
            other => other,
        }
    }
}

#[async_trait]
impl RemoteLibrary for ICloudRemote {
    async fn fetch_assets(&self) -> Result<Vec<Asset>> {
        let assets = self
            .with_session(|client| async move { client.fetch_all_assets().await })
            .await?;
        Ok(assets)
    }

    async fn fetch_albums(&self) -> Result<Vec<Album>> {
        let albums = self
            .with_session(|client| async move { client.fetch_all_albums().await })
            .await?;
        Ok(albums)
    }

    async fn download(&self, asset: &Asset) -> Result<AssetStream> {
        let stream = self
            .with_session(|client| async move { client.download(asset).await })
            .await?;
        Ok(stream)
    }

    async fn refresh_asset(&self, asset: &Asset) -> Result<Asset> {
        let mut names = vec![asset.record_name.clone()];
        if let Some(paired) = &asset.asset_record_name {
            names.push(paired.clone());
        }

        let records = self
            .with_session(|client| {
                let names = names.clone();
                async move { client.lookup(&names).await }
            })
            .await?;

        let refreshed =
            RecordParser::parse_assets(&records, &Default::default()).map_err(AppError::new)?;
        let replacement = refreshed
            .into_iter()
            .find(|candidate| candidate.origin == asset.origin)
            .ok_or_else(|| {
                AppError::new(ICloudError::UnexpectedResponse(format!(
                    "lookup of {} returned no {:?} resource",
                    asset.record_name, asset.origin
                )))
            })?;
        Ok(replacement)
    }

    async fn delete_assets(&self, record_names: &[String]) -> Result<()> {
        self.with_session(|client| {
            let names = record_names.to_vec();
            async move { client.delete_records(&names).await }
        })
        .await?;
        Ok(())
    }

    async fn reauthenticate(&self) -> Result<()> {
        self.refresh_session().await?;
        Ok(())
    }
}

// ============================================================================
// Login orchestration
// ============================================================================

/// Drives the state machine from `Unauthenticated` to `SetupDone`.
///
/// When signin answers 409 the MFA intake server is started and inputs are
/// processed until a code is accepted: resend failures are warnings, a
/// rejected code is fatal. `fail_on_mfa` short-circuits the challenge for
/// unattended runs.
pub async fn login(
    auth: &mut ICloudAuth,
    mfa_port: u16,
    fail_on_mfa: bool,
    events: &EventSink,
) -> Result<(), AppError> {
    let state = auth.authenticate().await?;

    if state == AuthState::MfaRequired {
        if fail_on_mfa {
            return Err(AuthError::MfaRequired.into());
        }

        events.emit(Event::MfaAwaited { port: mfa_port });
        let (server, mut inputs) = MfaServer::start(mfa_port)
            .await
            .map_err(|e| AppError::new(ICloudError::Request(e.to_string())))?;

        while let Some(input) = inputs.recv().await {
            match input {
                MfaInput::Resend(method) => {
                    if let Err(warning) = auth.resend_mfa(&method).await {
                        events.warn(&warning);
                    }
                }
                MfaInput::Submit(method, code) => {
                    auth.submit_mfa(&method, &code).await?;
                    break;
                }
            }
        }
        server.stop();

        if auth.state() != AuthState::Authenticated {
            // Channel closed without a successful submit.
            return Err(AuthError::MfaRequired.into());
        }
        auth.trust().await?;
    }

    auth.persist_trust_token()?;
    auth.setup().await?;
    Ok(())
}
