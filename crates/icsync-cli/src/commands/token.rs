//! `icsync token` - validate credentials and acquire a trust token

use std::time::Duration;

use tracing::info;

use icsync_core::config::Config;
use icsync_core::domain::errors::{AppError, TokenError};
use icsync_core::events::EventSink;
use icsync_icloud::auth::ICloudAuth;
use icsync_icloud::remote::login;

use super::with_lock;

/// Runs the auth sequence end-to-end and prints the acquired trust token.
pub async fn execute(config: &Config, events: &EventSink) -> Result<(), AppError> {
    with_lock(config, events, || async {
        let mut auth = ICloudAuth::new(
            config.username.clone(),
            config.password.clone(),
            config.trust_token_path(),
            icsync_icloud::new_cookie_jar(),
            Duration::from_secs(config.request_timeout_secs),
        )?;

        if config.refresh_token {
            auth.clear_trust_token();
        }
        if let Some(token) = &config.trust_token {
            std::fs::write(config.trust_token_path(), token)
                .map_err(|e| AppError::new(TokenError::Persist(e.to_string())))?;
        }

        login(&mut auth, config.mfa_port, config.fail_on_mfa, events).await?;

        let token = auth
            .load_trust_token()
            .ok_or(AppError::new(TokenError::NotIssued))?;
        info!(path = %config.trust_token_path().display(), "Trust token acquired");
        println!("{token}");
        Ok(())
    })
    .await
}
