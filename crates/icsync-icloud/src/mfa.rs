//! MFA methods and the local intake server
//!
//! Each MFA method owns its endpoint paths, payload shapes and expected
//! status codes. The intake server is a minimal hyper HTTP server bound on
//! the configured port; it forwards `(method, code)` pairs into the auth
//! state machine over a channel and stops itself once a code has been
//! submitted.
//!
//! ```text
//! POST /resend?method=sms&phoneNumberId=1  -> MfaInput::Resend
//! POST /mfa?code=123456                    -> MfaInput::Submit, server stops
//! ```

use std::fmt::{self, Display, Formatter};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use reqwest::StatusCode as HttpStatus;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// ============================================================================
// MfaMethod
// ============================================================================

/// A second-factor delivery method. Each owns its wire shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MfaMethod {
    /// Push prompt on a trusted device
    Device,
    /// Text message to a registered phone
    Sms { phone_id: u32 },
    /// Voice call to a registered phone
    Voice { phone_id: u32 },
}

impl MfaMethod {
    /// Parses the intake server's `method` query value.
    pub fn parse(name: &str, phone_id: Option<u32>) -> Option<Self> {
        let id = phone_id.unwrap_or(1);
        match name {
            "device" => Some(Self::Device),
            "sms" => Some(Self::Sms { phone_id: id }),
            "voice" => Some(Self::Voice { phone_id: id }),
            _ => None,
        }
    }

    /// Path (relative to the auth base) for a resend request.
    pub fn resend_path(&self) -> &'static str {
        match self {
            Self::Device => "verify/trusteddevice",
            Self::Sms { .. } | Self::Voice { .. } => "verify/phone",
        }
    }

    /// Path (relative to the auth base) for a code submission.
    pub fn submit_path(&self) -> &'static str {
        match self {
            Self::Device => "verify/trusteddevice/securitycode",
            Self::Sms { .. } | Self::Voice { .. } => "verify/phone/securitycode",
        }
    }

    pub fn resend_payload(&self) -> serde_json::Value {
        match self {
            Self::Device => serde_json::json!({}),
            Self::Sms { phone_id } => serde_json::json!({
                "phoneNumber": {"id": phone_id},
                "mode": "sms",
            }),
            Self::Voice { phone_id } => serde_json::json!({
                "phoneNumber": {"id": phone_id},
                "mode": "voice",
            }),
        }
    }

    pub fn submit_payload(&self, code: &str) -> serde_json::Value {
        match self {
            Self::Device => serde_json::json!({
                "securityCode": {"code": code},
            }),
            Self::Sms { phone_id } => serde_json::json!({
                "securityCode": {"code": code},
                "phoneNumber": {"id": phone_id},
                "mode": "sms",
            }),
            Self::Voice { phone_id } => serde_json::json!({
                "securityCode": {"code": code},
                "phoneNumber": {"id": phone_id},
                "mode": "voice",
            }),
        }
    }

    pub fn resend_expected_status(&self) -> HttpStatus {
        match self {
            Self::Device => HttpStatus::ACCEPTED,
            Self::Sms { .. } | Self::Voice { .. } => HttpStatus::OK,
        }
    }

    pub fn submit_expected_status(&self) -> HttpStatus {
        match self {
            Self::Device => HttpStatus::NO_CONTENT,
            Self::Sms { .. } | Self::Voice { .. } => HttpStatus::OK,
        }
    }
}

impl Display for MfaMethod {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Device => write!(f, "device"),
            Self::Sms { .. } => write!(f, "sms"),
            Self::Voice { .. } => write!(f, "voice"),
        }
    }
}

// ============================================================================
// Intake server
// ============================================================================

/// Input delivered from the intake server to the auth state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MfaInput {
    Resend(MfaMethod),
    Submit(MfaMethod, String),
}

/// The local HTTP server accepting the user's second factor.
pub struct MfaServer {
    cancel: CancellationToken,
}

impl MfaServer {
    /// Binds the server and starts accepting requests in the background.
    ///
    /// The returned receiver yields [`MfaInput`]s in arrival order. The
    /// server stops on its own after forwarding a submit, or when
    /// [`stop`](MfaServer::stop) is called.
    pub async fn start(port: u16) -> Result<(Self, mpsc::UnboundedReceiver<MfaInput>)> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .with_context(|| format!("Failed to bind MFA server on port {port}"))?;
        info!(port, "MFA intake server listening");

        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let accept_cancel = cancel.clone();
        // Default when the user submits without an explicit resend first.
        let last_method = Arc::new(Mutex::new(MfaMethod::Device));

        tokio::spawn(async move {
            loop {
                let (stream, _addr) = tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(error = %e, "MFA server accept failed");
                            continue;
                        }
                    },
                    _ = accept_cancel.cancelled() => break,
                };

                let io = TokioIo::new(stream);
                let tx = tx.clone();
                let last_method = last_method.clone();
                let conn_cancel = accept_cancel.clone();

                let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                    let tx = tx.clone();
                    let last_method = last_method.clone();
                    let conn_cancel = conn_cancel.clone();
                    async move {
                        let (status, body) =
                            match parse_intake_request(req.method(), req.uri(), &last_method) {
                                Ok(input) => {
                                    let submitted = matches!(input, MfaInput::Submit(..));
                                    debug!(?input, "MFA input accepted");
                                    let _ = tx.send(input);
                                    if submitted {
                                        // Job done; wind the server down.
                                        conn_cancel.cancel();
                                    }
                                    (StatusCode::OK, "ok".to_string())
                                }
                                Err(reason) => {
                                    warn!(reason, "Rejected MFA intake request");
                                    (StatusCode::BAD_REQUEST, reason)
                                }
                            };
                        Ok::<_, hyper::Error>(
                            Response::builder()
                                .status(status)
                                .header("Content-Type", "text/plain")
                                .body(Full::new(Bytes::from(body)))
                                .expect("static response builds"),
                        )
                    }
                });

                tokio::spawn(async move {
                    if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                        debug!(error = %e, "MFA server connection ended");
                    }
                });
            }
            info!("MFA intake server stopped");
        });

        Ok((Self { cancel }, rx))
    }

    /// Stops the accept loop.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for MfaServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Parses one intake request into an [`MfaInput`].
///
/// `last_method` is updated by resends and consumed by submits, so a code
/// posted after `/resend?method=sms` is validated against the sms endpoint.
fn parse_intake_request(
    method: &Method,
    uri: &Uri,
    last_method: &Mutex<MfaMethod>,
) -> std::result::Result<MfaInput, String> {
    if method != Method::POST {
        return Err(format!("unsupported method {method}"));
    }

    let query: Vec<(String, String)> = uri
        .query()
        .map(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect()
        })
        .unwrap_or_default();
    let get = |key: &str| query.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str());

    match uri.path() {
        "/mfa" => {
            let code = get("code").ok_or("missing code parameter")?;
            if code.len() != 6 || !code.chars().all(|c| c.is_ascii_digit()) {
                return Err(format!("code must be 6 digits, got {code:?}"));
            }
            let method = *last_method.lock().expect("mfa method lock");
            Ok(MfaInput::Submit(method, code.to_string()))
        }
        "/resend" => {
            let name = get("method").ok_or("missing method parameter")?;
            let phone_id = get("phoneNumberId").and_then(|v| v.parse().ok());
            let method = MfaMethod::parse(name, phone_id)
                .ok_or_else(|| format!("unknown method {name:?}"))?;
            *last_method.lock().expect("mfa method lock") = method;
            Ok(MfaInput::Resend(method))
        }
        other => Err(format!("unknown path {other}")),
    }
}
