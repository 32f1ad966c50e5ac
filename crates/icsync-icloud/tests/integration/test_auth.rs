//! Auth state machine integration tests

use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use icsync_core::domain::errors::{AuthError, ErrorKind, ICloudError};
use icsync_core::events::EventSink;
use icsync_icloud::auth::AuthState;
use icsync_icloud::mfa::MfaMethod;
use icsync_icloud::remote::login;

use crate::common::{self, BodyContains};

#[tokio::test]
async fn test_signin_200_goes_straight_to_trusted() {
    let server = MockServer::start().await;
    common::mount_signin(&server, 200).await;

    let dir = tempfile::tempdir().unwrap();
    let mut auth = common::auth_against(&server, &dir);

    let state = auth.authenticate().await.unwrap();
    assert_eq!(state, AuthState::Trusted);
}

#[tokio::test]
async fn test_signin_409_requires_mfa() {
    let server = MockServer::start().await;
    common::mount_signin(&server, 409).await;

    let dir = tempfile::tempdir().unwrap();
    let mut auth = common::auth_against(&server, &dir);

    let state = auth.authenticate().await.unwrap();
    assert_eq!(state, AuthState::MfaRequired);
}

#[tokio::test]
async fn test_signin_error_mapping() {
    for status in [401u16, 403, 500] {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/signin"))
            .respond_with(ResponseTemplate::new(status))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let mut auth = common::auth_against(&server, &dir);
        let err = auth.authenticate().await.unwrap_err();

        match (status, &err.kind) {
            (401, ErrorKind::Auth(AuthError::BadCredentials)) => {}
            (403, ErrorKind::Auth(AuthError::UnknownUser)) => {}
            (500, ErrorKind::ICloud(ICloudError::UnexpectedHttp(500))) => {}
            other => panic!("unexpected mapping for {status}: {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_signin_sends_persisted_trust_token() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/signin"))
        .and(BodyContains("previously-saved-token"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("scnt", "s")
                .insert_header("X-Apple-ID-Session-Id", "i")
                .insert_header("X-Apple-Session-Token", "t")
                .insert_header("Set-Cookie", "aasp=c"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join(".trust-token.icloud"),
        "previously-saved-token",
    )
    .unwrap();

    let mut auth = common::auth_against(&server, &dir);
    let state = auth.authenticate().await.unwrap();
    assert_eq!(state, AuthState::Trusted);
}

#[tokio::test]
async fn test_mfa_submit_requires_captured_secrets_on_wire() {
    let server = MockServer::start().await;
    common::mount_signin(&server, 409).await;

    // The submit must carry the secrets captured from the signin response.
    Mock::given(method("POST"))
        .and(path("/verify/trusteddevice/securitycode"))
        .and(header("scnt", "scnt-value"))
        .and(header("X-Apple-ID-Session-Id", "session-id-value"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let mut auth = common::auth_against(&server, &dir);
    auth.authenticate().await.unwrap();
    auth.submit_mfa(&MfaMethod::Device, "123456").await.unwrap();
    assert_eq!(auth.state(), AuthState::Authenticated);
}

#[tokio::test]
async fn test_mfa_rejected_code_is_fatal() {
    let server = MockServer::start().await;
    common::mount_signin(&server, 409).await;
    Mock::given(method("POST"))
        .and(path("/verify/trusteddevice/securitycode"))
        .respond_with(ResponseTemplate::new(400))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let mut auth = common::auth_against(&server, &dir);
    auth.authenticate().await.unwrap();

    let err = auth.submit_mfa(&MfaMethod::Device, "000000").await.unwrap_err();
    assert!(matches!(err.kind, ErrorKind::Auth(AuthError::BadMfaCode)));
}

#[tokio::test]
async fn test_mfa_resend_failure_is_warning() {
    let server = MockServer::start().await;
    common::mount_signin(&server, 409).await;
    Mock::given(method("PUT"))
        .and(path("/verify/phone"))
        .respond_with(ResponseTemplate::new(423))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let mut auth = common::auth_against(&server, &dir);
    auth.authenticate().await.unwrap();

    let err = auth
        .resend_mfa(&MfaMethod::Sms { phone_id: 1 })
        .await
        .unwrap_err();
    assert_eq!(
        err.severity(),
        icsync_core::domain::errors::Severity::Warn
    );
}

#[tokio::test]
async fn test_trust_captures_and_persists_tokens() {
    let server = MockServer::start().await;
    common::mount_signin(&server, 409).await;
    Mock::given(method("POST"))
        .and(path("/verify/trusteddevice/securitycode"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;
    common::mount_trust(&server).await;

    let dir = tempfile::tempdir().unwrap();
    let mut auth = common::auth_against(&server, &dir);
    auth.authenticate().await.unwrap();
    auth.submit_mfa(&MfaMethod::Device, "123456").await.unwrap();
    auth.trust().await.unwrap();
    assert_eq!(auth.state(), AuthState::Trusted);

    auth.persist_trust_token().unwrap();
    let persisted = std::fs::read_to_string(dir.path().join(".trust-token.icloud")).unwrap();
    assert_eq!(persisted, "fresh-trust-token");
}

#[tokio::test]
async fn test_setup_extracts_photos_domain() {
    let server = MockServer::start().await;
    common::mount_signin(&server, 200).await;
    common::mount_setup(&server, "https://p42-ckdatabasews.icloud.com:443").await;

    let dir = tempfile::tempdir().unwrap();
    let mut auth = common::auth_against(&server, &dir);
    auth.authenticate().await.unwrap();

    let domain = auth.setup().await.unwrap();
    assert_eq!(domain, "https://p42-ckdatabasews.icloud.com:443");
    assert_eq!(auth.state(), AuthState::SetupDone);
}

#[tokio::test]
async fn test_setup_without_photos_service_is_fatal() {
    let server = MockServer::start().await;
    common::mount_signin(&server, 200).await;
    Mock::given(method("POST"))
        .and(path("/accountLogin"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({"webservices": {}})),
        )
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let mut auth = common::auth_against(&server, &dir);
    auth.authenticate().await.unwrap();

    let err = auth.setup().await.unwrap_err();
    assert!(matches!(
        err.kind,
        ErrorKind::ICloud(ICloudError::PhotosServiceUnavailable)
    ));
}

#[tokio::test]
async fn test_login_fail_on_mfa_short_circuits() {
    let server = MockServer::start().await;
    common::mount_signin(&server, 409).await;

    let dir = tempfile::tempdir().unwrap();
    let mut auth = common::auth_against(&server, &dir);

    let err = login(&mut auth, 38280, true, &EventSink::disconnected())
        .await
        .unwrap_err();
    assert!(matches!(err.kind, ErrorKind::Auth(AuthError::MfaRequired)));
}

/// End-to-end MFA flow over the intake server: resend via sms, then submit
/// the code, then trust + setup, with the trust token persisted.
#[tokio::test]
async fn test_login_full_sms_flow() {
    let server = MockServer::start().await;
    common::mount_signin(&server, 409).await;
    Mock::given(method("PUT"))
        .and(path("/verify/phone"))
        .and(BodyContains("\"sms\""))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/verify/phone/securitycode"))
        .and(BodyContains("123456"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    common::mount_trust(&server).await;
    common::mount_setup(&server, "https://p42-ckdatabasews.icloud.com:443").await;

    let dir = tempfile::tempdir().unwrap();
    let mut auth = common::auth_against(&server, &dir);

    // Simulate the user driving the intake server.
    let mfa_port = 38281;
    tokio::spawn(async move {
        let client = reqwest::Client::new();
        let base = format!("http://127.0.0.1:{mfa_port}");
        for _ in 0..50 {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            if client
                .post(format!("{base}/resend?method=sms&phoneNumberId=1"))
                .send()
                .await
                .is_ok()
            {
                let _ = client.post(format!("{base}/mfa?code=123456")).send().await;
                break;
            }
        }
    });

    login(&mut auth, mfa_port, false, &EventSink::disconnected())
        .await
        .unwrap();

    assert_eq!(auth.state(), AuthState::SetupDone);
    assert_eq!(
        auth.photos_domain(),
        Some("https://p42-ckdatabasews.icloud.com:443")
    );
    let persisted = std::fs::read_to_string(dir.path().join(".trust-token.icloud")).unwrap();
    assert_eq!(persisted, "fresh-trust-token");
}
