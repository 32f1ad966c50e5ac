//! Shared test helpers for the iCloud integration tests
//!
//! Provides wiremock matchers and canned endpoint setups for the idmsa,
//! setup and photos-database surfaces.

use std::sync::Arc;
use std::time::Duration;

use wiremock::matchers::{method, path};
use wiremock::{Match, Mock, MockServer, Request, ResponseTemplate};

use icsync_icloud::auth::{AuthEndpoints, ICloudAuth};
use icsync_icloud::client::PhotosClient;

/// Matches requests whose body contains the given substring.
///
/// The CloudKit query envelope is awkward to match structurally; a
/// substring on the serialized body keeps each mock unambiguous.
pub struct BodyContains(pub &'static str);

impl Match for BodyContains {
    fn matches(&self, request: &Request) -> bool {
        String::from_utf8_lossy(&request.body).contains(self.0)
    }
}

/// Matches requests whose body does NOT contain the given substring.
pub struct BodyLacks(pub &'static str);

impl Match for BodyLacks {
    fn matches(&self, request: &Request) -> bool {
        !String::from_utf8_lossy(&request.body).contains(self.0)
    }
}

/// An auth machine pointed at a mock server, with its trust token file in
/// the given temp dir.
pub fn auth_against(server: &MockServer, dir: &tempfile::TempDir) -> ICloudAuth {
    ICloudAuth::new(
        "user@icloud.com",
        "hunter2",
        dir.path().join(".trust-token.icloud"),
        Arc::new(reqwest::cookie::Jar::default()),
        Duration::from_secs(5),
    )
    .unwrap()
    .with_endpoints(AuthEndpoints {
        auth_base: server.uri(),
        setup_base: server.uri(),
    })
}

/// A photos client pointed directly at a mock server.
pub fn photos_against(server: &MockServer) -> PhotosClient {
    PhotosClient::with_base_url(server.uri())
}

/// Mounts a signin mock answering `status` with the standard secret headers.
pub async fn mount_signin(server: &MockServer, status: u16) {
    Mock::given(method("POST"))
        .and(path("/signin"))
        .respond_with(
            ResponseTemplate::new(status)
                .insert_header("scnt", "scnt-value")
                .insert_header("X-Apple-ID-Session-Id", "session-id-value")
                .insert_header("X-Apple-Session-Token", "signin-session-token")
                .insert_header("Set-Cookie", "aasp=aasp-cookie-value; Secure; HttpOnly"),
        )
        .mount(server)
        .await;
}

/// Mounts the trust endpoint returning fresh session and trust tokens.
pub async fn mount_trust(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/2sv/trust"))
        .respond_with(
            ResponseTemplate::new(204)
                .insert_header("X-Apple-Session-Token", "trusted-session-token")
                .insert_header("X-Apple-TwoSV-Trust-Token", "fresh-trust-token"),
        )
        .mount(server)
        .await;
}

/// Mounts the account setup endpoint exposing the photos webservice.
pub async fn mount_setup(server: &MockServer, photos_domain: &str) {
    Mock::given(method("POST"))
        .and(path("/accountLogin"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "webservices": {
                    "ckdatabasews": {
                        "url": photos_domain,
                        "status": "active"
                    }
                }
            })),
        )
        .mount(server)
        .await;
}

/// A single-page query response with the given records.
pub fn query_page(records: serde_json::Value) -> serde_json::Value {
    serde_json::json!({ "records": records })
}

/// A query response page carrying a continuation marker.
pub fn query_page_with_marker(records: serde_json::Value, marker: &str) -> serde_json::Value {
    serde_json::json!({ "records": records, "continuationMarker": marker })
}

/// A minimal CPLMaster record fixture.
pub fn master_record(name: &str, filename: &str, checksum: &str, url: &str) -> serde_json::Value {
    use base64::Engine;
    serde_json::json!({
        "recordName": name,
        "recordType": "CPLMaster",
        "modified": {"timestamp": 1_000_000_i64},
        "fields": {
            "filenameEnc": {
                "value": base64::engine::general_purpose::STANDARD.encode(filename),
                "type": "ENCRYPTED_BYTES"
            },
            "resOriginalFileType": {"value": "public.jpeg", "type": "STRING"},
            "resOriginalRes": {
                "value": {
                    "fileChecksum": checksum,
                    "size": 5,
                    "downloadURL": url
                },
                "type": "ASSETID"
            }
        }
    })
}

/// A domain asset fixture for download tests.
pub fn test_asset(record_name: &str, size: u64, url: Option<String>) -> icsync_core::domain::Asset {
    use icsync_core::domain::{Asset, AssetOrigin, FileType};
    Asset {
        record_name: record_name.to_string(),
        asset_record_name: None,
        base_name: "IMG_0001".to_string(),
        file_checksum: "YQ==".to_string(),
        size,
        modified: 0,
        file_type: FileType::Jpeg,
        wrapping_key: None,
        reference_checksum: None,
        download_url: url,
        origin: AssetOrigin::Original,
        favorite: false,
    }
}

/// A minimal CPLAlbum record fixture.
pub fn album_record(
    uuid: &str,
    name: &str,
    album_type: i64,
    parent: &str,
) -> serde_json::Value {
    use base64::Engine;
    serde_json::json!({
        "recordName": uuid,
        "recordType": "CPLAlbum",
        "fields": {
            "albumNameEnc": {
                "value": base64::engine::general_purpose::STANDARD.encode(name),
                "type": "ENCRYPTED_BYTES"
            },
            "albumType": {"value": album_type, "type": "INT64"},
            "parentId": {"value": parent, "type": "STRING"}
        }
    })
}
