//! Photos query layer integration tests

use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use icsync_core::domain::errors::{ErrorKind, ICloudError};
use icsync_core::domain::{AlbumType, AssetOrigin};
use icsync_icloud::client::is_expired_url;
use icsync_icloud::records::{QueryRequest, ROOT_FOLDER_ID};

use crate::common::{self, BodyContains, BodyLacks};

#[tokio::test]
async fn test_query_all_follows_continuation() {
    let server = MockServer::start().await;

    // Page 1: no marker in the request, marker in the response
    Mock::given(method("POST"))
        .and(path("/records/query"))
        .and(BodyLacks("continuationMarker"))
        .respond_with(ResponseTemplate::new(200).set_body_json(common::query_page_with_marker(
            serde_json::json!([common::master_record("m1", "IMG_1.JPG", "YQ==", "https://cvws/1")]),
            "marker-1",
        )))
        .expect(1)
        .mount(&server)
        .await;

    // Page 2: request echoes the marker, response has none
    Mock::given(method("POST"))
        .and(path("/records/query"))
        .and(BodyContains("marker-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(common::query_page(
            serde_json::json!([common::master_record("m2", "IMG_2.JPG", "Yg==", "https://cvws/2")]),
        )))
        .expect(1)
        .mount(&server)
        .await;

    let client = common::photos_against(&server);
    let records = client
        .query_all(QueryRequest::new("CPLMaster"))
        .await
        .unwrap();

    assert_eq!(records.len(), 2);
    assert_eq!(records[0].record_name, "m1");
    assert_eq!(records[1].record_name, "m2");
}

#[tokio::test]
async fn test_query_maps_401() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/records/query"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let client = common::photos_against(&server);
    let err = client
        .query_all(QueryRequest::new("CPLMaster"))
        .await
        .unwrap_err();
    assert!(icsync_icloud::client::is_unauthorized(&err));
}

#[tokio::test]
async fn test_fetch_all_assets_joins_expunged() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/records/query"))
        .and(BodyContains("CPLAssetAndMasterInSmartAlbumByAssetDate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(common::query_page(
            serde_json::json!([
                common::master_record("m1", "IMG_1.JPG", "YQ==", "https://cvws/1"),
                common::master_record("m2", "IMG_2.JPG", "Yg==", "https://cvws/2"),
            ]),
        )))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/records/query"))
        .and(BodyContains("CPLAssetDeletedByExpungedDate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(common::query_page(
            serde_json::json!([{
                "recordName": "m2",
                "recordType": "CPLAsset",
                "fields": {}
            }]),
        )))
        .mount(&server)
        .await;

    let client = common::photos_against(&server);
    let assets = client.fetch_all_assets().await.unwrap();

    assert_eq!(assets.len(), 1);
    assert_eq!(assets[0].record_name, "m1");
    assert_eq!(assets[0].origin, AssetOrigin::Original);
}

#[tokio::test]
async fn test_fetch_all_albums_walks_hierarchy() {
    let server = MockServer::start().await;

    // Root level: one folder, one plain album
    Mock::given(method("POST"))
        .and(path("/records/query"))
        .and(BodyContains("CPLAlbumByPositionLive"))
        .and(BodyContains(ROOT_FOLDER_ID))
        .respond_with(ResponseTemplate::new(200).set_body_json(common::query_page(
            serde_json::json!([
                common::album_record("U2", "People", 3, ROOT_FOLDER_ID),
                common::album_record("U3", "Pets", 0, ROOT_FOLDER_ID),
            ]),
        )))
        .mount(&server)
        .await;

    // Inside the folder: one album
    Mock::given(method("POST"))
        .and(path("/records/query"))
        .and(BodyContains("CPLAlbumByPositionLive"))
        .and(BodyContains("\"U2\""))
        .respond_with(ResponseTemplate::new(200).set_body_json(common::query_page(
            serde_json::json!([common::album_record("U1", "Family", 0, "U2")]),
        )))
        .mount(&server)
        .await;

    // Album contents
    Mock::given(method("POST"))
        .and(path("/records/query"))
        .and(BodyContains("CPLContainerRelationLiveByAssetDate"))
        .and(BodyContains("\"U1\""))
        .respond_with(ResponseTemplate::new(200).set_body_json(common::query_page(
            serde_json::json!([{
                "recordName": "rel-1",
                "recordType": "CPLContainerRelation",
                "fields": {"itemId": {"value": {"recordName": "m1"}, "type": "REFERENCE"}}
            }]),
        )))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/records/query"))
        .and(BodyContains("CPLContainerRelationLiveByAssetDate"))
        .and(BodyContains("\"U3\""))
        .respond_with(ResponseTemplate::new(200).set_body_json(common::query_page(
            serde_json::json!([]),
        )))
        .mount(&server)
        .await;

    let client = common::photos_against(&server);
    let albums = client.fetch_all_albums().await.unwrap();

    assert_eq!(albums.len(), 3);
    let family = albums.iter().find(|a| a.uuid == "U1").unwrap();
    assert_eq!(family.album_type, AlbumType::Album);
    assert_eq!(family.parent_uuid.as_deref(), Some("U2"));
    assert!(family.asset_record_names.contains("m1"));

    let people = albums.iter().find(|a| a.uuid == "U2").unwrap();
    assert_eq!(people.album_type, AlbumType::Folder);
    assert!(people.asset_record_names.is_empty());
}

#[tokio::test]
async fn test_warmup_issues_index_query() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/records/query"))
        .and(BodyContains("CPLAlbumByPositionLive"))
        .respond_with(ResponseTemplate::new(200).set_body_json(common::query_page(
            serde_json::json!([]),
        )))
        .expect(1)
        .mount(&server)
        .await;

    let client = common::photos_against(&server);
    client.warmup().await.unwrap();
}

#[tokio::test]
async fn test_download_streams_bytes() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/content/m1"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"pixels".to_vec()))
        .mount(&server)
        .await;

    let client = common::photos_against(&server);
    let asset = common::test_asset("m1", 6, Some(format!("{}/content/m1", server.uri())));

    let mut stream = client.download(&asset).await.unwrap();
    let mut buf = Vec::new();
    tokio::io::AsyncReadExt::read_to_end(&mut stream, &mut buf)
        .await
        .unwrap();
    assert_eq!(buf, b"pixels");
}

#[tokio::test]
async fn test_download_expired_url_is_classified() {
    for status in [410u16, 403] {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/content/m1"))
            .respond_with(ResponseTemplate::new(status))
            .mount(&server)
            .await;

        let client = common::photos_against(&server);
        let asset = common::test_asset("m1", 6, Some(format!("{}/content/m1", server.uri())));

        let err = match client.download(&asset).await {
            Ok(_) => panic!("expected download to fail for status {status}"),
            Err(err) => err,
        };
        assert!(is_expired_url(&err), "status {status}");
    }
}

#[tokio::test]
async fn test_lookup_posts_record_names() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/records/lookup"))
        .and(BodyContains("\"m1\""))
        .respond_with(ResponseTemplate::new(200).set_body_json(common::query_page(
            serde_json::json!([common::master_record("m1", "IMG_1.JPG", "YQ==", "https://cvws/new")]),
        )))
        .expect(1)
        .mount(&server)
        .await;

    let client = common::photos_against(&server);
    let records = client.lookup(&["m1".to_string()]).await.unwrap();
    assert_eq!(records.len(), 1);
}

#[tokio::test]
async fn test_delete_records_marks_deleted() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/records/modify"))
        .and(BodyContains("isDeleted"))
        .and(BodyContains("\"m1\""))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"records": []})))
        .expect(1)
        .mount(&server)
        .await;

    let client = common::photos_against(&server);
    client.delete_records(&["m1".to_string()]).await.unwrap();
}

#[tokio::test]
async fn test_delete_records_surfaces_http_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/records/modify"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let client = common::photos_against(&server);
    let err = client.delete_records(&["m1".to_string()]).await.unwrap_err();
    assert!(matches!(
        err.kind,
        ErrorKind::ICloud(ICloudError::UnexpectedHttp(503))
    ));
}
