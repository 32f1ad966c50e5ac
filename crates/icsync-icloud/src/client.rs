//! Photos query client
//!
//! Typed HTTP client for the per-user photos database endpoint
//! (`<photosDomain>/database/1/com.apple.photos.cloud/production/private`).
//! Handles the pagination envelope, the server's per-query record ceiling,
//! streaming downloads and the narrow delete mutation used by archiving.
//!
//! Authentication is cookie-based: the client shares the cookie store the
//! auth state machine filled during setup.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::TryStreamExt;
use reqwest::{Client, StatusCode};
use tokio_util::io::StreamReader;
use tracing::{debug, info, warn};

use icsync_core::domain::errors::{AppError, ErrorKind, ICloudError};
use icsync_core::domain::{Album, AlbumType, Asset};
use icsync_core::ports::AssetStream;

use crate::records::{
    CkRecord, QueryFilter, QueryRequest, QueryResponse, RecordParser, ZoneId, ALBUM_DESIRED_KEYS,
    ASSET_DESIRED_KEYS, INDEX_PAGE_SIZE, QUERY_RECORD_CAP, ROOT_FOLDER_ID,
};

/// Database path under the per-user photos domain.
const DB_PATH: &str = "/database/1/com.apple.photos.cloud/production/private";

/// Whether an error is the query layer's 401 signal.
pub fn is_unauthorized(err: &AppError) -> bool {
    matches!(err.kind, ErrorKind::ICloud(ICloudError::UnexpectedHttp(401)))
}

/// Whether an error means the signed download URL expired (410/403) and the
/// record must be re-fetched.
pub fn is_expired_url(err: &AppError) -> bool {
    matches!(
        err.kind,
        ErrorKind::ICloud(ICloudError::UnexpectedHttp(410 | 403))
    )
}

/// HTTP client for the photos database endpoint.
///
/// Cheap to clone: the underlying connection pool is shared.
#[derive(Clone)]
pub struct PhotosClient {
    http: Client,
    base: String,
}

impl PhotosClient {
    /// Creates a client for the given photos domain, sharing the session
    /// cookie store.
    pub fn new(
        photos_domain: &str,
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
            base: format!("{}{DB_PATH}", photos_domain.trim_end_matches('/')),
        })
    }

    /// Creates a client against an arbitrary base URL (tests only).
    pub fn with_base_url(base: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base: base.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// POSTs one query page.
    pub async fn query(&self, request: &QueryRequest) -> Result<QueryResponse, AppError> {
        let response = self
            .http
            .post(format!("{}/records/query", self.base))
            .json(request)
            .send()
            .await
            .map_err(|e| AppError::new(ICloudError::Request(e.to_string())))?;

        if !response.status().is_success() {
            return Err(AppError::new(ICloudError::UnexpectedHttp(
                response.status().as_u16(),
            ))
            .with_context("record_type", request.query.record_type.clone()));
        }

        response
            .json()
            .await
            .map_err(|e| AppError::new(ICloudError::UnexpectedResponse(e.to_string())))
    }

    /// Runs one logical query to completion, following continuation markers.
    ///
    /// The server caps a single logical query at [`QUERY_RECORD_CAP`]
    /// records; hitting the cap here is an error, so callers with
    /// potentially unbounded result sets must use
    /// [`query_all_sharded`](PhotosClient::query_all_sharded).
    pub async fn query_all(&self, template: QueryRequest) -> Result<Vec<CkRecord>, AppError> {
        let mut records = Vec::new();
        let mut request = template;

        loop {
            let page = self.query(&request).await?;
            records.extend(page.records);

            match page.continuation_marker {
                Some(_) if records.len() >= QUERY_RECORD_CAP => {
                    return Err(AppError::new(ICloudError::RecordCeiling {
                        record_type: request.query.record_type.clone(),
                        count: records.len(),
                    }));
                }
                Some(marker) => request.continuation_marker = Some(marker),
                None => break,
            }
        }

        debug!(
            record_type = request.query.record_type,
            count = records.len(),
            "Logical query complete"
        );
        Ok(records)
    }

    /// Like [`query_all`](PhotosClient::query_all), but shards by an indexed
    /// rank predicate instead of failing at the record ceiling.
    ///
    /// When a logical query approaches the cap with pages still pending, a
    /// fresh logical query is started with `rank_field > <records so far>`,
    /// resetting the server-side counter. Pagination alone cannot cross the
    /// ceiling; the indexed predicate can.
    pub async fn query_all_sharded(
        &self,
        template: QueryRequest,
        rank_field: &str,
    ) -> Result<Vec<CkRecord>, AppError> {
        let mut records: Vec<CkRecord> = Vec::new();
        let mut request = template.clone();
        let mut fetched_in_shard = 0usize;

        loop {
            let page = self.query(&request).await?;
            let page_len = page.records.len();
            fetched_in_shard += page_len;
            records.extend(page.records);

            let Some(marker) = page.continuation_marker else {
                break;
            };

            if fetched_in_shard + request.results_limit > QUERY_RECORD_CAP {
                if page_len == 0 {
                    // A shard that yields nothing cannot make progress.
                    return Err(AppError::new(ICloudError::RecordCeiling {
                        record_type: request.query.record_type.clone(),
                        count: records.len(),
                    }));
                }
                info!(
                    record_type = template.query.record_type,
                    fetched = records.len(),
                    "Record ceiling approaching, starting new query shard"
                );
                request = template
                    .clone()
                    .with_filter(QueryFilter::greater_than(rank_field, records.len() as i64));
                fetched_in_shard = 0;
            } else {
                request.continuation_marker = Some(marker);
            }
        }

        Ok(records)
    }

    // ========================================================================
    // Library enumeration
    // ========================================================================

    /// Fetches every asset: the smart-album-by-date query joined against the
    /// expunged-records query, parsed into domain assets.
    pub async fn fetch_all_assets(&self) -> Result<Vec<Asset>, AppError> {
        let asset_query = QueryRequest::new("CPLAssetAndMasterInSmartAlbumByAssetDate")
            .with_filter(QueryFilter::equals("parentId", ROOT_FOLDER_ID, "STRING"))
            .with_desired_keys(ASSET_DESIRED_KEYS)
            .with_limit(INDEX_PAGE_SIZE);
        let expunged_query =
            QueryRequest::new("CPLAssetDeletedByExpungedDate").with_limit(INDEX_PAGE_SIZE);

        // Two independently paginated logical queries over the same session.
        let (asset_records, expunged_records) = tokio::try_join!(
            self.query_all_sharded(asset_query, "startRank"),
            self.query_all(expunged_query),
        )?;

        let expunged = RecordParser::expunged_record_names(&expunged_records);
        let assets = RecordParser::parse_assets(&asset_records, &expunged).map_err(AppError::new)?;

        info!(
            assets = assets.len(),
            expunged = expunged.len(),
            "Remote asset enumeration complete"
        );
        Ok(assets)
    }

    /// Fetches the album tree depth-first from the root CloudKit folder.
    ///
    /// Visited UUIDs are cached to break cycles; the remote should be a
    /// tree, but this layer does not trust it to be one.
    pub async fn fetch_all_albums(&self) -> Result<Vec<Album>, AppError> {
        let mut albums = Vec::new();
        let mut visited: BTreeSet<String> = BTreeSet::new();
        let mut stack = vec![ROOT_FOLDER_ID.to_string()];

        while let Some(parent) = stack.pop() {
            if !visited.insert(parent.clone()) {
                warn!(parent, "Album hierarchy cycle detected, skipping revisit");
                continue;
            }

            let records = self
                .query_all(
                    QueryRequest::new("CPLAlbumByPositionLive")
                        .with_filter(QueryFilter::equals("parentId", parent.as_str(), "STRING"))
                        .with_desired_keys(ALBUM_DESIRED_KEYS),
                )
                .await?;

            for record in &records {
                let Some(mut album) = RecordParser::parse_album(record).map_err(AppError::new)?
                else {
                    continue;
                };
                match album.album_type {
                    AlbumType::Folder => stack.push(album.uuid.clone()),
                    AlbumType::Album => {
                        album.asset_record_names = self.fetch_album_contents(&album.uuid).await?;
                    }
                    AlbumType::Archived => {}
                }
                albums.push(album);
            }
        }

        info!(albums = albums.len(), "Remote album enumeration complete");
        Ok(albums)
    }

    /// Fetches the asset record names linked by one album. Inherently
    /// sharded per album, which keeps each query far from the ceiling.
    async fn fetch_album_contents(&self, uuid: &str) -> Result<BTreeSet<String>, AppError> {
        let records = self
            .query_all(
                QueryRequest::new("CPLContainerRelationLiveByAssetDate")
                    .with_filter(QueryFilter::equals("parentId", uuid, "STRING"))
                    .with_limit(INDEX_PAGE_SIZE),
            )
            .await?;

        Ok(records
            .iter()
            .filter_map(RecordParser::relation_item_id)
            .collect())
    }

    /// One cheap index query proving the session can reach the photos
    /// endpoint (the `SETUP_DONE -> READY` transition).
    pub async fn warmup(&self) -> Result<(), AppError> {
        self.query(
            &QueryRequest::new("CPLAlbumByPositionLive")
                .with_filter(QueryFilter::equals("parentId", ROOT_FOLDER_ID, "STRING"))
                .with_limit(1),
        )
        .await?;
        debug!("Photos endpoint warm-up succeeded");
        Ok(())
    }

    // ========================================================================
    // Record lookup, download, delete
    // ========================================================================

    /// Looks up records by name (`/records/lookup`); used to refresh expired
    /// download URLs.
    pub async fn lookup(&self, record_names: &[String]) -> Result<Vec<CkRecord>, AppError> {
        let body = serde_json::json!({
            "records": record_names
                .iter()
                .map(|name| serde_json::json!({"recordName": name}))
                .collect::<Vec<_>>(),
            "zoneID": ZoneId::default(),
            "desiredKeys": ASSET_DESIRED_KEYS,
        });

        let response = self
            .http
            .post(format!("{}/records/lookup", self.base))
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::new(ICloudError::Request(e.to_string())))?;

        if !response.status().is_success() {
            return Err(AppError::new(ICloudError::UnexpectedHttp(
                response.status().as_u16(),
            ))
            .with_context("endpoint", "lookup"));
        }

        let parsed: QueryResponse = response
            .json()
            .await
            .map_err(|e| AppError::new(ICloudError::UnexpectedResponse(e.to_string())))?;
        Ok(parsed.records)
    }

    /// Opens a streaming download of the asset's signed URL.
    pub async fn download(&self, asset: &Asset) -> Result<AssetStream, AppError> {
        let url = asset
            .download_url
            .as_deref()
            .ok_or_else(|| {
                AppError::new(ICloudError::UnexpectedResponse(format!(
                    "asset {} has no download URL",
                    asset.record_name
                )))
            })?;

        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| AppError::new(ICloudError::Request(e.to_string())))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::new(ICloudError::UnexpectedHttp(status.as_u16()))
                .with_context("record", asset.record_name.clone())
                .with_context("endpoint", "download"));
        }

        let stream = response
            .bytes_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
        Ok(Box::new(StreamReader::new(Box::pin(stream))))
    }

    /// Marks the given asset records deleted (`/records/modify`). Used only
    /// by the archive engine's `--remote-delete` path.
    pub async fn delete_records(&self, record_names: &[String]) -> Result<(), AppError> {
        if record_names.is_empty() {
            return Ok(());
        }

        let operations: Vec<_> = record_names
            .iter()
            .map(|name| {
                serde_json::json!({
                    "operationType": "update",
                    "record": {
                        "recordName": name,
                        "recordType": "CPLAsset",
                        "fields": {"isDeleted": {"value": 1}}
                    }
                })
            })
            .collect();
        let body = serde_json::json!({
            "operations": operations,
            "zoneID": ZoneId::default(),
            "atomic": false,
        });

        let response = self
            .http
            .post(format!("{}/records/modify", self.base))
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::new(ICloudError::Request(e.to_string())))?;

        if response.status() != StatusCode::OK {
            return Err(AppError::new(ICloudError::UnexpectedHttp(
                response.status().as_u16(),
            ))
            .with_context("endpoint", "modify"));
        }

        info!(count = record_names.len(), "Remote records marked deleted");
        Ok(())
    }
}
