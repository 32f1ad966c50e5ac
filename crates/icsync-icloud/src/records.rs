//! CloudKit-style wire types and the record parser
//!
//! The private photos API speaks a CloudKit dialect: every query POSTs an
//! envelope against the `PrimarySync` zone and gets back loosely typed
//! records whose `fields` map value objects by name. This module owns the
//! raw serde shapes and a parser that converts them into domain
//! [`Asset`]/[`Album`] values; everything downstream works on domain types
//! only.
//!
//! A record that does not match the expected shape fails the whole query
//! with `UnexpectedResponse` - the API is reverse-engineered, and a silent
//! partial parse could corrupt the local library.

use std::collections::{BTreeMap, BTreeSet};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use icsync_core::domain::errors::ICloudError;
use icsync_core::domain::{Album, AlbumType, Asset, AssetOrigin, FileType};

/// The record zone every photos query runs against.
pub const ZONE_NAME: &str = "PrimarySync";

/// Record name of the root CloudKit folder; parent of all top-level albums
/// and the identity of the "All Photos" smart album.
pub const ROOT_FOLDER_ID: &str = "----Root-Folder----";

/// Page size for index-style queries.
pub const INDEX_PAGE_SIZE: usize = 200;

/// Server-enforced per-query record ceiling, observed at 66,000 records.
pub const QUERY_RECORD_CAP: usize = 66_000;

/// Keys requested for asset/master queries.
pub const ASSET_DESIRED_KEYS: &[&str] = &[
    "resOriginalRes",
    "resOriginalFileType",
    "resOriginalVidComplRes",
    "resOriginalVidComplFileType",
    "resJPEGFullRes",
    "resJPEGFullFileType",
    "resVidFullRes",
    "resVidFullFileType",
    "filenameEnc",
    "adjustmentType",
    "favorite",
    "masterRef",
];

/// Keys requested for album queries.
pub const ALBUM_DESIRED_KEYS: &[&str] = &["albumNameEnc", "albumType", "parentId", "isDeleted"];

// ============================================================================
// Request envelope
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct ZoneId {
    #[serde(rename = "zoneName")]
    pub zone_name: String,
}

impl Default for ZoneId {
    fn default() -> Self {
        Self {
            zone_name: ZONE_NAME.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryFilter {
    pub field_name: String,
    pub comparator: String,
    pub field_value: CkValue,
}

impl QueryFilter {
    pub fn equals(field: &str, value: impl Into<serde_json::Value>, value_type: &str) -> Self {
        Self {
            field_name: field.to_string(),
            comparator: "EQUALS".to_string(),
            field_value: CkValue {
                value: value.into(),
                value_type: Some(value_type.to_string()),
            },
        }
    }

    pub fn greater_than(field: &str, value: i64) -> Self {
        Self {
            field_name: field.to_string(),
            comparator: "GREATER_THAN".to_string(),
            field_value: CkValue {
                value: value.into(),
                value_type: Some("INT64".to_string()),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuerySpec {
    pub record_type: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub filter_by: Vec<QueryFilter>,
}

/// The pagination envelope POSTed to `/records/query`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    pub query: QuerySpec,
    pub results_limit: usize,
    #[serde(rename = "zoneID")]
    pub zone_id: ZoneId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub desired_keys: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub continuation_marker: Option<String>,
}

impl QueryRequest {
    pub fn new(record_type: &str) -> Self {
        Self {
            query: QuerySpec {
                record_type: record_type.to_string(),
                filter_by: Vec::new(),
            },
            results_limit: INDEX_PAGE_SIZE,
            zone_id: ZoneId::default(),
            desired_keys: None,
            continuation_marker: None,
        }
    }

    pub fn with_filter(mut self, filter: QueryFilter) -> Self {
        self.query.filter_by.push(filter);
        self
    }

    pub fn with_desired_keys(mut self, keys: &[&str]) -> Self {
        self.desired_keys = Some(keys.iter().map(|k| k.to_string()).collect());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.results_limit = limit;
        self
    }
}

// ============================================================================
// Response shapes
// ============================================================================

/// A typed field value: `{"value": ..., "type": "STRING"}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CkValue {
    pub value: serde_json::Value,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub value_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CkTimestamp {
    pub timestamp: i64,
}

/// One record as returned by `/records/query`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CkRecord {
    pub record_name: String,
    pub record_type: String,
    #[serde(default)]
    pub fields: BTreeMap<String, CkValue>,
    pub modified: Option<CkTimestamp>,
    #[serde(default)]
    pub deleted: bool,
}

impl CkRecord {
    fn str_field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(|v| v.value.as_str())
    }

    fn int_field(&self, name: &str) -> Option<i64> {
        self.fields.get(name).and_then(|v| v.value.as_i64())
    }

    fn modified_ms(&self) -> i64 {
        self.modified.as_ref().map(|m| m.timestamp).unwrap_or(0)
    }
}

/// Response body of `/records/query`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponse {
    #[serde(default)]
    pub records: Vec<CkRecord>,
    pub continuation_marker: Option<String>,
}

/// An `ASSETID` field value: the downloadable resource of a record.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AssetResource {
    file_checksum: String,
    size: u64,
    wrapping_key: Option<String>,
    reference_checksum: Option<String>,
    #[serde(rename = "downloadURL")]
    download_url: Option<String>,
}

// ============================================================================
// RecordParser
// ============================================================================

/// Converts raw CloudKit records into domain types.
pub struct RecordParser;

impl RecordParser {
    /// Joins `CPLMaster`/`CPLAsset` records (by the asset's `masterRef`) into
    /// domain [`Asset`]s, skipping records named in `expunged`.
    ///
    /// Each master yields its ORIGINAL, plus a LIVE asset when the master
    /// carries a video complement, plus an EDIT when the paired asset record
    /// has an adjustment with its own full-size resource.
    pub fn parse_assets(
        records: &[CkRecord],
        expunged: &BTreeSet<String>,
    ) -> Result<Vec<Asset>, ICloudError> {
        let mut masters: Vec<&CkRecord> = Vec::new();
        let mut assets_by_master: BTreeMap<String, &CkRecord> = BTreeMap::new();

        for record in records {
            match record.record_type.as_str() {
                "CPLMaster" => masters.push(record),
                "CPLAsset" => {
                    let master_ref = record
                        .fields
                        .get("masterRef")
                        .and_then(|v| v.value.get("recordName"))
                        .and_then(|v| v.as_str())
                        .ok_or_else(|| {
                            ICloudError::UnexpectedResponse(format!(
                                "CPLAsset {} has no masterRef",
                                record.record_name
                            ))
                        })?;
                    assets_by_master.insert(master_ref.to_string(), record);
                }
                other => {
                    return Err(ICloudError::UnexpectedResponse(format!(
                        "unexpected record type {other} in asset query"
                    )))
                }
            }
        }

        let mut out = Vec::new();
        for master in masters {
            if expunged.contains(&master.record_name) || master.deleted {
                continue;
            }

            let paired = assets_by_master.get(&master.record_name).copied();
            let base_name = Self::decode_filename(master)?;
            let favorite = paired
                .and_then(|a| a.int_field("favorite"))
                .unwrap_or(0)
                != 0;
            let modified = paired
                .map(CkRecord::modified_ms)
                .filter(|ms| *ms > 0)
                .unwrap_or_else(|| master.modified_ms());

            let original_type = Self::file_type(master, "resOriginalFileType")?;
            let original = Self::resource(master, "resOriginalRes")?;
            out.push(Self::build_asset(
                master,
                paired,
                &base_name,
                original,
                original_type,
                AssetOrigin::Original,
                modified,
                favorite,
            ));

            // Live photo video complement
            if master.fields.contains_key("resOriginalVidComplRes") {
                let live_type = Self::file_type(master, "resOriginalVidComplFileType")?;
                let live = Self::resource(master, "resOriginalVidComplRes")?;
                out.push(Self::build_asset(
                    master,
                    paired,
                    &base_name,
                    live,
                    live_type,
                    AssetOrigin::Live,
                    modified,
                    favorite,
                ));
            }

            // Current edit, when the asset record carries an adjustment
            if let Some(asset) = paired {
                if asset.fields.contains_key("adjustmentType") {
                    let (res_key, type_key) = if asset.fields.contains_key("resVidFullRes") {
                        ("resVidFullRes", "resVidFullFileType")
                    } else {
                        ("resJPEGFullRes", "resJPEGFullFileType")
                    };
                    if asset.fields.contains_key(res_key) {
                        let edit_type = Self::file_type(asset, type_key)?;
                        let edit = Self::resource(asset, res_key)?;
                        out.push(Self::build_asset(
                            master,
                            paired,
                            &base_name,
                            edit,
                            edit_type,
                            AssetOrigin::Edit,
                            modified,
                            favorite,
                        ));
                    }
                }
            }
        }

        Ok(out)
    }

    /// Record names listed by the expunged-assets query.
    pub fn expunged_record_names(records: &[CkRecord]) -> BTreeSet<String> {
        records
            .iter()
            .filter_map(|record| {
                record
                    .fields
                    .get("masterRef")
                    .and_then(|v| v.value.get("recordName"))
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
                    .or_else(|| Some(record.record_name.clone()))
            })
            .collect()
    }

    /// Parses a `CPLAlbum` record. Deleted albums yield `None`.
    pub fn parse_album(record: &CkRecord) -> Result<Option<Album>, ICloudError> {
        if record.deleted || record.int_field("isDeleted").unwrap_or(0) != 0 {
            return Ok(None);
        }

        let name = record
            .str_field("albumNameEnc")
            .ok_or_else(|| {
                ICloudError::UnexpectedResponse(format!(
                    "CPLAlbum {} has no albumNameEnc",
                    record.record_name
                ))
            })
            .and_then(|enc| Self::decode_b64_string(enc))?;

        let album_type = match record.int_field("albumType").unwrap_or(0) {
            0 => AlbumType::Album,
            3 => AlbumType::Folder,
            other => {
                // Smart albums and other system containers are not mirrored.
                tracing::debug!(
                    uuid = record.record_name,
                    album_type = other,
                    "Skipping unsupported album type"
                );
                return Ok(None);
            }
        };

        let parent = record
            .str_field("parentId")
            .filter(|p| !p.is_empty() && *p != ROOT_FOLDER_ID)
            .map(str::to_string);

        let mut album = match album_type {
            AlbumType::Folder => Album::new_folder(record.record_name.clone(), name),
            _ => Album::new_album(record.record_name.clone(), name),
        };
        album.parent_uuid = parent;
        Ok(Some(album))
    }

    /// Asset record names from a `CPLContainerRelation` membership record.
    pub fn relation_item_id(record: &CkRecord) -> Option<String> {
        record
            .fields
            .get("itemId")
            .and_then(|v| v.value.get("recordName"))
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .or_else(|| {
                record
                    .str_field("itemId")
                    .map(str::to_string)
            })
    }

    // ========================================================================
    // Field helpers
    // ========================================================================

    #[allow(clippy::too_many_arguments)]
    fn build_asset(
        master: &CkRecord,
        paired: Option<&CkRecord>,
        base_name: &str,
        resource: AssetResource,
        file_type: FileType,
        origin: AssetOrigin,
        modified: i64,
        favorite: bool,
    ) -> Asset {
        Asset {
            record_name: master.record_name.clone(),
            asset_record_name: paired.map(|r| r.record_name.clone()),
            base_name: base_name.to_string(),
            file_checksum: resource.file_checksum,
            size: resource.size,
            modified,
            file_type,
            wrapping_key: resource.wrapping_key,
            reference_checksum: resource.reference_checksum,
            download_url: resource.download_url,
            origin,
            favorite,
        }
    }

    fn resource(record: &CkRecord, key: &str) -> Result<AssetResource, ICloudError> {
        let value = record.fields.get(key).ok_or_else(|| {
            ICloudError::UnexpectedResponse(format!(
                "record {} has no {key}",
                record.record_name
            ))
        })?;
        serde_json::from_value(value.value.clone()).map_err(|e| {
            ICloudError::UnexpectedResponse(format!(
                "record {} has malformed {key}: {e}",
                record.record_name
            ))
        })
    }

    fn file_type(record: &CkRecord, key: &str) -> Result<FileType, ICloudError> {
        let descriptor = record.str_field(key).ok_or_else(|| {
            ICloudError::UnexpectedResponse(format!(
                "record {} has no {key}",
                record.record_name
            ))
        })?;
        FileType::from_descriptor(descriptor)
    }

    /// Decodes `filenameEnc` and strips the extension to get the base name.
    fn decode_filename(record: &CkRecord) -> Result<String, ICloudError> {
        let enc = record.str_field("filenameEnc").ok_or_else(|| {
            ICloudError::UnexpectedResponse(format!(
                "CPLMaster {} has no filenameEnc",
                record.record_name
            ))
        })?;
        let full = Self::decode_b64_string(enc)?;
        Ok(full
            .rsplit_once('.')
            .map(|(stem, _ext)| stem.to_string())
            .unwrap_or(full))
    }

    fn decode_b64_string(enc: &str) -> Result<String, ICloudError> {
        let bytes = STANDARD
            .decode(enc)
            .map_err(|e| ICloudError::UnexpectedResponse(format!("bad base64 field: {e}")))?;
        String::from_utf8(bytes)
            .map_err(|e| ICloudError::UnexpectedResponse(format!("non-utf8 field: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b64(s: &str) -> String {
        STANDARD.encode(s)
    }

    fn master_record(name: &str, filename: &str, checksum: &str) -> serde_json::Value {
        serde_json::json!({
            "recordName": name,
            "recordType": "CPLMaster",
            "modified": {"timestamp": 1000_i64},
            "fields": {
                "filenameEnc": {"value": b64(filename), "type": "ENCRYPTED_BYTES"},
                "resOriginalFileType": {"value": "public.jpeg", "type": "STRING"},
                "resOriginalRes": {
                    "value": {
                        "fileChecksum": checksum,
                        "size": 100,
                        "wrappingKey": "wk",
                        "referenceChecksum": "rc",
                        "downloadURL": "https://cvws.icloud-content.com/x"
                    },
                    "type": "ASSETID"
                }
            }
        })
    }

    fn asset_record(name: &str, master: &str, favorite: i64) -> serde_json::Value {
        serde_json::json!({
            "recordName": name,
            "recordType": "CPLAsset",
            "modified": {"timestamp": 2000_i64},
            "fields": {
                "masterRef": {"value": {"recordName": master}, "type": "REFERENCE"},
                "favorite": {"value": favorite, "type": "INT64"}
            }
        })
    }

    fn parse(records: serde_json::Value) -> Vec<CkRecord> {
        serde_json::from_value(records).unwrap()
    }

    #[test]
    fn test_query_request_serialization() {
        let request = QueryRequest::new("CPLAlbumByPositionLive")
            .with_filter(QueryFilter::equals("parentId", ROOT_FOLDER_ID, "STRING"))
            .with_desired_keys(ALBUM_DESIRED_KEYS)
            .with_limit(200);

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["query"]["recordType"], "CPLAlbumByPositionLive");
        assert_eq!(json["query"]["filterBy"][0]["fieldName"], "parentId");
        assert_eq!(json["query"]["filterBy"][0]["comparator"], "EQUALS");
        assert_eq!(json["zoneID"]["zoneName"], "PrimarySync");
        assert_eq!(json["resultsLimit"], 200);
        assert!(json.get("continuationMarker").is_none());
    }

    #[test]
    fn test_query_request_continuation() {
        let mut request = QueryRequest::new("CPLMaster");
        request.continuation_marker = Some("marker-1".to_string());
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["continuationMarker"], "marker-1");
    }

    #[test]
    fn test_parse_original_asset() {
        let records = parse(serde_json::json!([
            master_record("m1", "IMG_0001.JPG", "c2hhMQ=="),
            asset_record("a1", "m1", 1),
        ]));

        let assets = RecordParser::parse_assets(&records, &BTreeSet::new()).unwrap();
        assert_eq!(assets.len(), 1);
        let asset = &assets[0];
        assert_eq!(asset.record_name, "m1");
        assert_eq!(asset.base_name, "IMG_0001");
        assert_eq!(asset.file_checksum, "c2hhMQ==");
        assert_eq!(asset.size, 100);
        assert_eq!(asset.origin, AssetOrigin::Original);
        assert!(asset.favorite);
        // Asset record's timestamp wins over the master's
        assert_eq!(asset.modified, 2000);
        assert_eq!(
            asset.download_url.as_deref(),
            Some("https://cvws.icloud-content.com/x")
        );
    }

    #[test]
    fn test_parse_live_photo_yields_video_sibling() {
        let mut master = master_record("m1", "IMG_0002.HEIC", "aGVpYw==");
        master["fields"]["resOriginalFileType"]["value"] = "public.heic".into();
        master["fields"]["resOriginalVidComplFileType"] =
            serde_json::json!({"value": "com.apple.quicktime-movie", "type": "STRING"});
        master["fields"]["resOriginalVidComplRes"] = serde_json::json!({
            "value": {"fileChecksum": "bW92", "size": 5000, "downloadURL": "https://cvws/l"},
            "type": "ASSETID"
        });

        let records = parse(serde_json::json!([master]));
        let assets = RecordParser::parse_assets(&records, &BTreeSet::new()).unwrap();
        assert_eq!(assets.len(), 2);
        assert_eq!(assets[0].origin, AssetOrigin::Original);
        assert_eq!(assets[1].origin, AssetOrigin::Live);
        assert_eq!(assets[1].file_type, FileType::Mov);
        assert_eq!(assets[1].pretty_filename(), "IMG_0002-live.mov");
    }

    #[test]
    fn test_parse_edited_asset() {
        let mut asset = asset_record("a1", "m1", 0);
        asset["fields"]["adjustmentType"] =
            serde_json::json!({"value": "com.apple.photo", "type": "STRING"});
        asset["fields"]["resJPEGFullFileType"] =
            serde_json::json!({"value": "public.jpeg", "type": "STRING"});
        asset["fields"]["resJPEGFullRes"] = serde_json::json!({
            "value": {"fileChecksum": "ZWRpdA==", "size": 222, "downloadURL": "https://cvws/e"},
            "type": "ASSETID"
        });

        let records = parse(serde_json::json!([
            master_record("m1", "IMG_0003.JPG", "b3JpZw=="),
            asset,
        ]));
        let assets = RecordParser::parse_assets(&records, &BTreeSet::new()).unwrap();
        assert_eq!(assets.len(), 2);
        let edit = assets.iter().find(|a| a.origin == AssetOrigin::Edit).unwrap();
        assert_eq!(edit.file_checksum, "ZWRpdA==");
        assert_eq!(edit.size, 222);
        assert_eq!(edit.pretty_filename(), "IMG_0003-edited.jpeg");
    }

    #[test]
    fn test_parse_assets_skips_expunged() {
        let records = parse(serde_json::json!([
            master_record("m1", "IMG_1.JPG", "YQ=="),
            master_record("m2", "IMG_2.JPG", "Yg=="),
        ]));
        let expunged: BTreeSet<String> = ["m1".to_string()].into();

        let assets = RecordParser::parse_assets(&records, &expunged).unwrap();
        assert_eq!(assets.len(), 1);
        assert_eq!(assets[0].record_name, "m2");
    }

    #[test]
    fn test_parse_assets_unknown_record_type_fails() {
        let records = parse(serde_json::json!([{
            "recordName": "x",
            "recordType": "CPLSomethingElse",
            "fields": {}
        }]));
        let err = RecordParser::parse_assets(&records, &BTreeSet::new()).unwrap_err();
        assert!(err.to_string().contains("CPLSomethingElse"));
    }

    #[test]
    fn test_parse_assets_unknown_file_type_fails() {
        let mut master = master_record("m1", "IMG.FITS", "YQ==");
        master["fields"]["resOriginalFileType"]["value"] = "space.telescope.fits".into();
        let records = parse(serde_json::json!([master]));

        let err = RecordParser::parse_assets(&records, &BTreeSet::new()).unwrap_err();
        assert!(err.to_string().contains("space.telescope.fits"));
    }

    #[test]
    fn test_parse_album_folder_and_parent() {
        let record: CkRecord = serde_json::from_value(serde_json::json!({
            "recordName": "U1",
            "recordType": "CPLAlbum",
            "fields": {
                "albumNameEnc": {"value": b64("Family"), "type": "ENCRYPTED_BYTES"},
                "albumType": {"value": 0, "type": "INT64"},
                "parentId": {"value": "U2", "type": "STRING"}
            }
        }))
        .unwrap();

        let album = RecordParser::parse_album(&record).unwrap().unwrap();
        assert_eq!(album.uuid, "U1");
        assert_eq!(album.display_name, "Family");
        assert_eq!(album.album_type, AlbumType::Album);
        assert_eq!(album.parent_uuid.as_deref(), Some("U2"));
    }

    #[test]
    fn test_parse_album_root_parent_is_none() {
        let record: CkRecord = serde_json::from_value(serde_json::json!({
            "recordName": "U1",
            "recordType": "CPLAlbum",
            "fields": {
                "albumNameEnc": {"value": b64("Trips"), "type": "ENCRYPTED_BYTES"},
                "albumType": {"value": 3, "type": "INT64"},
                "parentId": {"value": ROOT_FOLDER_ID, "type": "STRING"}
            }
        }))
        .unwrap();

        let album = RecordParser::parse_album(&record).unwrap().unwrap();
        assert_eq!(album.album_type, AlbumType::Folder);
        assert!(album.parent_uuid.is_none());
    }

    #[test]
    fn test_parse_album_deleted_and_smart_are_skipped() {
        let deleted: CkRecord = serde_json::from_value(serde_json::json!({
            "recordName": "U1",
            "recordType": "CPLAlbum",
            "fields": {
                "albumNameEnc": {"value": b64("Gone"), "type": "ENCRYPTED_BYTES"},
                "isDeleted": {"value": 1, "type": "INT64"}
            }
        }))
        .unwrap();
        assert!(RecordParser::parse_album(&deleted).unwrap().is_none());

        let smart: CkRecord = serde_json::from_value(serde_json::json!({
            "recordName": "U2",
            "recordType": "CPLAlbum",
            "fields": {
                "albumNameEnc": {"value": b64("Favorites"), "type": "ENCRYPTED_BYTES"},
                "albumType": {"value": 6, "type": "INT64"}
            }
        }))
        .unwrap();
        assert!(RecordParser::parse_album(&smart).unwrap().is_none());
    }

    #[test]
    fn test_relation_item_id() {
        let record: CkRecord = serde_json::from_value(serde_json::json!({
            "recordName": "rel-1",
            "recordType": "CPLContainerRelation",
            "fields": {
                "itemId": {"value": {"recordName": "m1"}, "type": "REFERENCE"}
            }
        }))
        .unwrap();
        assert_eq!(RecordParser::relation_item_id(&record).as_deref(), Some("m1"));
    }
}
