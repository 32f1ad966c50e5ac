//! Asset entity - one original-or-edited media file
//!
//! An [`Asset`] describes a single downloadable media file as reported by the
//! remote library. Its local identity is fully determined by the remote
//! checksum: the file in the content-addressed store is named
//! `base64url(fileChecksum).<ext>`, so the same remote asset always maps to
//! the same local file across runs.

use std::fmt::{self, Display, Formatter};

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use serde::{Deserialize, Serialize};

use super::errors::ICloudError;

// ============================================================================
// FileType - closed MIME table
// ============================================================================

/// Media file type, derived from the closed MIME/UTI table the remote reports.
///
/// The table is closed on purpose: an unknown type is an
/// [`ICloudError::UnexpectedResponse`] at parse time rather than a guessed
/// extension that would corrupt the content-addressed naming scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileType {
    Jpeg,
    Png,
    Heic,
    Heif,
    Tiff,
    Gif,
    Webp,
    Jp2,
    /// Sony RAW
    Arw,
    /// Canon RAW
    Cr2,
    /// Adobe digital negative
    Dng,
    Mov,
    Mp4,
    /// AVCHD transport stream
    Mts,
}

impl FileType {
    /// Resolves a remote-reported type descriptor to a [`FileType`].
    pub fn from_descriptor(descriptor: &str) -> Result<Self, ICloudError> {
        match descriptor {
            "public.jpeg" => Ok(Self::Jpeg),
            "public.png" => Ok(Self::Png),
            "public.heic" => Ok(Self::Heic),
            "public.heif" => Ok(Self::Heif),
            "public.tiff" => Ok(Self::Tiff),
            "com.compuserve.gif" => Ok(Self::Gif),
            "org.webmproject.webp" => Ok(Self::Webp),
            "public.jpeg-2000" => Ok(Self::Jp2),
            "com.sony.arw-raw-image" => Ok(Self::Arw),
            "com.canon.cr2-raw-image" => Ok(Self::Cr2),
            "com.adobe.raw-image" => Ok(Self::Dng),
            "com.apple.quicktime-movie" => Ok(Self::Mov),
            "public.mpeg-4" => Ok(Self::Mp4),
            "public.avchd-mpeg-2-transport-stream" => Ok(Self::Mts),
            other => Err(ICloudError::UnexpectedResponse(format!(
                "unknown file type descriptor: {other}"
            ))),
        }
    }

    /// The local filename extension for this type.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Jpeg => "jpeg",
            Self::Png => "png",
            Self::Heic => "heic",
            Self::Heif => "heif",
            Self::Tiff => "tiff",
            Self::Gif => "gif",
            Self::Webp => "webp",
            Self::Jp2 => "jp2",
            Self::Arw => "arw",
            Self::Cr2 => "cr2",
            Self::Dng => "dng",
            Self::Mov => "mov",
            Self::Mp4 => "mp4",
            Self::Mts => "mts",
        }
    }

    /// Resolves a bare extension back to a [`FileType`].
    ///
    /// Used when loading the local store, where only the filename is known.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "jpeg" => Some(Self::Jpeg),
            "png" => Some(Self::Png),
            "heic" => Some(Self::Heic),
            "heif" => Some(Self::Heif),
            "tiff" => Some(Self::Tiff),
            "gif" => Some(Self::Gif),
            "webp" => Some(Self::Webp),
            "jp2" => Some(Self::Jp2),
            "arw" => Some(Self::Arw),
            "cr2" => Some(Self::Cr2),
            "dng" => Some(Self::Dng),
            "mov" => Some(Self::Mov),
            "mp4" => Some(Self::Mp4),
            "mts" => Some(Self::Mts),
            _ => None,
        }
    }
}

impl Display for FileType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.extension())
    }
}

// ============================================================================
// AssetOrigin
// ============================================================================

/// Which remote resource an asset was derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AssetOrigin {
    /// The original master file
    Original,
    /// The current edit of the asset
    Edit,
    /// The video component of a live photo
    Live,
}

impl AssetOrigin {
    /// Suffix appended to the pretty (album link) filename.
    fn pretty_suffix(&self) -> &'static str {
        match self {
            Self::Original => "",
            Self::Edit => "-edited",
            Self::Live => "-live",
        }
    }
}

// ============================================================================
// Asset
// ============================================================================

/// One original-or-edited media file tracked by the remote library.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    /// Remote stable record identifier (the master record)
    pub record_name: String,
    /// Record name of the paired asset record, when one exists; required to
    /// refresh the download URL of an edited resource
    pub asset_record_name: Option<String>,
    /// Original filename without extension, as captured by the camera/user
    pub base_name: String,
    /// Base64 checksum as reported by the remote
    pub file_checksum: String,
    /// Size in bytes
    pub size: u64,
    /// Modification timestamp, Unix milliseconds
    pub modified: i64,
    /// Media type from the closed MIME table
    pub file_type: FileType,
    /// Key material reported alongside the download URL
    pub wrapping_key: Option<String>,
    /// Secondary checksum used by the download reference
    pub reference_checksum: Option<String>,
    /// Short-lived signed download URL (refreshed on expiry)
    pub download_url: Option<String>,
    /// Which remote resource this asset came from
    pub origin: AssetOrigin,
    /// Whether the asset is marked favorite remotely
    pub favorite: bool,
}

impl Asset {
    /// The filename of this asset in the content-addressed store:
    /// `base64url(fileChecksum).<ext>`.
    ///
    /// The remote reports the checksum in standard base64; the filename uses
    /// the url-safe alphabet without padding so it is filesystem-clean. A
    /// checksum that is not valid standard base64 is sanitized
    /// character-by-character instead.
    pub fn asset_filename(&self) -> String {
        format!("{}.{}", to_url_safe(&self.file_checksum), self.file_type.extension())
    }

    /// The user-facing filename used for the symlink inside an album
    /// directory: `<base><-edited|-live>.<ext>`.
    pub fn pretty_filename(&self) -> String {
        format!(
            "{}{}.{}",
            self.base_name,
            self.origin.pretty_suffix(),
            self.file_type.extension()
        )
    }

    /// The asset's modification time as seconds + nanoseconds, suitable for
    /// stamping the local file's mtime.
    pub fn mtime_parts(&self) -> (i64, u32) {
        let secs = self.modified.div_euclid(1000);
        let nanos = (self.modified.rem_euclid(1000) as u32) * 1_000_000;
        (secs, nanos)
    }
}

/// Converts a standard-base64 checksum to the url-safe, unpadded alphabet.
///
/// Falls back to character substitution when the input does not decode,
/// which keeps the mapping total and stable for any remote-reported string.
fn to_url_safe(checksum: &str) -> String {
    match STANDARD.decode(checksum) {
        Ok(bytes) => URL_SAFE_NO_PAD.encode(bytes),
        Err(_) => checksum
            .chars()
            .filter(|c| *c != '=')
            .map(|c| match c {
                '+' => '-',
                '/' => '_',
                other => other,
            })
            .collect(),
    }
}
