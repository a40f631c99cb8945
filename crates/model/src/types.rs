use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ModelError;

/// Stable unique identifier of a transfer (whole-object or chunk).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferId(Uuid);

impl TransferId {
    /// Generates a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TransferId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for TransferId {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| ModelError::InvalidId(s.to_string()))
    }
}

/// Direction of a whole-object transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferType {
    #[serde(rename = "upload")]
    Upload,
    #[serde(rename = "download")]
    Download,
}

impl TransferType {
    pub fn label(self) -> &'static str {
        match self {
            Self::Upload => "upload",
            Self::Download => "download",
        }
    }
}

impl fmt::Display for TransferType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Identity of a remote object: container plus blob name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobRef {
    pub container: String,
    pub name: String,
}

impl BlobRef {
    pub fn new(container: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for BlobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.container, self.name)
    }
}

impl std::str::FromStr for BlobRef {
    type Err = ModelError;

    /// Parses `container/blob/name`; the first segment is the container.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((container, name)) if !container.is_empty() && !name.is_empty() => {
                Ok(Self::new(container, name))
            }
            _ => Err(ModelError::InvalidBlobRef(s.to_string())),
        }
    }
}

/// Half-open byte range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Value for an HTTP `Range` header (inclusive end).
    pub fn to_header(&self) -> String {
        format!("bytes={}-{}", self.start, self.end.saturating_sub(1))
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Kind of remote object. Only block blobs can be transferred in chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BlobKind {
    #[default]
    #[serde(rename = "block")]
    Block,
    #[serde(rename = "page")]
    Page,
    #[serde(rename = "append")]
    Append,
}

/// Access conditions and validation switches carried with every chunk request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferOptions {
    /// Lease that must be held on the remote object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_id: Option<String>,
    /// `If-Match` etag precondition. Downloads lock onto the etag of the
    /// initial response when this is unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub if_match: Option<String>,
    /// Validate `Content-MD5` of every downloaded chunk.
    #[serde(default)]
    pub validate_content_md5: bool,
    /// Sub-range of the remote object to download. `None` = whole object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<ByteRange>,
}

/// Byte progress of a whole-object transfer.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferProgress {
    pub bytes: u64,
    pub total_bytes: u64,
    /// Recent throughput in bytes/second (0 when unknown).
    #[serde(default)]
    pub bytes_per_second: f64,
    /// Estimated seconds remaining at the current throughput.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta_secs: Option<f64>,
}

impl TransferProgress {
    pub fn new(bytes: u64, total_bytes: u64) -> Self {
        Self {
            bytes,
            total_bytes,
            bytes_per_second: 0.0,
            eta_secs: None,
        }
    }

    /// Fraction complete in `[0, 1]`. An unknown total reports 0.
    pub fn as_fraction(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        if self.bytes >= self.total_bytes {
            return 1.0;
        }
        self.bytes as f64 / self.total_bytes as f64
    }

    pub fn remaining(&self) -> u64 {
        self.total_bytes.saturating_sub(self.bytes)
    }

    /// Percentage complete (0-100).
    pub fn percentage(&self) -> f64 {
        self.as_fraction() * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_ref_parse() {
        let b: BlobRef = "photos/2024/cat.jpg".parse().unwrap();
        assert_eq!(b.container, "photos");
        assert_eq!(b.name, "2024/cat.jpg");
        assert_eq!(b.to_string(), "photos/2024/cat.jpg");

        assert!("no-slash".parse::<BlobRef>().is_err());
        assert!("/name".parse::<BlobRef>().is_err());
        assert!("container/".parse::<BlobRef>().is_err());
    }

    #[test]
    fn byte_range_header_is_inclusive() {
        let r = ByteRange::new(0, 1024);
        assert_eq!(r.len(), 1024);
        assert_eq!(r.to_header(), "bytes=0-1023");
        assert!(ByteRange::new(5, 5).is_empty());
    }

    #[test]
    fn progress_fraction() {
        assert_eq!(TransferProgress::new(0, 0).as_fraction(), 0.0);
        assert_eq!(TransferProgress::new(50, 200).percentage(), 25.0);
        assert_eq!(TransferProgress::new(200, 200).as_fraction(), 1.0);
    }

    #[test]
    fn transfer_id_roundtrip_through_string() {
        let id = TransferId::new();
        let parsed: TransferId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-uuid".parse::<TransferId>().is_err());
    }

    #[test]
    fn options_skip_empty_fields() {
        let json = serde_json::to_string(&TransferOptions::default()).unwrap();
        assert!(!json.contains("lease_id"));
        assert!(!json.contains("range"));
    }
}
