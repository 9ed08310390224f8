use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::DeviceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocumentType {
    #[serde(rename = "DocumentType")]
    Document,
    #[serde(rename = "CollectionType")]
    Folder,
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DocumentType::Document => "DocumentType",
            DocumentType::Folder => "CollectionType",
        })
    }
}

/// Contents of a `{id}.metadata` file on the device.
///
/// `lastModified` travels as a string of epoch milliseconds, so only millisecond
/// precision survives a round trip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    #[serde(default)]
    pub deleted: bool,
    #[serde(with = "epoch_millis")]
    pub last_modified: OffsetDateTime,
    #[serde(default)]
    pub last_opened_page: i32,
    #[serde(rename = "metadatamodified", default)]
    pub metadata_modified: bool,
    #[serde(default)]
    pub modified: bool,
    #[serde(default, deserialize_with = "deserialize_parent")]
    pub parent: Option<Uuid>,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub synced: bool,
    #[serde(rename = "type")]
    pub kind: DocumentType,
    #[serde(default)]
    pub version: i32,
    pub visible_name: String,
}

impl Metadata {
    pub fn folder(name: &str, parent: Option<Uuid>, now: OffsetDateTime) -> Self {
        Self::fresh(DocumentType::Folder, name, parent, now)
    }

    pub fn document(name: &str, parent: Option<Uuid>, now: OffsetDateTime) -> Self {
        Self::fresh(DocumentType::Document, name, parent, now)
    }

    fn fresh(kind: DocumentType, name: &str, parent: Option<Uuid>, now: OffsetDateTime) -> Self {
        Self {
            deleted: false,
            last_modified: truncate_to_millis(now),
            last_opened_page: 0,
            metadata_modified: false,
            modified: false,
            parent,
            pinned: false,
            synced: false,
            kind,
            version: 1,
            visible_name: name.to_string(),
        }
    }

    pub fn from_slice(id: Uuid, bytes: &[u8]) -> Result<Self, DeviceError> {
        serde_json::from_slice(bytes).map_err(|source| DeviceError::MalformedMetadata { id, source })
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, DeviceError> {
        serde_json::to_vec(self).map_err(|source| DeviceError::Serialize {
            what: "metadata",
            source,
        })
    }

    pub fn renamed(&self, name: &str, now: OffsetDateTime) -> Self {
        Self {
            visible_name: name.to_string(),
            ..self.touched(now)
        }
    }

    pub fn marked_deleted(&self, now: OffsetDateTime) -> Self {
        Self {
            deleted: true,
            ..self.touched(now)
        }
    }

    fn touched(&self, now: OffsetDateTime) -> Self {
        Self {
            last_modified: truncate_to_millis(now),
            metadata_modified: true,
            version: self.version.saturating_add(1),
            ..self.clone()
        }
    }
}

// The device writes "" for entries in the root folder.
fn deserialize_parent<'de, D>(deserializer: D) -> Result<Option<Uuid>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    match raw.as_deref() {
        None | Some("") => Ok(None),
        Some(value) => Uuid::parse_str(value)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Pdf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transform {
    pub m11: i32,
    pub m12: i32,
    pub m13: i32,
    pub m21: i32,
    pub m22: i32,
    pub m23: i32,
    pub m31: i32,
    pub m32: i32,
    pub m33: i32,
}

impl Transform {
    pub fn ones() -> Self {
        Self {
            m11: 1,
            m12: 1,
            m13: 1,
            m21: 1,
            m22: 1,
            m23: 1,
            m31: 1,
            m32: 1,
            m33: 1,
        }
    }
}

/// Contents of a `{id}.content` file describing how a document is rendered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    pub extra_metadata: serde_json::Map<String, serde_json::Value>,
    pub file_type: FileType,
    pub font_name: String,
    pub last_opened_page: i32,
    pub line_height: i32,
    pub margins: i32,
    pub page_count: i32,
    pub text_scale: i32,
    pub transform: Transform,
}

impl Content {
    pub fn pdf_document() -> Self {
        Self {
            extra_metadata: serde_json::Map::new(),
            file_type: FileType::Pdf,
            font_name: String::new(),
            last_opened_page: 0,
            line_height: -1,
            margins: 100,
            page_count: 1,
            text_scale: 1,
            transform: Transform::ones(),
        }
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, DeviceError> {
        serde_json::to_vec(self).map_err(|source| DeviceError::Serialize {
            what: "content",
            source,
        })
    }
}

pub fn to_millis(value: OffsetDateTime) -> i64 {
    (value.unix_timestamp_nanos() / 1_000_000) as i64
}

pub fn from_millis(millis: i64) -> Result<OffsetDateTime, time::error::ComponentRange> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000)
}

fn truncate_to_millis(value: OffsetDateTime) -> OffsetDateTime {
    from_millis(to_millis(value)).unwrap_or(value)
}

/// Serde adapter for timestamps encoded as a JSON string of epoch milliseconds.
pub mod epoch_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use time::OffsetDateTime;

    pub fn serialize<S>(value: &OffsetDateTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&super::to_millis(*value).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<OffsetDateTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        let millis = raw
            .trim()
            .parse::<i64>()
            .map_err(serde::de::Error::custom)?;
        super::from_millis(millis).map_err(serde::de::Error::custom)
    }
}
