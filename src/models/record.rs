//! Records owned by an image field, plus their named attributes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A record holding (at most) one uploaded image.
///
/// `file_path` is the storage-relative path of the upload; `None` is the
/// well-defined empty state, in which resolution may fall back to a static
/// asset named by one of the record's attributes.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct ImageRecord {
    /// Internal UUID for DB indexing.
    pub id: Uuid,

    /// Owning field definition.
    pub field_id: Uuid,

    /// Record key within the field (path-like, e.g. `users/alice`).
    pub key: String,

    /// Storage path of the uploaded file, if any.
    pub file_path: Option<String>,

    /// Content type of the upload.
    pub content_type: Option<String>,

    /// Upload size in bytes.
    pub size_bytes: i64,

    /// MD5 checksum of the upload.
    pub checksum: Option<String>,

    /// Timestamp of the last save.
    pub last_modified: DateTime<Utc>,
}

impl ImageRecord {
    /// Whether the record holds no uploaded file.
    pub fn is_empty(&self) -> bool {
        self.file_path.is_none()
    }
}

/// A named attribute attached to a record (e.g. the static fallback path).
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct RecordAttr {
    pub id: Uuid,
    pub record_id: Uuid,
    pub name: String,
    pub value: String,
}
