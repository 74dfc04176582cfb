//! Represents a finalized file in the content-addressed store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A file row as persisted by the metadata store.
///
/// The row is keyed by `digest`: two uploads with identical bytes share one
/// store entry and therefore one row.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct FileRecord {
    /// Lowercase hex SHA-256 of the file contents; also its store file name.
    pub digest: String,

    /// Logical name from the upload descriptor.
    pub name: String,

    /// Size in bytes of the stored file.
    pub size_bytes: i64,

    /// Location of the file under the store root.
    pub path: String,

    /// MIME type detected by post-processing.
    pub mime_type: Option<String>,

    /// Thumbnail produced by post-processing, if any.
    pub thumbnail_path: Option<String>,

    /// When the file was (last) finalized into the store.
    pub stored_at: DateTime<Utc>,
}
