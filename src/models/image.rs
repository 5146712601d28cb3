//! Represents an uploaded raster image and its stored blob.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Metadata row for one stored image.
///
/// Only the storage path is persisted; public URLs are resolved at read time
/// so rows survive changes to the store's URL scheme.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Image {
    /// Opaque identifier, also the blob's file stem.
    pub id: Uuid,

    /// Owning user. Only this user may edit or delete the image.
    pub user_id: Uuid,

    /// `{user_id}/{id}.{ext}` with `ext` drawn from the allow-list.
    pub storage_path: String,

    /// Filename as supplied by the uploader (display only).
    pub original_filename: Option<String>,

    pub alt_text: Option<String>,

    /// Pixel dimensions after transcoding.
    pub width: Option<i64>,
    pub height: Option<i64>,

    /// Size in bytes of the stored blob.
    pub file_size: Option<i64>,

    pub created_at: DateTime<Utc>,
}

/// Image as returned to clients.
#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageData {
    pub id: Uuid,
    pub public_url: String,
    pub original_filename: Option<String>,
    pub alt_text: Option<String>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub file_size: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl ImageData {
    pub fn from_row(row: Image, public_url: String) -> Self {
        Self {
            id: row.id,
            public_url,
            original_filename: row.original_filename,
            alt_text: row.alt_text,
            width: row.width,
            height: row.height,
            file_size: row.file_size,
            created_at: row.created_at,
        }
    }
}
