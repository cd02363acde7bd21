//! Represents an uploaded file and the link that shares it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// One row per upload.
///
/// The struct holds metadata only; the bytes live in the blob store under
/// `storage_key`. `token` is the only handle ever shown to clients.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq, Eq)]
pub struct StoredObject {
    /// Internal UUID for DB indexing. Never exposed.
    pub id: Uuid,

    /// Opaque, URL-safe download token.
    pub token: String,

    /// Client-supplied filename, used for Content-Disposition only.
    pub original_name: String,

    /// Content type recorded at upload.
    pub content_type: String,

    /// Backend locator (file key or remote object key).
    pub storage_key: String,

    /// Size in bytes, recorded when the upload completed.
    pub size_bytes: i64,

    /// MD5 of the payload, hex encoded.
    pub etag: Option<String>,

    pub created_at: DateTime<Utc>,

    /// `None` means the object never expires by time.
    pub expires_at: Option<DateTime<Utc>>,

    /// Object is invalid after its first successful download.
    pub one_time: bool,

    pub download_count: i64,
}

/// Metadata handed to the registry when an upload completes.
#[derive(Clone, Debug)]
pub struct NewObject {
    pub original_name: String,
    pub content_type: String,
    pub storage_key: String,
    pub size_bytes: i64,
    pub etag: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub one_time: bool,
}

impl StoredObject {
    /// Token prefix suitable for log lines.
    pub fn short_token(&self) -> &str {
        short_token(&self.token)
    }
}

/// First ten characters of a token, enough to correlate log lines without
/// making the link usable.
pub fn short_token(token: &str) -> &str {
    match token.char_indices().nth(10) {
        Some((idx, _)) => &token[..idx],
        None => token,
    }
}
