//! Blob storage backends.
//!
//! The registry and reclaimer only see [`BlobStore`]; which backend is in
//! use is decided once at startup.
//!
//! - [`LocalBlobStore`]: files on disk, sharded beneath a base directory,
//!   served by streaming.
//! - [`RemoteBlobStore`]: an S3-compatible bucket, served by redirecting to a
//!   presigned URL.

mod local;
mod remote;

pub use local::LocalBlobStore;
pub use remote::RemoteBlobStore;

use crate::errors::ShareResult;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use std::{io, pin::Pin, time::Duration};
use tokio::io::AsyncRead;
use url::Url;

/// Request body chunks as they arrive from the client.
pub type ByteStream<'a> = BoxStream<'a, io::Result<Bytes>>;

/// Descriptive fields stored alongside the payload where the backend can.
#[derive(Debug, Clone)]
pub struct BlobMeta<'a> {
    pub original_name: &'a str,
    pub content_type: &'a str,
}

/// What a successful `put` produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutOutcome {
    pub storage_key: String,
    pub size_bytes: i64,
    pub etag: String,
}

/// How the bytes of a stored object reach the client.
pub enum BlobSource {
    /// Proxy the bytes through this process.
    Stream {
        reader: Pin<Box<dyn AsyncRead + Send>>,
        len: u64,
    },
    /// Send the client elsewhere; the URL stops working after `valid_for`.
    Redirect { url: Url, valid_for: Duration },
}

impl std::fmt::Debug for BlobSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlobSource::Stream { len, .. } => f.debug_struct("Stream").field("len", len).finish(),
            BlobSource::Redirect { url, valid_for } => f
                .debug_struct("Redirect")
                .field("url", &url.as_str())
                .field("valid_for", valid_for)
                .finish(),
        }
    }
}

/// Hints for `resolve`.
#[derive(Debug, Clone, Copy)]
pub struct ResolveOptions {
    /// One-time links get a shorter presign lifetime.
    pub one_time: bool,
}

/// A stored blob as seen by the orphan sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobEntry {
    pub storage_key: String,
    pub last_modified: DateTime<Utc>,
}

/// Capability set every backend provides.
///
/// Keys are generated by the backend in `put` and are opaque to callers.
#[async_trait]
pub trait BlobStore: Send + Sync + 'static {
    /// Short backend name for logs and status output.
    fn name(&self) -> &'static str;

    /// Consume `body` and persist it under a fresh key.
    ///
    /// On error nothing is left behind under the returned key.
    async fn put(&self, body: ByteStream<'_>, meta: &BlobMeta<'_>) -> ShareResult<PutOutcome>;

    /// Locate a blob for download.
    ///
    /// Returns `ShareError::NotFound` if the blob is gone.
    async fn resolve(&self, storage_key: &str, opts: ResolveOptions) -> ShareResult<BlobSource>;

    /// Remove a blob. Removing an absent blob succeeds.
    async fn delete(&self, storage_key: &str) -> ShareResult<()>;

    /// Every blob currently held by this backend.
    async fn list(&self) -> ShareResult<Vec<BlobEntry>>;

    /// Cheap connectivity check for readiness probes.
    async fn probe(&self) -> ShareResult<()>;
}

/// RFC 5987 `attr-char`: everything else in `filename*` is percent-encoded.
const ATTR_CHAR: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'!')
    .remove(b'#')
    .remove(b'$')
    .remove(b'&')
    .remove(b'+')
    .remove(b'-')
    .remove(b'.')
    .remove(b'^')
    .remove(b'_')
    .remove(b'`')
    .remove(b'|')
    .remove(b'~');

/// `Content-Disposition` value for downloading `name` as an attachment.
///
/// The `filename` parameter is an ASCII approximation; `filename*` carries
/// the exact name percent-encoded as UTF-8.
pub fn attachment_disposition(name: &str) -> String {
    let fallback: String = name
        .chars()
        .map(|c| {
            if (c.is_ascii_graphic() && c != '"' && c != '\\') || c == ' ' {
                c
            } else {
                '_'
            }
        })
        .collect();

    let encoded = utf8_percent_encode(name, ATTR_CHAR);

    format!("attachment; filename=\"{}\"; filename*=UTF-8''{}", fallback, encoded)
}
