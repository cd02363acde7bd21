//! S3-compatible blob backend.
//!
//! Objects are written under a fixed key prefix. Downloads are not proxied:
//! `resolve` hands back a presigned GET URL for the client to follow.

use super::{
    BlobEntry, BlobMeta, BlobSource, BlobStore, ByteStream, PutOutcome, ResolveOptions,
    attachment_disposition,
};
use crate::{
    config::S3Config,
    errors::{ShareError, ShareResult},
};
use async_trait::async_trait;
use axum::http::Method;
use futures::StreamExt;
use md5::Context;
use object_store::{
    Attribute, Attributes, ObjectStore, aws::AmazonS3Builder, buffered::BufWriter,
    path::Path as ObjectPath, signer::Signer,
};
use std::{fmt, sync::Arc, time::Duration};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

pub const DEFAULT_KEY_PREFIX: &str = "shareit";

/// Presigned links for one-time objects never outlive this.
const ONE_TIME_PRESIGN_TTL: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct RemoteBlobStore {
    store: Arc<dyn ObjectStore>,
    signer: Arc<dyn Signer>,
    prefix: ObjectPath,
    presign_ttl: Duration,
}

impl fmt::Debug for RemoteBlobStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteBlobStore")
            .field("store", &self.store.to_string())
            .field("prefix", &self.prefix.as_ref())
            .field("presign_ttl", &self.presign_ttl)
            .finish()
    }
}

impl RemoteBlobStore {
    /// `store` and `signer` are usually the same client.
    pub fn new(
        store: Arc<dyn ObjectStore>,
        signer: Arc<dyn Signer>,
        prefix: &str,
        presign_ttl: Duration,
    ) -> Self {
        Self {
            store,
            signer,
            prefix: ObjectPath::from(prefix),
            presign_ttl,
        }
    }

    /// Build an S3 (or MinIO) client from configuration.
    pub fn s3(cfg: &S3Config) -> ShareResult<Self> {
        let mut builder = AmazonS3Builder::new()
            .with_bucket_name(&cfg.bucket)
            .with_region(&cfg.region)
            .with_access_key_id(&cfg.access_key)
            .with_secret_access_key(&cfg.secret_key);
        if let Some(endpoint) = &cfg.endpoint {
            builder = builder
                .with_endpoint(endpoint)
                .with_allow_http(endpoint.starts_with("http://"));
        }
        let client = Arc::new(builder.build()?);
        Ok(Self::new(
            client.clone(),
            client,
            DEFAULT_KEY_PREFIX,
            cfg.presign_ttl,
        ))
    }

    /// Only keys beneath our prefix are accepted.
    fn object_path(&self, storage_key: &str) -> ShareResult<ObjectPath> {
        let path = ObjectPath::parse(storage_key).map_err(|_| ShareError::InvalidStorageKey)?;
        if path.prefix_match(&self.prefix).is_none() || path == self.prefix {
            return Err(ShareError::InvalidStorageKey);
        }
        Ok(path)
    }

    fn presign_ttl(&self, opts: ResolveOptions) -> Duration {
        if opts.one_time {
            self.presign_ttl.min(ONE_TIME_PRESIGN_TTL)
        } else {
            self.presign_ttl
        }
    }
}

#[async_trait]
impl BlobStore for RemoteBlobStore {
    fn name(&self) -> &'static str {
        "s3"
    }

    async fn put(&self, mut body: ByteStream<'_>, meta: &BlobMeta<'_>) -> ShareResult<PutOutcome> {
        let path = self.prefix.child(Uuid::new_v4().simple().to_string());

        let mut attributes = Attributes::new();
        attributes.insert(Attribute::ContentType, meta.content_type.to_string().into());
        attributes.insert(
            Attribute::ContentDisposition,
            attachment_disposition(meta.original_name).into(),
        );
        let mut writer =
            BufWriter::new(self.store.clone(), path.clone()).with_attributes(attributes);

        let mut size_bytes: i64 = 0;
        let mut digest = Context::new();
        while let Some(chunk_res) = body.next().await {
            let written = match chunk_res {
                Ok(chunk) => {
                    size_bytes += chunk.len() as i64;
                    digest.consume(&chunk);
                    writer.write_all(&chunk).await
                }
                Err(err) => Err(err),
            };
            if let Err(err) = written {
                if let Err(abort_err) = writer.abort().await {
                    warn!(key = %path, error = %abort_err, "aborting remote upload failed");
                }
                return Err(ShareError::Io(err));
            }
        }
        // `finish` aborts a multipart upload whose completion fails. Once
        // shut down the writer can no longer be aborted.
        writer.shutdown().await?;

        debug!(key = %path, size_bytes, "uploaded blob to {}", self.store);
        Ok(PutOutcome {
            storage_key: path.to_string(),
            size_bytes,
            etag: format!("{:x}", digest.compute()),
        })
    }

    /// Checks the object exists, then presigns a GET for it.
    async fn resolve(&self, storage_key: &str, opts: ResolveOptions) -> ShareResult<BlobSource> {
        let path = self.object_path(storage_key)?;
        match self.store.head(&path).await {
            Ok(_) => {}
            Err(object_store::Error::NotFound { .. }) => return Err(ShareError::NotFound),
            Err(err) => return Err(err.into()),
        }

        let valid_for = self.presign_ttl(opts);
        let url = self.signer.signed_url(Method::GET, &path, valid_for).await?;
        Ok(BlobSource::Redirect { url, valid_for })
    }

    async fn delete(&self, storage_key: &str) -> ShareResult<()> {
        let path = self.object_path(storage_key)?;
        match self.store.delete(&path).await {
            Ok(()) => {
                debug!(key = %path, "removed remote blob");
                Ok(())
            }
            Err(object_store::Error::NotFound { .. }) => {
                debug!(key = %path, "remote blob already missing");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn list(&self) -> ShareResult<Vec<BlobEntry>> {
        let mut listing = self.store.list(Some(&self.prefix));
        let mut entries = Vec::new();
        while let Some(meta) = listing.next().await {
            let meta = meta?;
            entries.push(BlobEntry {
                storage_key: meta.location.to_string(),
                last_modified: meta.last_modified,
            });
        }
        Ok(entries)
    }

    async fn probe(&self) -> ShareResult<()> {
        self.store.list_with_delimiter(Some(&self.prefix)).await?;
        Ok(())
    }
}
