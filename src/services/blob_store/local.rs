//! Local-disk blob backend.
//!
//! Payloads live beneath `base_path/{shard}/{shard}/{key}`. Keys are random
//! UUIDs generated here, never derived from client input.

use super::{BlobEntry, BlobMeta, BlobSource, BlobStore, ByteStream, PutOutcome, ResolveOptions};
use crate::errors::{ShareError, ShareResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use md5::Context;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

const MAX_STORAGE_KEY_LEN: usize = 128;
const TMP_PREFIX: &str = ".tmp-";

#[derive(Clone, Debug)]
pub struct LocalBlobStore {
    /// Base directory on disk where payloads are stored.
    base_path: PathBuf,
}

impl LocalBlobStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Keys come from the database, so they are checked again before being
    /// turned into a path.
    fn ensure_key_safe(key: &str) -> ShareResult<()> {
        if key.is_empty() || key.len() > MAX_STORAGE_KEY_LEN {
            return Err(ShareError::InvalidStorageKey);
        }
        if key.starts_with('.') {
            return Err(ShareError::InvalidStorageKey);
        }
        if !key
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            return Err(ShareError::InvalidStorageKey);
        }
        Ok(())
    }

    /// Two-level shard directories from MD5(key), `00`–`ff` each.
    fn shards(key: &str) -> (String, String) {
        let digest = md5::compute(key);
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn blob_path(&self, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::shards(key);
        let mut path = self.base_path.clone();
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        path
    }

    /// Walk up from `start` removing empty directories, stopping at `stop`.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    fn name(&self) -> &'static str {
        "local"
    }

    /// Streams into a temp file, fsyncs, then renames into place. The temp
    /// file is removed on any error.
    async fn put(&self, mut body: ByteStream<'_>, meta: &BlobMeta<'_>) -> ShareResult<PutOutcome> {
        let key = Uuid::new_v4().simple().to_string();
        let file_path = self.blob_path(&key);
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            ShareError::Io(io::Error::other("blob path missing parent directory"))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!("{}{}", TMP_PREFIX, Uuid::new_v4()));
        let mut file = match File::create(&tmp_path).await {
            Ok(file) => file,
            // A concurrent delete may have pruned the shard directory.
            Err(err) if err.kind() == ErrorKind::NotFound => {
                fs::create_dir_all(&parent).await?;
                File::create(&tmp_path).await?
            }
            Err(err) => return Err(ShareError::Io(err)),
        };

        let mut size_bytes: i64 = 0;
        let mut digest = Context::new();
        while let Some(chunk_res) = body.next().await {
            let chunk = match chunk_res {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(ShareError::Io(err));
                }
            };
            size_bytes += chunk.len() as i64;
            digest.consume(&chunk);
            if let Err(err) = file.write_all(&chunk).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(ShareError::Io(err));
            }
        }
        if let Err(err) = file.flush().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(ShareError::Io(err));
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(ShareError::Io(err));
        }
        drop(file);

        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(ShareError::Io(err));
        }

        debug!(
            key = %key,
            size_bytes,
            name = meta.original_name,
            "stored blob {}",
            file_path.display()
        );

        Ok(PutOutcome {
            storage_key: key,
            size_bytes,
            etag: format!("{:x}", digest.compute()),
        })
    }

    async fn resolve(&self, storage_key: &str, _opts: ResolveOptions) -> ShareResult<BlobSource> {
        Self::ensure_key_safe(storage_key)?;
        let file_path = self.blob_path(storage_key);
        let file = File::open(&file_path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                ShareError::NotFound
            } else {
                ShareError::Io(err)
            }
        })?;
        let len = file.metadata().await?.len();

        Ok(BlobSource::Stream {
            reader: Box::pin(file),
            len,
        })
    }

    async fn delete(&self, storage_key: &str) -> ShareResult<()> {
        Self::ensure_key_safe(storage_key)?;
        let file_path = self.blob_path(storage_key);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed blob file {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("blob file {} already missing", file_path.display());
            }
            Err(err) => return Err(ShareError::Io(err)),
        }

        if let Some(parent) = file_path.parent() {
            self.prune_empty_dirs(parent, &self.base_path).await;
        }
        Ok(())
    }

    /// Temp files from in-flight uploads are not listed.
    async fn list(&self) -> ShareResult<Vec<BlobEntry>> {
        let mut entries = Vec::new();
        let mut pending = vec![self.base_path.clone()];

        while let Some(dir) = pending.pop() {
            let mut read_dir = match fs::read_dir(&dir).await {
                Ok(rd) => rd,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(ShareError::Io(err)),
            };
            while let Some(entry) = read_dir.next_entry().await? {
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    pending.push(entry.path());
                    continue;
                }
                let name = entry.file_name().to_string_lossy().into_owned();
                if Self::ensure_key_safe(&name).is_err() {
                    continue;
                }
                let modified = entry.metadata().await?.modified()?;
                entries.push(BlobEntry {
                    storage_key: name,
                    last_modified: DateTime::<Utc>::from(modified),
                });
            }
        }

        Ok(entries)
    }

    /// Write/read/delete a small file under the base path.
    async fn probe(&self) -> ShareResult<()> {
        fs::create_dir_all(&self.base_path).await?;
        let tmp_path = self
            .base_path
            .join(format!(".readyz-{}", Uuid::new_v4()));
        fs::write(&tmp_path, b"readyz").await?;
        let bytes = fs::read(&tmp_path).await;
        let _ = fs::remove_file(&tmp_path).await;
        if bytes? != b"readyz" {
            return Err(ShareError::Io(io::Error::other("probe file content mismatch")));
        }
        Ok(())
    }
}
