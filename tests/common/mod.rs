#![allow(dead_code)]

use bytes::Bytes;
use chrono::Utc;
use futures::{StreamExt, stream};
use share_store::{
    config::{ConfigHandle, RuntimeConfig, Settings},
    services::{
        blob_store::{BlobSource, BlobStore, ByteStream, LocalBlobStore},
        expiry::ManualClock,
        registry::Registry,
        share_service::ShareService,
    },
};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::io::AsyncReadExt;

pub const INTERNAL: &str = "192.168.1.20";
pub const EXTERNAL: &str = "203.0.113.9";
pub const SECRET: &str = "s3cret-upload-token";

pub struct Harness {
    pub service: ShareService,
    pub registry: Registry,
    pub clock: Arc<ManualClock>,
    pub local: Option<Arc<LocalBlobStore>>,
    pub dir: TempDir,
}

pub async fn registry_in(dir: &TempDir) -> Registry {
    let registry = Registry::open(&dir.path().join("meta.db")).await.unwrap();
    registry.migrate().await.unwrap();
    registry
}

pub fn config_in(dir: &TempDir, settings: Settings, secret: Option<&str>) -> ConfigHandle {
    let runtime = RuntimeConfig::build(settings, secret.map(str::to_string), false).unwrap();
    ConfigHandle::new(runtime, Some(dir.path().join("settings.json")))
}

/// Local-disk backend, default settings plus `SECRET` as the upload token.
pub async fn local_harness() -> Harness {
    local_harness_with(Settings::default()).await
}

pub async fn local_harness_with(settings: Settings) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry_in(&dir).await;
    let local = Arc::new(LocalBlobStore::new(dir.path().join("storage")));
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let service = ShareService::new(
        registry.clone(),
        local.clone(),
        config_in(&dir, settings, Some(SECRET)),
        clock.clone(),
    );
    Harness {
        service,
        registry,
        clock,
        local: Some(local),
        dir,
    }
}

/// Any backend, for tests that bring their own.
pub async fn harness_with_blobs(blobs: Arc<dyn BlobStore>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry_in(&dir).await;
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let service = ShareService::new(
        registry.clone(),
        blobs,
        config_in(&dir, Settings::default(), Some(SECRET)),
        clock.clone(),
    );
    Harness {
        service,
        registry,
        clock,
        local: None,
        dir,
    }
}

pub fn body_of(data: &[u8]) -> ByteStream<'static> {
    let chunks: Vec<_> = data
        .chunks(7)
        .map(|c| Ok(Bytes::copy_from_slice(c)))
        .collect();
    stream::iter(chunks).boxed()
}

pub async fn read_source(source: BlobSource) -> Vec<u8> {
    match source {
        BlobSource::Stream { mut reader, .. } => {
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf).await.unwrap();
            buf
        }
        other => panic!("expected a stream, got {other:?}"),
    }
}

/// A `multipart/form-data` body. Parts are `(name, filename, content)`.
pub fn multipart(boundary: &str, parts: &[(&str, Option<&str>, &str)]) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, filename, content) in parts {
        body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        match filename {
            Some(filename) => body.extend_from_slice(
                format!(
                    "Content-Disposition: form-data; name=\"{name}\"; filename=\"{filename}\"\r\n\
                     Content-Type: application/octet-stream\r\n\r\n"
                )
                .as_bytes(),
            ),
            None => body.extend_from_slice(
                format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
            ),
        }
        body.extend_from_slice(content.as_bytes());
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
    body
}
