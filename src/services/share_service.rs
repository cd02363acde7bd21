//! The operations behind the HTTP surface: upload, download, status and
//! purges. Handlers stay thin and call into [`ShareService`].

use crate::{
    config::{ConfigHandle, Settings},
    errors::{ShareError, ShareResult},
    models::{NewObject, StoredObject},
    services::{
        access::{AccessInfo, AllowReason, UploadDecision},
        blob_store::{BlobMeta, BlobSource, BlobStore, ByteStream, PutOutcome, ResolveOptions},
        expiry::{Clock, ExpiryPolicy},
        reclaimer::{ReclaimReport, Reclaimer, SweepReport},
        registry::Registry,
    },
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tracing::{info, warn};

const FALLBACK_NAME: &str = "upload.bin";

/// Returned to the uploader.
#[derive(Debug, Clone, Serialize)]
pub struct UploadReceipt {
    pub ok: bool,
    pub token: String,
    pub download_url: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub one_time: bool,
    pub filename: String,
    pub size: i64,
}

/// A blob that has been written but not yet registered.
#[derive(Debug, Clone)]
pub struct PendingUpload {
    pub original_name: String,
    pub content_type: String,
    pub outcome: PutOutcome,
}

/// Everything a handler needs to answer a download.
#[derive(Debug)]
pub struct Download {
    pub object: StoredObject,
    pub source: BlobSource,
}

#[derive(Debug, Clone, Serialize)]
pub struct CleanupStatus {
    pub cleanup_running: bool,
    pub cleanup_interval_hours: f64,
    pub total_files: i64,
    pub expired_files_pending: usize,
    pub storage_backend: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileStats {
    pub total_count: i64,
    pub total_size_bytes: i64,
    pub expired_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RuntimeInfo {
    pub internal_networks: Vec<String>,
    pub allow_external_upload: bool,
    pub cleanup_running: bool,
    pub storage_backend: &'static str,
}

/// Operator overview for the admin page.
#[derive(Debug, Clone, Serialize)]
pub struct SystemInfo {
    pub files: FileStats,
    pub settings: Settings,
    pub runtime: RuntimeInfo,
    pub client: AccessInfo,
}

/// Current settings, stamped for download as a backup.
#[derive(Debug, Clone, Serialize)]
pub struct SettingsExport {
    #[serde(flatten)]
    pub settings: Settings,
    pub exported_at: DateTime<Utc>,
    pub exported_by: String,
}

#[derive(Clone)]
pub struct ShareService {
    registry: Registry,
    blobs: Arc<dyn BlobStore>,
    config: ConfigHandle,
    clock: Arc<dyn Clock>,
    reclaimer: Reclaimer,
}

impl ShareService {
    pub fn new(
        registry: Registry,
        blobs: Arc<dyn BlobStore>,
        config: ConfigHandle,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let reclaimer = Reclaimer::new(
            registry.clone(),
            blobs.clone(),
            config.clone(),
            clock.clone(),
        );
        Self {
            registry,
            blobs,
            config,
            clock,
            reclaimer,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn blobs(&self) -> &Arc<dyn BlobStore> {
        &self.blobs
    }

    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    pub fn reclaimer(&self) -> &Reclaimer {
        &self.reclaimer
    }

    /// Gate an upload before any of its body is read.
    pub fn check_upload(&self, client: &str, supplied_token: Option<&str>) -> ShareResult<AllowReason> {
        match self.config.snapshot().access.check_upload(client, supplied_token) {
            UploadDecision::Allow(reason) => Ok(reason),
            UploadDecision::Deny(reason) => {
                warn!(client, reason = %reason, "upload denied");
                Err(ShareError::UploadDenied(reason))
            }
        }
    }

    /// Internal callers only.
    pub fn ensure_internal(&self, client: &str) -> ShareResult<()> {
        if self.config.snapshot().access.is_internal(client) {
            Ok(())
        } else {
            warn!(client, "restricted endpoint called from external address");
            Err(ShareError::AdminOnly)
        }
    }

    /// Stream the payload into the blob store. No metadata is written yet.
    pub async fn store_blob(
        &self,
        body: ByteStream<'_>,
        filename: Option<&str>,
        content_type: Option<&str>,
    ) -> ShareResult<PendingUpload> {
        let original_name = sanitize_name(filename);
        let content_type = content_type
            .map(str::trim)
            .filter(|ct| !ct.is_empty() && *ct != "application/octet-stream")
            .map(str::to_string)
            .unwrap_or_else(|| {
                mime_guess::from_path(&original_name)
                    .first_or_octet_stream()
                    .to_string()
            });

        let meta = BlobMeta {
            original_name: &original_name,
            content_type: &content_type,
        };
        let outcome = self.blobs.put(body, &meta).await?;
        Ok(PendingUpload {
            original_name,
            content_type,
            outcome,
        })
    }

    /// Remove a blob whose upload is being abandoned.
    pub async fn discard_blob(&self, pending: &PendingUpload) {
        if let Err(err) = self.blobs.delete(&pending.outcome.storage_key).await {
            warn!(
                key = %pending.outcome.storage_key,
                error = %err,
                "failed to discard abandoned blob; the orphan sweep will pick it up"
            );
        }
    }

    /// Register a stored blob and issue its link. If registration fails the
    /// blob is discarded.
    ///
    /// `request_base` is used for the link when no public base URL is set.
    pub async fn finalize_upload(
        &self,
        pending: PendingUpload,
        requested_days: Option<i64>,
        request_base: &str,
    ) -> ShareResult<UploadReceipt> {
        let snapshot = self.config.snapshot();
        let now = self.clock.now();
        let expiry = snapshot.expiry.resolve(requested_days, now);

        let new = NewObject {
            original_name: pending.original_name.clone(),
            content_type: pending.content_type.clone(),
            storage_key: pending.outcome.storage_key.clone(),
            size_bytes: pending.outcome.size_bytes,
            etag: Some(pending.outcome.etag.clone()),
            created_at: now,
            expires_at: expiry.expires_at,
            one_time: expiry.one_time,
        };
        let object = match self.registry.create(new).await {
            Ok(object) => object,
            Err(err) => {
                self.discard_blob(&pending).await;
                return Err(err);
            }
        };

        info!(
            token = object.short_token(),
            size_bytes = object.size_bytes,
            days = expiry.days,
            one_time = object.one_time,
            "upload stored"
        );

        let base = if snapshot.settings.base_url.is_empty() {
            request_base
        } else {
            snapshot.settings.base_url.as_str()
        };
        Ok(UploadReceipt {
            ok: true,
            download_url: download_url(base, &object.token),
            token: object.token,
            expires_at: object.expires_at,
            one_time: object.one_time,
            filename: object.original_name,
            size: object.size_bytes,
        })
    }

    /// Access check, blob write and registration in one call.
    #[allow(clippy::too_many_arguments)]
    pub async fn upload(
        &self,
        client: &str,
        supplied_token: Option<&str>,
        body: ByteStream<'_>,
        filename: Option<&str>,
        content_type: Option<&str>,
        requested_days: Option<i64>,
        request_base: &str,
    ) -> ShareResult<UploadReceipt> {
        self.check_upload(client, supplied_token)?;
        let pending = self.store_blob(body, filename, content_type).await?;
        self.finalize_upload(pending, requested_days, request_base).await
    }

    /// Resolve a token to something servable.
    ///
    /// Missing and expired tokens are indistinguishable to the caller. A
    /// one-time object is claimed atomically, so only one download wins.
    pub async fn download(&self, token: &str) -> ShareResult<Download> {
        let now = self.clock.now();
        let object = self
            .registry
            .lookup(token)
            .await?
            .ok_or(ShareError::NotFound)?;

        if ExpiryPolicy::is_expired(&object, now) {
            self.reclaimer.request_scan();
            return Err(ShareError::NotFound);
        }

        let source = match self
            .blobs
            .resolve(&object.storage_key, ResolveOptions { one_time: object.one_time })
            .await
        {
            Ok(source) => source,
            Err(ShareError::NotFound) => {
                warn!(token = object.short_token(), "metadata present but blob is missing");
                return Err(ShareError::NotFound);
            }
            Err(err) => return Err(err),
        };

        let object = match self.registry.record_download(token).await? {
            Some(updated) => updated,
            // Lost the one-time race, or reclaimed meanwhile.
            None if object.one_time => return Err(ShareError::NotFound),
            None => object,
        };

        if object.one_time {
            info!(token = object.short_token(), "one-time link consumed");
            // A presigned URL must outlive the blob, so remote blobs are left
            // for the next scheduled scan.
            if matches!(source, BlobSource::Stream { .. }) {
                self.reclaimer.request_scan();
            }
        }

        Ok(Download { object, source })
    }

    /// True if the token names a live object. No side effects.
    pub async fn link_status(&self, token: &str) -> ShareResult<bool> {
        let now = self.clock.now();
        Ok(self
            .registry
            .lookup(token)
            .await?
            .is_some_and(|object| !ExpiryPolicy::is_expired(&object, now)))
    }

    pub fn access_info(&self, client: &str) -> AccessInfo {
        self.config.snapshot().access.access_info(client)
    }

    pub async fn purge_expired(&self) -> ShareResult<ReclaimReport> {
        self.reclaimer.run_once().await
    }

    pub async fn purge_all(&self) -> ShareResult<ReclaimReport> {
        self.reclaimer.purge_all().await
    }

    pub async fn sweep_orphans(&self, grace: Duration) -> ShareResult<SweepReport> {
        self.reclaimer.sweep_orphans(grace).await
    }

    pub async fn cleanup_status(&self) -> ShareResult<CleanupStatus> {
        let snapshot = self.config.snapshot();
        Ok(CleanupStatus {
            cleanup_running: self.reclaimer.is_running(),
            cleanup_interval_hours: snapshot.settings.cleanup_interval_hours,
            total_files: self.registry.count().await?,
            expired_files_pending: self.reclaimer.pending_expired().await?,
            storage_backend: self.blobs.name(),
        })
    }

    pub async fn system_info(&self, client: &str) -> ShareResult<SystemInfo> {
        let snapshot = self.config.snapshot();
        let files = FileStats {
            total_count: self.registry.count().await?,
            total_size_bytes: self.registry.total_size().await?,
            expired_count: self.reclaimer.pending_expired().await?,
        };
        Ok(SystemInfo {
            files,
            settings: snapshot.settings.clone(),
            runtime: RuntimeInfo {
                internal_networks: snapshot.settings.internal_networks.clone(),
                allow_external_upload: snapshot.settings.allow_external_upload,
                cleanup_running: self.reclaimer.is_running(),
                storage_backend: self.blobs.name(),
            },
            client: snapshot.access.access_info(client),
        })
    }

    /// The upload secret is not part of `Settings` and never exported.
    pub fn export_settings(&self, client: &str) -> SettingsExport {
        SettingsExport {
            settings: self.config.snapshot().settings.clone(),
            exported_at: self.clock.now(),
            exported_by: client.to_string(),
        }
    }
}

/// `{base}/d/{token}`.
pub fn download_url(base: &str, token: &str) -> String {
    format!("{}/d/{}", base.trim_end_matches('/'), token)
}

/// Parse the `expires_in_days` form value. Empty means "use the default".
pub fn parse_expiry(raw: &str) -> ShareResult<Option<i64>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    trimmed
        .parse::<i64>()
        .map(Some)
        .map_err(|_| ShareError::InvalidExpiry(trimmed.to_string()))
}

/// Last path component of a client-supplied name, made safe as a file
/// name. Only ever used for display and `Content-Disposition`.
fn sanitize_name(raw: Option<&str>) -> String {
    let base = raw
        .unwrap_or_default()
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default();
    let cleaned = sanitize_filename::sanitize(base);
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        FALLBACK_NAME.to_string()
    } else {
        cleaned.to_string()
    }
}

impl std::fmt::Debug for ShareService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShareService")
            .field("backend", &self.blobs.name())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_values_parse_or_fail_validation() {
        assert_eq!(parse_expiry("").unwrap(), None);
        assert_eq!(parse_expiry(" 7 ").unwrap(), Some(7));
        assert_eq!(parse_expiry("-3").unwrap(), Some(-3));
        assert!(matches!(parse_expiry("soon"), Err(ShareError::InvalidExpiry(v)) if v == "soon"));
        assert!(parse_expiry("1.5").is_err());
    }

    #[test]
    fn names_are_reduced_to_their_last_component() {
        assert_eq!(sanitize_name(Some("../../etc/passwd")), "passwd");
        assert_eq!(sanitize_name(Some("C:\\Users\\me\\report.pdf")), "report.pdf");
        assert_eq!(sanitize_name(Some("bad\u{0}name.txt")), "badname.txt");
        assert_eq!(sanitize_name(Some("dir/")), FALLBACK_NAME);
        assert_eq!(sanitize_name(Some("..")), FALLBACK_NAME);
        assert_eq!(sanitize_name(None), FALLBACK_NAME);
    }

    #[test]
    fn reserved_characters_are_dropped_and_long_names_truncated() {
        assert_eq!(sanitize_name(Some("what?:<now>.txt")), "whatnow.txt");
        assert_eq!(sanitize_name(Some("Bericht final ä.txt")), "Bericht final ä.txt");
        let long = format!("{}.txt", "ä".repeat(200));
        let cleaned = sanitize_name(Some(&long));
        assert!(cleaned.len() <= 255);
        assert!(cleaned.starts_with('ä'));
    }

    #[test]
    fn download_urls_join_without_double_slashes() {
        assert_eq!(
            download_url("https://files.example/", "abc"),
            "https://files.example/d/abc"
        );
        assert_eq!(download_url("http://10.0.0.2:8000", "t"), "http://10.0.0.2:8000/d/t");
    }
}
