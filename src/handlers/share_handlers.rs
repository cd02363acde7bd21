//! HTTP handlers for uploads, downloads and link housekeeping.
//! Upload bodies are streamed straight into the blob store; downloads are
//! streamed back or redirected, depending on the backend.

use crate::{
    errors::{AppError, ShareError},
    handlers::client::{ClientAddr, request_base},
    models::StoredObject,
    services::{
        blob_store::{BlobSource, attachment_disposition},
        share_service::{
            CleanupStatus, Download, PendingUpload, ShareService, UploadReceipt, parse_expiry,
        },
    },
};
use axum::{
    Json,
    body::Body,
    extract::{Multipart, Path, Query, State, multipart::MultipartError},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Redirect, Response},
};
use futures::{StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::io;
use tokio_util::io::ReaderStream;

pub const UPLOAD_TOKEN_HEADER: &str = "x-upload-token";
/// Header sent by older ShareIt clients; same meaning.
pub const LEGACY_TOKEN_HEADER: &str = "x-shareit-token";

#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    pub token: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct LinkStatus {
    pub exists: bool,
}

#[derive(Default)]
struct UploadForm {
    pending: Option<PendingUpload>,
    requested_days: Option<i64>,
}

/// `POST /api/upload` — multipart with a `file` part and an optional
/// `expires_in_days` part, in either order.
pub async fn upload(
    State(service): State<ShareService>,
    ClientAddr(client): ClientAddr,
    Query(query): Query<UploadQuery>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<UploadReceipt>, AppError> {
    let supplied = [UPLOAD_TOKEN_HEADER, LEGACY_TOKEN_HEADER]
        .into_iter()
        .find_map(|name| headers.get(name).and_then(|v| v.to_str().ok()))
        .or(query.token.as_deref());
    service.check_upload(&client, supplied)?;

    let mut form = UploadForm::default();
    if let Err(err) = read_upload_form(&service, &mut multipart, &mut form).await {
        if let Some(pending) = form.pending.take() {
            service.discard_blob(&pending).await;
        }
        return Err(err);
    }
    let pending = form.pending.ok_or(ShareError::MissingFile)?;

    let base = request_base(&headers, service.config().snapshot().trust_proxy);
    let receipt = service
        .finalize_upload(pending, form.requested_days, &base)
        .await?;
    Ok(Json(receipt))
}

async fn read_upload_form(
    service: &ShareService,
    multipart: &mut Multipart,
    form: &mut UploadForm,
) -> Result<(), AppError> {
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        match field.name() {
            Some("file") => {
                if form.pending.is_some() {
                    return Err(AppError::bad_request("only one file per upload"));
                }
                let filename = field.file_name().map(str::to_string);
                let content_type = field.content_type().map(str::to_string);
                let body = field.map_err(io::Error::other).boxed();
                let pending = service
                    .store_blob(body, filename.as_deref(), content_type.as_deref())
                    .await?;
                form.pending = Some(pending);
            }
            Some("expires_in_days") => {
                let raw = field.text().await.map_err(multipart_error)?;
                form.requested_days = parse_expiry(&raw)?;
            }
            _ => {}
        }
    }
    Ok(())
}

fn multipart_error(err: MultipartError) -> AppError {
    AppError::new(err.status(), err.body_text())
}

/// `GET /d/{token}`
pub async fn download(
    State(service): State<ShareService>,
    Path(token): Path<String>,
) -> Result<Response, AppError> {
    let Download { object, source } = service.download(&token).await?;

    match source {
        BlobSource::Stream { reader, len } => {
            let body = Body::from_stream(ReaderStream::new(reader));
            let mut response = Response::new(body);
            *response.status_mut() = StatusCode::OK;
            set_download_headers(response.headers_mut(), &object, len);
            Ok(response)
        }
        BlobSource::Redirect { url, .. } => Ok((
            [(header::CACHE_CONTROL, HeaderValue::from_static("no-store"))],
            Redirect::temporary(url.as_str()),
        )
            .into_response()),
    }
}

fn set_download_headers(headers: &mut HeaderMap, object: &StoredObject, len: u64) {
    let content_type = HeaderValue::from_str(&object.content_type)
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));
    headers.insert(header::CONTENT_TYPE, content_type);
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    if let Ok(value) = HeaderValue::from_str(&attachment_disposition(&object.original_name)) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    if let Some(etag) = object.etag.as_deref() {
        if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", etag)) {
            headers.insert(header::ETAG, value);
        }
    }
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
}

/// `GET /api/link-status/{token}`
pub async fn link_status(
    State(service): State<ShareService>,
    Path(token): Path<String>,
) -> Result<Json<LinkStatus>, AppError> {
    let exists = service.link_status(&token).await?;
    Ok(Json(LinkStatus { exists }))
}

/// `GET /api/access-info`
pub async fn access_info(
    State(service): State<ShareService>,
    ClientAddr(client): ClientAddr,
) -> impl IntoResponse {
    Json(service.access_info(&client))
}

/// `DELETE /api/purge-expired`
pub async fn purge_expired(
    State(service): State<ShareService>,
    ClientAddr(client): ClientAddr,
) -> Result<impl IntoResponse, AppError> {
    service.ensure_internal(&client)?;
    let report = service.purge_expired().await?;
    Ok(Json(report))
}

/// `DELETE /api/purge-all`
pub async fn purge_all(
    State(service): State<ShareService>,
    ClientAddr(client): ClientAddr,
) -> Result<impl IntoResponse, AppError> {
    service.ensure_internal(&client)?;
    let report = service.purge_all().await?;
    Ok(Json(report))
}

/// `GET /api/cleanup-status`
pub async fn cleanup_status(
    State(service): State<ShareService>,
) -> Result<Json<CleanupStatus>, AppError> {
    Ok(Json(service.cleanup_status().await?))
}
