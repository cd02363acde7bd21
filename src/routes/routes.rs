//! Defines routes for the share store.
//!
//! ## Structure
//! - **Health**: `GET /healthz`, `GET /readyz`
//! - **Sharing**
//!   - `POST   /api/upload` — multipart upload, returns the download link
//!   - `GET    /d/{token}` — download (stream or redirect)
//!   - `GET    /api/link-status/{token}` — does the link still work
//!   - `GET    /api/access-info` — caller classification and permissions
//!   - `DELETE /api/purge-expired`, `DELETE /api/purge-all` — internal only
//!   - `GET    /api/cleanup-status`
//! - **Admin** (internal only)
//!   - `GET  /admin/api/config`, `GET /admin/api/config/export`
//!   - `GET  /admin/api/system-info`
//!   - `POST /admin/api/config/network`, `POST /admin/api/config/app`
//!   - `POST /admin/api/sweep-orphans`

use crate::{
    handlers::{
        admin_handlers::{
            export_config, get_config, sweep_orphans, system_info, update_app, update_network,
        },
        health_handlers::{healthz, readyz},
        share_handlers::{
            access_info, cleanup_status, download, link_status, purge_all, purge_expired, upload,
        },
    },
    services::share_service::ShareService,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{delete, get, post},
};

/// Build the router. Handlers share a `ShareService` as state.
pub fn routes() -> Router<ShareService> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // uploads are streamed to the blob store, so no body limit applies
        .route(
            "/api/upload",
            post(upload).layer(DefaultBodyLimit::disable()),
        )
        .route("/d/{token}", get(download))
        .route("/api/link-status/{token}", get(link_status))
        .route("/api/access-info", get(access_info))
        .route("/api/purge-expired", delete(purge_expired))
        .route("/api/purge-all", delete(purge_all))
        .route("/api/cleanup-status", get(cleanup_status))
        // admin
        .route("/admin/api/config", get(get_config))
        .route("/admin/api/config/export", get(export_config))
        .route("/admin/api/system-info", get(system_info))
        .route("/admin/api/config/network", post(update_network))
        .route("/admin/api/config/app", post(update_app))
        .route("/admin/api/sweep-orphans", post(sweep_orphans))
}
