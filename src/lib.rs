//! Self-hosted file sharing with expiring links.
//!
//! Uploads are streamed into a blob store (local disk or S3-compatible) and
//! registered in SQLite under an unguessable token. Links expire after a
//! number of days or after their first download; a background reclaimer
//! removes what has expired.

pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;

use axum::Router;
use services::share_service::ShareService;

/// The complete HTTP application with its state attached.
pub fn app(service: ShareService) -> Router {
    routes::routes::routes().with_state(service)
}
