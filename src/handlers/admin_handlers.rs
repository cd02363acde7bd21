//! Runtime configuration and maintenance endpoints. Internal callers only.

use crate::{
    config::Settings,
    errors::AppError,
    handlers::client::ClientAddr,
    services::{
        reclaimer::SweepReport,
        share_service::{SettingsExport, ShareService, SystemInfo},
    },
};
use axum::{
    Json,
    extract::{Query, State},
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_ORPHAN_GRACE_MINUTES: u64 = 60;

#[derive(Debug, Serialize)]
pub struct ConfigView {
    pub settings: Settings,
    pub upload_token_configured: bool,
    pub trust_proxy: bool,
    pub storage_backend: &'static str,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkUpdate {
    pub internal_networks: Option<Vec<String>>,
    pub allow_external_upload: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppUpdate {
    pub base_url: Option<String>,
    pub default_expire_days: Option<u32>,
    pub max_expire_days: Option<u32>,
    pub cleanup_interval_hours: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct SweepQuery {
    pub grace_minutes: Option<u64>,
}

fn view(service: &ShareService) -> ConfigView {
    let snapshot = service.config().snapshot();
    ConfigView {
        settings: snapshot.settings.clone(),
        upload_token_configured: snapshot.access.has_upload_secret(),
        trust_proxy: snapshot.trust_proxy,
        storage_backend: service.blobs().name(),
    }
}

/// `GET /admin/api/config`
pub async fn get_config(
    State(service): State<ShareService>,
    ClientAddr(client): ClientAddr,
) -> Result<Json<ConfigView>, AppError> {
    service.ensure_internal(&client)?;
    Ok(Json(view(&service)))
}

/// `GET /admin/api/config/export`
pub async fn export_config(
    State(service): State<ShareService>,
    ClientAddr(client): ClientAddr,
) -> Result<Json<SettingsExport>, AppError> {
    service.ensure_internal(&client)?;
    Ok(Json(service.export_settings(&client)))
}

/// `GET /admin/api/system-info`
pub async fn system_info(
    State(service): State<ShareService>,
    ClientAddr(client): ClientAddr,
) -> Result<Json<SystemInfo>, AppError> {
    service.ensure_internal(&client)?;
    Ok(Json(service.system_info(&client).await?))
}

/// `POST /admin/api/config/network`
pub async fn update_network(
    State(service): State<ShareService>,
    ClientAddr(client): ClientAddr,
    Json(update): Json<NetworkUpdate>,
) -> Result<Json<ConfigView>, AppError> {
    service.ensure_internal(&client)?;
    service
        .config()
        .update(|settings| {
            if let Some(networks) = update.internal_networks {
                settings.internal_networks = networks
                    .into_iter()
                    .map(|n| n.trim().to_string())
                    .filter(|n| !n.is_empty())
                    .collect();
            }
            if let Some(allow) = update.allow_external_upload {
                settings.allow_external_upload = allow;
            }
        })
        .await?;
    Ok(Json(view(&service)))
}

/// `POST /admin/api/config/app`
pub async fn update_app(
    State(service): State<ShareService>,
    ClientAddr(client): ClientAddr,
    Json(update): Json<AppUpdate>,
) -> Result<Json<ConfigView>, AppError> {
    service.ensure_internal(&client)?;
    service
        .config()
        .update(|settings| {
            if let Some(base_url) = update.base_url {
                settings.base_url = base_url.trim().trim_end_matches('/').to_string();
            }
            if let Some(days) = update.default_expire_days {
                settings.default_expire_days = days;
            }
            if let Some(days) = update.max_expire_days {
                settings.max_expire_days = days;
            }
            if let Some(hours) = update.cleanup_interval_hours {
                settings.cleanup_interval_hours = hours;
            }
        })
        .await?;
    Ok(Json(view(&service)))
}

/// `POST /admin/api/sweep-orphans?grace_minutes=N`
pub async fn sweep_orphans(
    State(service): State<ShareService>,
    ClientAddr(client): ClientAddr,
    Query(query): Query<SweepQuery>,
) -> Result<Json<SweepReport>, AppError> {
    service.ensure_internal(&client)?;
    let minutes = query.grace_minutes.unwrap_or(DEFAULT_ORPHAN_GRACE_MINUTES);
    let grace = Duration::from_secs(minutes.saturating_mul(60));
    Ok(Json(service.sweep_orphans(grace).await?))
}
