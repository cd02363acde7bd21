use anyhow::Result;
use share_store::{
    config::{AppConfig, BackendConfig, ConfigHandle, RuntimeConfig, Settings},
    services::{
        blob_store::{BlobStore, LocalBlobStore, RemoteBlobStore},
        expiry::SystemClock,
        registry::Registry,
        share_service::ShareService,
    },
};
use std::{io::ErrorKind, net::SocketAddr, path::Path, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting share-store with config: {:?}", cfg);

    // --- Initialize SQLite registry ---
    tracing::debug!("Connecting using raw URL => {}", cfg.database_url);
    let registry = Registry::connect(&cfg.database_url).await?;
    registry.migrate().await?;

    // --- Handle migration mode ---
    if migrate {
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Runtime settings ---
    let settings = Settings::load_or(&cfg.settings_path, cfg.settings.clone())?;
    let runtime = RuntimeConfig::build(settings, cfg.upload_token.clone(), cfg.trust_proxy)?;
    if runtime.settings.allow_external_upload {
        tracing::warn!("External uploads are enabled for every address");
    }
    let config = ConfigHandle::new(runtime, Some(cfg.settings_path.clone()));

    // --- Blob backend ---
    let blobs: Arc<dyn BlobStore> = match &cfg.backend {
        BackendConfig::Local => {
            if !Path::new(&cfg.storage_dir).exists() {
                std::fs::create_dir_all(&cfg.storage_dir)?;
                tracing::info!("Created storage directory at {}", cfg.storage_dir);
            }
            Arc::new(LocalBlobStore::new(&cfg.storage_dir))
        }
        BackendConfig::S3(s3) => Arc::new(RemoteBlobStore::s3(s3)?),
    };
    tracing::info!(backend = blobs.name(), "blob store ready");

    // --- Initialize core service + reclaimer ---
    let service = ShareService::new(registry, blobs, config, Arc::new(SystemClock));
    let reclaimer = service.reclaimer().clone();
    let reclaim_task = reclaimer.spawn();

    // --- Build router ---
    let app = share_store::app(service);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // --- Stop the reclaimer ---
    reclaimer.shutdown();
    if let Err(err) = reclaim_task.await {
        tracing::warn!("Reclaimer task ended abnormally: {}", err);
    }
    tracing::info!("Shutdown complete");

    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                tracing::error!("Failed to install SIGTERM handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}
