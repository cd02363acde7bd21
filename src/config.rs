use crate::{
    errors::{ShareError, ShareResult},
    services::{
        access::AccessPolicy,
        expiry::ExpiryPolicy,
        network::{DEFAULT_INTERNAL_NETWORKS, NetworkClassifier},
    },
};
use anyhow::{Context, Result, bail};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::{
    env, fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
    time::Duration,
};
use tokio::sync::{Mutex, watch};
use tracing::info;

/// Centralized startup configuration.
/// Combines environment variables and CLI arguments.
#[derive(Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub settings_path: PathBuf,
    pub backend: BackendConfig,
    pub upload_token: Option<String>,
    pub trust_proxy: bool,
    /// Used when no settings file exists yet.
    pub settings: Settings,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Self-hosted expiring file sharing")]
pub struct Args {
    /// Host to bind to (overrides SHARE_STORE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides SHARE_STORE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where uploaded files are stored (overrides SHARE_STORE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides SHARE_STORE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// JSON file holding runtime settings (overrides SHARE_STORE_SETTINGS_PATH)
    #[arg(long)]
    pub settings_path: Option<PathBuf>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

/// Where blob payloads go.
#[derive(Clone)]
pub enum BackendConfig {
    Local,
    S3(S3Config),
}

#[derive(Clone)]
pub struct S3Config {
    pub endpoint: Option<String>,
    pub region: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    pub presign_ttl: Duration,
}

impl fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendConfig::Local => f.write_str("Local"),
            BackendConfig::S3(s3) => f
                .debug_struct("S3")
                .field("endpoint", &s3.endpoint)
                .field("region", &s3.region)
                .field("bucket", &s3.bucket)
                .field("presign_ttl", &s3.presign_ttl)
                .finish_non_exhaustive(),
        }
    }
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("storage_dir", &self.storage_dir)
            .field("database_url", &self.database_url)
            .field("settings_path", &self.settings_path)
            .field("backend", &self.backend)
            .field("upload_token", &self.upload_token.as_ref().map(|_| "***"))
            .field("trust_proxy", &self.trust_proxy)
            .finish_non_exhaustive()
    }
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        // Parse CLI once
        let args = Args::parse();

        // --- Environment fallback ---
        let env_host = env::var("SHARE_STORE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_parse("SHARE_STORE_PORT", 8000u16)?;
        let env_storage =
            env::var("SHARE_STORE_STORAGE_DIR").unwrap_or_else(|_| "./data/storage".into());
        let env_db = env::var("SHARE_STORE_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/files.db".into());
        let env_settings = env::var("SHARE_STORE_SETTINGS_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data/settings.json"));

        let settings = Settings::from_env()?;

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            settings_path: args.settings_path.unwrap_or(env_settings),
            backend: backend_from_env()?,
            upload_token: upload_token_from_env(),
            trust_proxy: env_parse("SHARE_STORE_TRUST_PROXY", false)?,
            settings,
        };

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Runtime-adjustable settings. Persisted as JSON and editable through the
/// admin endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Public base URL for links, without trailing slash. Empty means "use
    /// the request's Host header".
    pub base_url: String,
    pub default_expire_days: u32,
    pub max_expire_days: u32,
    pub cleanup_interval_hours: f64,
    pub internal_networks: Vec<String>,
    pub allow_external_upload: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            default_expire_days: 2,
            max_expire_days: 30,
            cleanup_interval_hours: 1.0,
            internal_networks: DEFAULT_INTERNAL_NETWORKS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            allow_external_upload: false,
        }
    }
}

impl Settings {
    fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let internal_networks = match env::var("SHARE_STORE_INTERNAL_NETWORKS") {
            Ok(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            Err(_) => defaults.internal_networks,
        };

        Ok(Self {
            base_url: env::var("SHARE_STORE_BASE_URL")
                .map(|s| s.trim_end_matches('/').to_string())
                .unwrap_or_default(),
            default_expire_days: env_parse(
                "SHARE_STORE_DEFAULT_EXPIRE_DAYS",
                defaults.default_expire_days,
            )?,
            max_expire_days: env_parse("SHARE_STORE_MAX_EXPIRE_DAYS", defaults.max_expire_days)?,
            cleanup_interval_hours: env_parse(
                "SHARE_STORE_CLEANUP_INTERVAL_HOURS",
                defaults.cleanup_interval_hours,
            )?,
            internal_networks,
            allow_external_upload: env_parse("SHARE_STORE_ALLOW_EXTERNAL_UPLOAD", false)?,
        })
    }

    /// Read `path` if it exists, otherwise return `fallback`.
    pub fn load_or(path: &Path, fallback: Settings) -> Result<Self> {
        if !path.exists() {
            return Ok(fallback);
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading settings file {}", path.display()))?;
        let settings = serde_json::from_str(&raw)
            .with_context(|| format!("parsing settings file {}", path.display()))?;
        info!("Loaded runtime settings from {}", path.display());
        Ok(settings)
    }

    /// Bounds enforced on every load and update.
    pub fn validate(&self) -> ShareResult<()> {
        if !(1..=365).contains(&self.default_expire_days) {
            return Err(ShareError::InvalidSettings(
                "default_expire_days must be between 1 and 365".into(),
            ));
        }
        if !(1..=365).contains(&self.max_expire_days) {
            return Err(ShareError::InvalidSettings(
                "max_expire_days must be between 1 and 365".into(),
            ));
        }
        if self.default_expire_days > self.max_expire_days {
            return Err(ShareError::InvalidSettings(
                "default_expire_days cannot exceed max_expire_days".into(),
            ));
        }
        if !(0.1..=168.0).contains(&self.cleanup_interval_hours) {
            return Err(ShareError::InvalidSettings(
                "cleanup_interval_hours must be between 0.1 and 168".into(),
            ));
        }
        Ok(())
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs_f64(self.cleanup_interval_hours * 3600.0)
    }
}

/// An immutable snapshot of everything request handling and the reclaimer
/// read at runtime.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub settings: Settings,
    pub access: AccessPolicy,
    pub expiry: ExpiryPolicy,
    pub reclaim_interval: Duration,
    pub trust_proxy: bool,
}

impl RuntimeConfig {
    pub fn build(
        settings: Settings,
        upload_secret: Option<String>,
        trust_proxy: bool,
    ) -> ShareResult<Self> {
        settings.validate()?;
        let classifier = NetworkClassifier::from_cidrs(&settings.internal_networks)?;
        Ok(Self {
            access: AccessPolicy::new(classifier, settings.allow_external_upload, upload_secret),
            expiry: ExpiryPolicy::new(settings.default_expire_days, settings.max_expire_days),
            reclaim_interval: settings.cleanup_interval(),
            trust_proxy,
            settings,
        })
    }
}

/// Publishes [`RuntimeConfig`] snapshots. Readers clone an `Arc` per
/// operation; writers replace the snapshot wholesale.
#[derive(Clone)]
pub struct ConfigHandle {
    inner: Arc<ConfigInner>,
}

struct ConfigInner {
    tx: watch::Sender<Arc<RuntimeConfig>>,
    settings_path: Option<PathBuf>,
    update_lock: Mutex<()>,
}

impl ConfigHandle {
    /// `settings_path` is where updates are persisted; `None` keeps them in
    /// memory only.
    pub fn new(config: RuntimeConfig, settings_path: Option<PathBuf>) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(config));
        Self {
            inner: Arc::new(ConfigInner {
                tx,
                settings_path,
                update_lock: Mutex::new(()),
            }),
        }
    }

    pub fn snapshot(&self) -> Arc<RuntimeConfig> {
        self.inner.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<RuntimeConfig>> {
        self.inner.tx.subscribe()
    }

    /// Apply `edit` to a copy of the current settings, validate, persist,
    /// then publish. Nothing is published if validation or persistence fails.
    pub async fn update<F>(&self, edit: F) -> ShareResult<Arc<RuntimeConfig>>
    where
        F: FnOnce(&mut Settings),
    {
        let _guard = self.inner.update_lock.lock().await;
        let current = self.snapshot();

        let mut settings = current.settings.clone();
        edit(&mut settings);
        let next = RuntimeConfig::build(
            settings,
            current.access.upload_secret().map(str::to_string),
            current.trust_proxy,
        )?;

        if let Some(path) = &self.inner.settings_path {
            save_settings(path, &next.settings).await?;
        }

        let next = Arc::new(next);
        self.inner.tx.send_replace(next.clone());
        info!(settings = ?next.settings, "runtime settings updated");
        Ok(next)
    }
}

/// Write via a temp file and rename so a crash never leaves half a file.
async fn save_settings(path: &Path, settings: &Settings) -> ShareResult<()> {
    let json = serde_json::to_vec_pretty(settings)?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

fn backend_from_env() -> Result<BackendConfig> {
    let kind = env::var("SHARE_STORE_BACKEND").unwrap_or_else(|_| "local".into());
    match kind.to_ascii_lowercase().as_str() {
        "local" => Ok(BackendConfig::Local),
        "s3" => {
            let required = |name: &str| {
                env::var(name)
                    .ok()
                    .filter(|v| !v.is_empty())
                    .with_context(|| format!("{} is required for the s3 backend", name))
            };
            Ok(BackendConfig::S3(S3Config {
                endpoint: env::var("SHARE_STORE_S3_ENDPOINT").ok(),
                region: env::var("SHARE_STORE_S3_REGION").unwrap_or_else(|_| "us-east-1".into()),
                bucket: required("SHARE_STORE_S3_BUCKET")?,
                access_key: required("SHARE_STORE_S3_ACCESS_KEY")?,
                secret_key: required("SHARE_STORE_S3_SECRET_KEY")?,
                presign_ttl: Duration::from_secs(env_parse(
                    "SHARE_STORE_S3_PRESIGN_SECONDS",
                    900u64,
                )?),
            }))
        }
        other => bail!("unknown SHARE_STORE_BACKEND `{}` (expected local or s3)", other),
    }
}

/// `SHARE_STORE_UPLOAD_TOKEN`, else the first line of
/// `SHARE_STORE_UPLOAD_TOKEN_FILE`.
fn upload_token_from_env() -> Option<String> {
    if let Ok(token) = env::var("SHARE_STORE_UPLOAD_TOKEN") {
        let token = token.trim().to_string();
        if !token.is_empty() {
            return Some(token);
        }
    }

    let path = env::var("SHARE_STORE_UPLOAD_TOKEN_FILE").ok()?;
    match fs::read_to_string(&path) {
        Ok(content) => {
            let token = content.lines().next()?.trim().to_string();
            if token.is_empty() {
                return None;
            }
            info!(
                "Upload token loaded from {} ({}***)",
                path,
                token.chars().take(4).collect::<String>()
            );
            Some(token)
        }
        Err(err) => {
            tracing::warn!("Could not read upload token file {}: {}", path, err);
            None
        }
    }
}
