//! Registry — the SQLite metadata table and the single source of truth for
//! which objects exist.
//!
//! Every mutation is one statement or one transaction, so concurrent callers
//! see a record either fully present or fully absent.

use crate::{
    errors::{ShareError, ShareResult},
    models::{NewObject, StoredObject},
};
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::RngCore;
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};
use std::{collections::HashSet, path::Path, str::FromStr, sync::Arc, time::Duration};
use tracing::{debug, warn};
use uuid::Uuid;

/// Attempts at finding an unused token before giving up.
pub const MAX_TOKEN_ATTEMPTS: usize = 5;

/// Random bytes per token (256 bits).
const TOKEN_BYTES: usize = 32;

/// Produces candidate tokens. Swappable so collisions can be exercised.
pub type TokenSource = Arc<dyn Fn() -> String + Send + Sync>;

/// 32 random bytes from the thread-local CSPRNG, base64url without padding.
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[derive(Clone)]
pub struct Registry {
    /// Shared SQLite connection pool.
    db: Arc<SqlitePool>,
    token_source: TokenSource,
}

impl Registry {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self::with_token_source(db, Arc::new(generate_token))
    }

    pub fn with_token_source(db: Arc<SqlitePool>, token_source: TokenSource) -> Self {
        Self { db, token_source }
    }

    /// Open a pool for a `sqlite://` URL, creating the database file if needed.
    pub async fn connect(database_url: &str) -> ShareResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?;
        // Every connection to `:memory:` is a separate database.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        Self::connect_with(options, max_connections).await
    }

    /// Open a pool for a database file path.
    pub async fn open(path: &Path) -> ShareResult<Self> {
        Self::connect_with(SqliteConnectOptions::new().filename(path), 5).await
    }

    async fn connect_with(options: SqliteConnectOptions, max_connections: u32) -> ShareResult<Self> {
        if let Some(parent) = options.get_filename().parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let options = options
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        Ok(Self::new(Arc::new(pool)))
    }

    /// Apply the embedded migrations. Safe to run on every start.
    pub async fn migrate(&self) -> ShareResult<()> {
        sqlx::migrate!("./migrations").run(&*self.db).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.db
    }

    /// Insert metadata under a freshly issued token.
    ///
    /// A candidate that was ever issued before (even if its object is gone)
    /// is rejected by the `issued_tokens` primary key and another is tried.
    pub async fn create(&self, new: NewObject) -> ShareResult<StoredObject> {
        for attempt in 1..=MAX_TOKEN_ATTEMPTS {
            let token = (self.token_source)();
            match self.insert_with_token(&token, &new).await {
                Ok(object) => {
                    debug!(token = object.short_token(), attempt, "registered object");
                    return Ok(object);
                }
                Err(err) if is_token_collision(&err) => {
                    warn!(attempt, "token collision, drawing a new token");
                }
                Err(err) => return Err(ShareError::Sqlx(err)),
            }
        }
        Err(ShareError::TokenSpaceExhausted(MAX_TOKEN_ATTEMPTS))
    }

    async fn insert_with_token(
        &self,
        token: &str,
        new: &NewObject,
    ) -> Result<StoredObject, sqlx::Error> {
        let mut tx = self.db.begin().await?;

        sqlx::query("INSERT INTO issued_tokens (token, issued_at) VALUES (?, ?)")
            .bind(token)
            .bind(new.created_at)
            .execute(&mut *tx)
            .await?;

        let object = sqlx::query_as::<_, StoredObject>(
            r#"
            INSERT INTO objects (
                id, token, original_name, content_type, storage_key, size_bytes,
                etag, created_at, expires_at, one_time, download_count
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0)
            RETURNING id, token, original_name, content_type, storage_key, size_bytes,
                      etag, created_at, expires_at, one_time, download_count
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(token)
        .bind(&new.original_name)
        .bind(&new.content_type)
        .bind(&new.storage_key)
        .bind(new.size_bytes)
        .bind(&new.etag)
        .bind(new.created_at)
        .bind(new.expires_at)
        .bind(new.one_time)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(object)
    }

    /// Raw row lookup. Expiry is the caller's concern.
    pub async fn lookup(&self, token: &str) -> ShareResult<Option<StoredObject>> {
        let object = sqlx::query_as::<_, StoredObject>(
            "SELECT id, token, original_name, content_type, storage_key, size_bytes,
                    etag, created_at, expires_at, one_time, download_count
             FROM objects WHERE token = ?",
        )
        .bind(token)
        .fetch_optional(&*self.db)
        .await?;
        Ok(object)
    }

    /// Every row, oldest first.
    pub async fn list_all(&self) -> ShareResult<Vec<StoredObject>> {
        let objects = sqlx::query_as::<_, StoredObject>(
            "SELECT id, token, original_name, content_type, storage_key, size_bytes,
                    etag, created_at, expires_at, one_time, download_count
             FROM objects ORDER BY created_at ASC",
        )
        .fetch_all(&*self.db)
        .await?;
        Ok(objects)
    }

    /// Remove a row. Returns false if it was already gone.
    pub async fn delete(&self, token: &str) -> ShareResult<bool> {
        let result = sqlx::query("DELETE FROM objects WHERE token = ?")
            .bind(token)
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Count a download and return the updated row.
    ///
    /// A one-time object can be claimed once: later calls (including a
    /// concurrent second download) return `None`, as does a missing token.
    pub async fn record_download(&self, token: &str) -> ShareResult<Option<StoredObject>> {
        let object = sqlx::query_as::<_, StoredObject>(
            "UPDATE objects SET download_count = download_count + 1
             WHERE token = ? AND (one_time = 0 OR download_count = 0)
             RETURNING id, token, original_name, content_type, storage_key, size_bytes,
                       etag, created_at, expires_at, one_time, download_count",
        )
        .bind(token)
        .fetch_optional(&*self.db)
        .await?;
        Ok(object)
    }

    pub async fn count(&self) -> ShareResult<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM objects")
            .fetch_one(&*self.db)
            .await?;
        Ok(count)
    }

    /// Sum of `size_bytes` over every row.
    pub async fn total_size(&self) -> ShareResult<i64> {
        let total = sqlx::query_scalar::<_, i64>("SELECT COALESCE(SUM(size_bytes), 0) FROM objects")
            .fetch_one(&*self.db)
            .await?;
        Ok(total)
    }

    /// Storage keys referenced by any row.
    pub async fn storage_keys(&self) -> ShareResult<HashSet<String>> {
        let keys = sqlx::query_scalar::<_, String>("SELECT storage_key FROM objects")
            .fetch_all(&*self.db)
            .await?;
        Ok(keys.into_iter().collect())
    }

    /// `SELECT 1` for readiness probes.
    pub async fn ping(&self) -> ShareResult<()> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&*self.db)
            .await?;
        Ok(())
    }
}

/// A candidate token that was issued before.
fn is_token_collision(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err)
            if db_err.is_unique_violation() && db_err.message().contains("token")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};
    use std::{collections::VecDeque, sync::Mutex};
    use tempfile::TempDir;

    async fn registry() -> (Registry, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::open(&dir.path().join("meta.db")).await.unwrap();
        registry.migrate().await.unwrap();
        (registry, dir)
    }

    fn scripted(pool: &Registry, tokens: &[&str]) -> Registry {
        let queue = Mutex::new(tokens.iter().map(|t| t.to_string()).collect::<VecDeque<_>>());
        Registry::with_token_source(
            pool.db.clone(),
            Arc::new(move || {
                queue
                    .lock()
                    .unwrap()
                    .pop_front()
                    .unwrap_or_else(|| "exhausted".to_string())
            }),
        )
    }

    fn new_object(key: &str) -> NewObject {
        let now = Utc::now();
        NewObject {
            original_name: "notes.txt".into(),
            content_type: "text/plain".into(),
            storage_key: key.into(),
            size_bytes: 10,
            etag: Some("abc".into()),
            created_at: now,
            expires_at: Some(now + ChronoDuration::days(1)),
            one_time: false,
        }
    }

    #[tokio::test]
    async fn total_size_sums_every_row() {
        let (registry, _dir) = registry().await;
        assert_eq!(registry.total_size().await.unwrap(), 0);
        registry.create(new_object("k/1")).await.unwrap();
        registry.create(new_object("k/2")).await.unwrap();
        assert_eq!(registry.total_size().await.unwrap(), 20);
    }

    #[test]
    fn generated_tokens_are_url_safe_and_distinct() {
        let a = generate_token();
        let b = generate_token();
        assert_ne!(a, b);
        assert_eq!(a.len(), 43);
        assert!(a.bytes().all(|c| c.is_ascii_alphanumeric() || c == b'-' || c == b'_'));
    }

    #[tokio::test]
    async fn create_then_lookup_returns_the_row() {
        let (registry, _dir) = registry().await;
        let created = registry.create(new_object("k1")).await.unwrap();

        let found = registry.lookup(&created.token).await.unwrap();
        assert_eq!(found.as_ref(), Some(&created));
        assert_eq!(created.download_count, 0);
        assert_eq!(registry.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn delete_reports_whether_a_row_was_removed() {
        let (registry, _dir) = registry().await;
        let created = registry.create(new_object("k1")).await.unwrap();

        assert!(registry.delete(&created.token).await.unwrap());
        assert!(!registry.delete(&created.token).await.unwrap());
        assert!(registry.lookup(&created.token).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn collisions_are_retried_with_fresh_tokens() {
        let (base, _dir) = registry().await;
        let registry = scripted(&base, &["taken", "taken", "fresh"]);

        let first = registry.create(new_object("k1")).await.unwrap();
        assert_eq!(first.token, "taken");
        let second = registry.create(new_object("k2")).await.unwrap();
        assert_eq!(second.token, "fresh");
    }

    #[tokio::test]
    async fn deleted_tokens_are_never_reissued() {
        let (base, _dir) = registry().await;
        let registry = scripted(&base, &["reused"; 1 + MAX_TOKEN_ATTEMPTS]);

        let first = registry.create(new_object("k1")).await.unwrap();
        assert!(registry.delete(&first.token).await.unwrap());

        let err = registry.create(new_object("k2")).await.unwrap_err();
        assert!(matches!(err, ShareError::TokenSpaceExhausted(n) if n == MAX_TOKEN_ATTEMPTS));
        assert_eq!(registry.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn concurrent_creates_produce_distinct_tokens() {
        let (registry, _dir) = registry().await;
        const N: usize = 32;

        let handles: Vec<_> = (0..N)
            .map(|i| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.create(new_object(&format!("key-{i}"))).await })
            })
            .collect();

        let mut tokens = HashSet::new();
        for handle in handles {
            tokens.insert(handle.await.unwrap().unwrap().token);
        }
        assert_eq!(tokens.len(), N);
        assert_eq!(registry.list_all().await.unwrap().len(), N);
    }

    #[tokio::test]
    async fn one_time_objects_can_be_claimed_once() {
        let (registry, _dir) = registry().await;
        let mut once = new_object("k1");
        once.one_time = true;
        let once = registry.create(once).await.unwrap();
        let many = registry.create(new_object("k2")).await.unwrap();

        let claimed = registry.record_download(&once.token).await.unwrap().unwrap();
        assert_eq!(claimed.download_count, 1);
        assert!(registry.record_download(&once.token).await.unwrap().is_none());

        registry.record_download(&many.token).await.unwrap().unwrap();
        let again = registry.record_download(&many.token).await.unwrap().unwrap();
        assert_eq!(again.download_count, 2);

        assert!(registry.record_download("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rows_survive_reopening_the_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.db");
        let token = {
            let registry = Registry::open(&path).await.unwrap();
            registry.migrate().await.unwrap();
            let token = registry.create(new_object("k1")).await.unwrap().token;
            registry.pool().close().await;
            token
        };

        let reopened = Registry::open(&path).await.unwrap();
        reopened.migrate().await.unwrap();
        assert!(reopened.lookup(&token).await.unwrap().is_some());
        assert_eq!(
            reopened.storage_keys().await.unwrap(),
            HashSet::from(["k1".to_string()])
        );
    }
}
