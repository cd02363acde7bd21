//! Reclaimer — removes expired objects (blob first, then metadata).
//!
//! Scans are single-flight: a `run_once` that arrives while a scan is in
//! progress joins it and receives the same report. The background loop,
//! the purge endpoint and the on-demand wake-ups all go through `run_once`,
//! so two scans never overlap.

use crate::{
    config::ConfigHandle,
    errors::{ShareError, ShareResult},
    models::StoredObject,
    services::{
        blob_store::BlobStore,
        expiry::{Clock, ExpiryPolicy},
        registry::Registry,
    },
};
use futures::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use serde::Serialize;
use std::{
    collections::HashSet,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::{
    sync::Notify,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Outcome of one pass over the registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReclaimReport {
    /// Rows examined.
    pub scanned: usize,
    pub removed: usize,
    /// Objects left in place because a delete failed.
    pub errors: usize,
}

/// Outcome of an orphan sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub examined: usize,
    pub removed: usize,
    pub errors: usize,
}

type InFlight = Shared<BoxFuture<'static, Option<ReclaimReport>>>;

#[derive(Clone)]
pub struct Reclaimer {
    inner: Arc<Inner>,
}

struct Inner {
    registry: Registry,
    blobs: Arc<dyn BlobStore>,
    config: ConfigHandle,
    clock: Arc<dyn Clock>,
    /// Held for the whole of a scan, purge or sweep.
    gate: tokio::sync::Mutex<()>,
    in_flight: Mutex<Option<(u64, InFlight)>>,
    next_flight: AtomicU64,
    wake: Notify,
    loop_running: AtomicBool,
    shutdown: CancellationToken,
}

impl Reclaimer {
    pub fn new(
        registry: Registry,
        blobs: Arc<dyn BlobStore>,
        config: ConfigHandle,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                blobs,
                config,
                clock,
                gate: tokio::sync::Mutex::new(()),
                in_flight: Mutex::new(None),
                next_flight: AtomicU64::new(1),
                wake: Notify::new(),
                loop_running: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Run a scan now, or join the one already running.
    ///
    /// The scan itself runs on its own task, so it completes even if every
    /// caller goes away.
    pub async fn run_once(&self) -> ShareResult<ReclaimReport> {
        let flight = {
            let mut slot = self.inner.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            match slot.as_ref() {
                Some((_, flight)) => flight.clone(),
                None => {
                    let id = self.inner.next_flight.fetch_add(1, Ordering::Relaxed);
                    let this = self.clone();
                    let handle = tokio::spawn(async move {
                        let result = this.scan().await;
                        this.finish_flight(id);
                        match result {
                            Ok(report) => Some(report),
                            Err(err) => {
                                error!(error = %err, "reclaim scan failed");
                                None
                            }
                        }
                    });
                    let flight = handle.map(|joined| joined.ok().flatten()).boxed().shared();
                    *slot = Some((id, flight.clone()));
                    flight
                }
            }
        };

        flight.await.ok_or(ShareError::ScanAborted)
    }

    fn finish_flight(&self, id: u64) {
        let mut slot = self.inner.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if matches!(slot.as_ref(), Some((current, _)) if *current == id) {
            *slot = None;
        }
    }

    async fn scan(&self) -> ShareResult<ReclaimReport> {
        let _gate = self.inner.gate.lock().await;
        let objects = self.inner.registry.list_all().await?;
        let now = self.inner.clock.now();

        let mut report = ReclaimReport {
            scanned: objects.len(),
            ..ReclaimReport::default()
        };
        for object in objects.iter().filter(|o| ExpiryPolicy::is_expired(o, now)) {
            if self.inner.shutdown.is_cancelled() {
                info!("shutdown requested, stopping scan early");
                break;
            }
            match self.remove(object).await {
                Ok(true) => report.removed += 1,
                Ok(false) => {}
                Err(_) => report.errors += 1,
            }
        }

        if report.removed > 0 || report.errors > 0 {
            info!(
                scanned = report.scanned,
                removed = report.removed,
                errors = report.errors,
                "reclaim scan finished"
            );
        } else {
            debug!(scanned = report.scanned, "reclaim scan found nothing to remove");
        }
        Ok(report)
    }

    /// Blob first, then the row. A failed blob delete keeps the row so the
    /// next scan retries. Returns false if the row was already gone.
    async fn remove(&self, object: &StoredObject) -> ShareResult<bool> {
        let token = object.short_token();
        if let Err(err) = self.inner.blobs.delete(&object.storage_key).await {
            warn!(token, key = %object.storage_key, error = %err, "failed to delete blob");
            return Err(err);
        }
        match self.inner.registry.delete(&object.token).await {
            Ok(removed) => {
                if removed {
                    info!(token, size_bytes = object.size_bytes, "reclaimed object");
                }
                Ok(removed)
            }
            Err(err) => {
                warn!(token, error = %err, "failed to delete metadata");
                Err(err)
            }
        }
    }

    /// Remove every object regardless of expiry.
    pub async fn purge_all(&self) -> ShareResult<ReclaimReport> {
        let _gate = self.inner.gate.lock().await;
        let objects = self.inner.registry.list_all().await?;

        let mut report = ReclaimReport {
            scanned: objects.len(),
            ..ReclaimReport::default()
        };
        for object in &objects {
            match self.remove(object).await {
                Ok(true) => report.removed += 1,
                Ok(false) => {}
                Err(_) => report.errors += 1,
            }
        }
        warn!(removed = report.removed, errors = report.errors, "purged all objects");
        Ok(report)
    }

    /// Delete blobs no row refers to, once they are older than `grace`.
    ///
    /// The grace period covers uploads whose blob is written but whose row
    /// is not yet committed.
    pub async fn sweep_orphans(&self, grace: Duration) -> ShareResult<SweepReport> {
        let _gate = self.inner.gate.lock().await;
        let referenced: HashSet<String> = self.inner.registry.storage_keys().await?;
        let entries = self.inner.blobs.list().await?;
        let grace = chrono::Duration::from_std(grace)
            .map_err(|_| ShareError::InvalidSettings("orphan grace period out of range".into()))?;
        let cutoff = self.inner.clock.now().checked_sub_signed(grace);

        let mut report = SweepReport {
            examined: entries.len(),
            ..SweepReport::default()
        };
        for entry in entries {
            if referenced.contains(&entry.storage_key) {
                continue;
            }
            if !matches!(cutoff, Some(cutoff) if entry.last_modified <= cutoff) {
                continue;
            }
            match self.inner.blobs.delete(&entry.storage_key).await {
                Ok(()) => {
                    debug!(key = %entry.storage_key, "removed orphaned blob");
                    report.removed += 1;
                }
                Err(err) => {
                    warn!(key = %entry.storage_key, error = %err, "failed to remove orphaned blob");
                    report.errors += 1;
                }
            }
        }
        info!(
            examined = report.examined,
            removed = report.removed,
            errors = report.errors,
            "orphan sweep finished"
        );
        Ok(report)
    }

    /// Objects that are expired but not yet removed.
    pub async fn pending_expired(&self) -> ShareResult<usize> {
        let now = self.inner.clock.now();
        let objects = self.inner.registry.list_all().await?;
        Ok(objects
            .iter()
            .filter(|o| ExpiryPolicy::is_expired(o, now))
            .count())
    }

    /// Ask the background loop for a scan soon. Never waits.
    pub fn request_scan(&self) {
        self.inner.wake.notify_one();
    }

    pub fn is_running(&self) -> bool {
        self.inner.loop_running.load(Ordering::SeqCst)
    }

    /// Stop the loop. A scan in progress stops after its current object.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// Start the background loop. The first scan happens immediately.
    pub fn spawn(&self) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move { this.run_loop().await })
    }

    async fn run_loop(self) {
        self.inner.loop_running.store(true, Ordering::SeqCst);
        let mut config_rx = self.inner.config.subscribe();
        let mut period = clamp_period(config_rx.borrow_and_update().reclaim_interval);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval = ?period, "reclaimer started");

        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
                _ = self.inner.wake.notified() => {
                    debug!("reclaim scan requested");
                }
                changed = config_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let next = clamp_period(config_rx.borrow_and_update().reclaim_interval);
                    if next != period {
                        info!(from = ?period, to = ?next, "reclaim interval changed");
                        period = next;
                        ticker = tokio::time::interval_at(Instant::now() + period, period);
                        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    }
                    continue;
                }
            }

            if let Err(err) = self.run_once().await {
                warn!(error = %err, "scheduled reclaim scan did not complete");
            }
        }

        self.inner.loop_running.store(false, Ordering::SeqCst);
        info!("reclaimer stopped");
    }
}

fn clamp_period(period: Duration) -> Duration {
    period.max(Duration::from_secs(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{RuntimeConfig, Settings},
        models::NewObject,
        services::{
            blob_store::{
                BlobEntry, BlobMeta, BlobSource, ByteStream, LocalBlobStore, PutOutcome,
                ResolveOptions,
            },
            expiry::ManualClock,
        },
    };
    use async_trait::async_trait;
    use bytes::Bytes;
    use chrono::{Duration as ChronoDuration, Utc};
    use futures::{StreamExt, stream};
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    struct Fixture {
        registry: Registry,
        blobs: Arc<LocalBlobStore>,
        clock: Arc<ManualClock>,
        config: ConfigHandle,
        _dir: TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::open(&dir.path().join("meta.db")).await.unwrap();
        registry.migrate().await.unwrap();
        let config = ConfigHandle::new(
            RuntimeConfig::build(Settings::default(), None, false).unwrap(),
            None,
        );
        Fixture {
            registry,
            blobs: Arc::new(LocalBlobStore::new(dir.path().join("blobs"))),
            clock: Arc::new(ManualClock::new(Utc::now())),
            config,
            _dir: dir,
        }
    }

    impl Fixture {
        fn reclaimer_with(&self, blobs: Arc<dyn BlobStore>) -> Reclaimer {
            Reclaimer::new(self.registry.clone(), blobs, self.config.clone(), self.clock.clone())
        }

        fn reclaimer(&self) -> Reclaimer {
            self.reclaimer_with(self.blobs.clone())
        }

        async fn store(&self, days: i64) -> StoredObject {
            let body = stream::iter(vec![Ok(Bytes::from_static(b"payload"))]).boxed();
            let meta = BlobMeta {
                original_name: "a.txt",
                content_type: "text/plain",
            };
            let out = self.blobs.put(body, &meta).await.unwrap();
            let now = self.clock.now();
            self.registry
                .create(NewObject {
                    original_name: "a.txt".into(),
                    content_type: "text/plain".into(),
                    storage_key: out.storage_key,
                    size_bytes: out.size_bytes,
                    etag: Some(out.etag),
                    created_at: now,
                    expires_at: Some(now + ChronoDuration::days(days)),
                    one_time: false,
                })
                .await
                .unwrap()
        }
    }

    /// Delegates to a local store; optionally fails deletes and counts them.
    struct Flaky {
        inner: Arc<LocalBlobStore>,
        fail_key: Option<String>,
        deletes: AtomicUsize,
    }

    #[async_trait]
    impl BlobStore for Flaky {
        fn name(&self) -> &'static str {
            "flaky"
        }
        async fn put(&self, body: ByteStream<'_>, meta: &BlobMeta<'_>) -> ShareResult<PutOutcome> {
            self.inner.put(body, meta).await
        }
        async fn resolve(&self, key: &str, opts: ResolveOptions) -> ShareResult<BlobSource> {
            self.inner.resolve(key, opts).await
        }
        async fn delete(&self, key: &str) -> ShareResult<()> {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            if self.fail_key.as_deref() == Some(key) {
                return Err(ShareError::Io(std::io::Error::other("disk unplugged")));
            }
            self.inner.delete(key).await
        }
        async fn list(&self) -> ShareResult<Vec<BlobEntry>> {
            self.inner.list().await
        }
        async fn probe(&self) -> ShareResult<()> {
            Ok(())
        }
    }

    /// Holds the `pause_at`-th delete until released.
    struct Slow {
        inner: Arc<LocalBlobStore>,
        pause_at: usize,
        deletes: AtomicUsize,
        reached: Notify,
        release: Notify,
    }

    #[async_trait]
    impl BlobStore for Slow {
        fn name(&self) -> &'static str {
            "slow"
        }
        async fn put(&self, body: ByteStream<'_>, meta: &BlobMeta<'_>) -> ShareResult<PutOutcome> {
            self.inner.put(body, meta).await
        }
        async fn resolve(&self, key: &str, opts: ResolveOptions) -> ShareResult<BlobSource> {
            self.inner.resolve(key, opts).await
        }
        async fn delete(&self, key: &str) -> ShareResult<()> {
            let n = self.deletes.fetch_add(1, Ordering::SeqCst) + 1;
            if n == self.pause_at {
                self.reached.notify_one();
                self.release.notified().await;
            }
            self.inner.delete(key).await
        }
        async fn list(&self) -> ShareResult<Vec<BlobEntry>> {
            self.inner.list().await
        }
        async fn probe(&self) -> ShareResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn run_once_removes_only_expired_objects() {
        let fx = fixture().await;
        let short = fx.store(1).await;
        let long = fx.store(5).await;
        fx.clock.advance(ChronoDuration::hours(25));

        let report = fx.reclaimer().run_once().await.unwrap();
        assert_eq!(report, ReclaimReport { scanned: 2, removed: 1, errors: 0 });
        assert!(fx.registry.lookup(&short.token).await.unwrap().is_none());
        assert!(fx.registry.lookup(&long.token).await.unwrap().is_some());

        let keys: Vec<_> = fx.blobs.list().await.unwrap().into_iter().map(|e| e.storage_key).collect();
        assert_eq!(keys, vec![long.storage_key]);
    }

    #[tokio::test]
    async fn second_run_has_nothing_to_remove() {
        let fx = fixture().await;
        fx.store(1).await;
        fx.clock.advance(ChronoDuration::days(2));
        let reclaimer = fx.reclaimer();

        assert_eq!(reclaimer.run_once().await.unwrap().removed, 1);
        assert_eq!(
            reclaimer.run_once().await.unwrap(),
            ReclaimReport { scanned: 0, removed: 0, errors: 0 }
        );
    }

    #[tokio::test]
    async fn failed_blob_delete_is_counted_and_row_kept() {
        let fx = fixture().await;
        let stuck = fx.store(1).await;
        let fine = fx.store(1).await;
        fx.clock.advance(ChronoDuration::days(2));

        let flaky = Arc::new(Flaky {
            inner: fx.blobs.clone(),
            fail_key: Some(stuck.storage_key.clone()),
            deletes: AtomicUsize::new(0),
        });
        let report = fx.reclaimer_with(flaky).run_once().await.unwrap();

        assert_eq!(report, ReclaimReport { scanned: 2, removed: 1, errors: 1 });
        assert!(fx.registry.lookup(&stuck.token).await.unwrap().is_some());
        assert!(fx.registry.lookup(&fine.token).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn concurrent_runs_share_a_single_scan() {
        let fx = fixture().await;
        fx.store(1).await;
        fx.clock.advance(ChronoDuration::days(2));
        let flaky = Arc::new(Flaky {
            inner: fx.blobs.clone(),
            fail_key: None,
            deletes: AtomicUsize::new(0),
        });
        let reclaimer = fx.reclaimer_with(flaky.clone());

        let (a, b) = tokio::join!(reclaimer.run_once(), reclaimer.run_once());
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(flaky.deletes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn purge_all_ignores_expiry() {
        let fx = fixture().await;
        fx.store(1).await;
        fx.store(30).await;

        let report = fx.reclaimer().purge_all().await.unwrap();
        assert_eq!(report.removed, 2);
        assert_eq!(fx.registry.count().await.unwrap(), 0);
        assert!(fx.blobs.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sweep_removes_only_old_unreferenced_blobs() {
        let fx = fixture().await;
        let kept = fx.store(1).await;
        let body = stream::iter(vec![Ok(Bytes::from_static(b"stray"))]).boxed();
        let meta = BlobMeta {
            original_name: "stray",
            content_type: "text/plain",
        };
        fx.blobs.put(body, &meta).await.unwrap();
        let reclaimer = fx.reclaimer();

        let fresh = reclaimer.sweep_orphans(Duration::from_secs(3600)).await.unwrap();
        assert_eq!(fresh.removed, 0);

        fx.clock.advance(ChronoDuration::hours(2));
        let report = reclaimer.sweep_orphans(Duration::from_secs(3600)).await.unwrap();
        assert_eq!(report, SweepReport { examined: 2, removed: 1, errors: 0 });
        let keys: Vec<_> = fx.blobs.list().await.unwrap().into_iter().map(|e| e.storage_key).collect();
        assert_eq!(keys, vec![kept.storage_key]);
    }

    #[tokio::test]
    async fn loop_scans_on_start_and_stops_on_shutdown() {
        let fx = fixture().await;
        let expired = fx.store(1).await;
        fx.clock.advance(ChronoDuration::days(2));
        let reclaimer = fx.reclaimer();

        let handle = reclaimer.spawn();
        for _ in 0..100 {
            if fx.registry.lookup(&expired.token).await.unwrap().is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(fx.registry.lookup(&expired.token).await.unwrap().is_none());
        assert!(reclaimer.is_running());

        reclaimer.shutdown();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(!reclaimer.is_running());
    }

    #[tokio::test]
    async fn shutdown_mid_scan_finishes_the_current_object_then_stops() {
        let fx = fixture().await;
        for _ in 0..4 {
            fx.store(1).await;
        }
        fx.clock.advance(ChronoDuration::days(2));
        let slow = Arc::new(Slow {
            inner: fx.blobs.clone(),
            pause_at: 2,
            deletes: AtomicUsize::new(0),
            reached: Notify::new(),
            release: Notify::new(),
        });
        let reclaimer = fx.reclaimer_with(slow.clone());

        let scan = tokio::spawn({
            let reclaimer = reclaimer.clone();
            async move { reclaimer.run_once().await }
        });
        slow.reached.notified().await;
        reclaimer.shutdown();
        slow.release.notify_one();

        let report = tokio::time::timeout(Duration::from_secs(5), scan)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(report, ReclaimReport { scanned: 4, removed: 2, errors: 0 });
        assert_eq!(slow.deletes.load(Ordering::SeqCst), 2);

        let rows = fx.registry.storage_keys().await.unwrap();
        let blobs: HashSet<String> = fx
            .blobs
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.storage_key)
            .collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(blobs, rows);
    }

    #[tokio::test]
    async fn pending_expired_counts_unreclaimed_objects() {
        let fx = fixture().await;
        fx.store(1).await;
        fx.store(3).await;
        let reclaimer = fx.reclaimer();
        assert_eq!(reclaimer.pending_expired().await.unwrap(), 0);

        fx.clock.advance(ChronoDuration::days(2));
        assert_eq!(reclaimer.pending_expired().await.unwrap(), 1);
    }
}
