//! Tracks at most one collection worker per target key.
//!
//! Start and stop for a key run under that key's async lock, so two requests
//! for the same key never interleave; different keys proceed independently.
//! The worker map itself is only held for short synchronous sections.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use danmu_common::{LifecycleEvent, MonitorStatus, StopReason, WorkerInfo};
use tokio::sync::broadcast;
use tokio::task::AbortHandle;

use crate::collector::{Collector, CollectorError, WorkerHandle};
use crate::config::Config;

struct WorkerEntry {
    handle: Box<dyn WorkerHandle>,
    generation: u64,
    started_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    expiry: AbortHandle,
}

struct Inner {
    collector: Arc<dyn Collector>,
    workers: Mutex<HashMap<String, WorkerEntry>>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    generation: AtomicU64,
    events: broadcast::Sender<LifecycleEvent>,
}

#[derive(Clone)]
pub struct WorkerManager {
    inner: Arc<Inner>,
}

impl WorkerManager {
    pub fn new(collector: Arc<dyn Collector>, events: broadcast::Sender<LifecycleEvent>) -> Self {
        Self {
            inner: Arc::new(Inner {
                collector,
                workers: Mutex::new(HashMap::new()),
                locks: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
                events,
            }),
        }
    }

    fn key_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.inner
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.to_string())
            .or_default()
            .clone()
    }

    /// Forget the lock for `key` once no worker runs under it and nobody but
    /// the caller, who still holds `held`, refers to it.
    fn release_lock(&self, key: &str, held: &Arc<tokio::sync::Mutex<()>>) {
        if self.workers().contains_key(key) {
            return;
        }
        let mut locks = self
            .inner
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if locks
            .get(key)
            .is_some_and(|l| Arc::ptr_eq(l, held) && Arc::strong_count(held) == 2)
        {
            locks.remove(key);
        }
    }

    fn workers(&self) -> std::sync::MutexGuard<'_, HashMap<String, WorkerEntry>> {
        self.inner
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: LifecycleEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    /// Start a worker for `key` unless a live one exists. A worker that has
    /// died on its own is replaced.
    pub async fn ensure(&self, key: &str, config: &Config) -> Result<MonitorStatus, CollectorError> {
        let lock = self.key_lock(key);
        let _guard = lock.lock().await;

        let dead = {
            let mut workers = self.workers();
            match workers.get_mut(key).map(|e| e.handle.is_alive()) {
                Some(true) => return Ok(MonitorStatus::AlreadyRunning),
                Some(false) => workers.remove(key),
                None => None,
            }
        };
        if let Some(entry) = dead {
            tracing::warn!(key, worker = %entry.handle.describe(), "worker exited on its own, restarting");
            entry.expiry.abort();
        }

        if let Err(e) = self.spawn(key, config).await {
            self.release_lock(key, &lock);
            return Err(e);
        }
        Ok(MonitorStatus::Started)
    }

    /// Stop any existing worker for `key`, then start a fresh one.
    pub async fn restart(&self, key: &str, config: &Config) -> Result<(), CollectorError> {
        let lock = self.key_lock(key);
        let _guard = lock.lock().await;

        self.stop_locked(key, StopReason::Replaced, config.collection.stop_grace())
            .await;
        self.spawn(key, config).await
    }

    /// Returns false when no worker was running for `key`.
    pub async fn stop(&self, key: &str, reason: StopReason, grace: Duration) -> bool {
        let lock = self.key_lock(key);
        let _guard = lock.lock().await;
        let stopped = self.stop_locked(key, reason, grace).await;
        self.release_lock(key, &lock);
        stopped
    }

    pub async fn stop_all(&self, reason: StopReason, grace: Duration) -> usize {
        let keys = self.active_keys();
        let stopped = futures::future::join_all(keys.iter().map(|k| self.stop(k, reason, grace))).await;
        stopped.into_iter().filter(|s| *s).count()
    }

    /// Make the running set equal `desired`: stop the extras, ensure the rest.
    /// A key whose worker cannot be spawned is skipped.
    pub async fn reconcile(&self, desired: &BTreeSet<String>, config: &Config) {
        let grace = config.collection.stop_grace();
        let unwanted: Vec<String> = self
            .active_keys()
            .into_iter()
            .filter(|k| !desired.contains(k))
            .collect();

        futures::future::join_all(unwanted.iter().map(|k| self.stop(k, StopReason::Requested, grace))).await;

        let results = futures::future::join_all(desired.iter().map(|k| self.ensure(k, config))).await;
        for (key, result) in desired.iter().zip(results) {
            if let Err(e) = result {
                tracing::error!(key = %key, error = %e, "skipping target, worker did not start");
            }
        }
    }

    /// Restart every worker in `keys` under `config`.
    pub async fn restart_all(&self, keys: &BTreeSet<String>, config: &Config) {
        let results = futures::future::join_all(keys.iter().map(|k| self.restart(k, config))).await;
        for (key, result) in keys.iter().zip(results) {
            if let Err(e) = result {
                tracing::error!(key = %key, error = %e, "worker did not restart");
            }
        }
    }

    pub fn active_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.workers().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn snapshot(&self) -> Vec<WorkerInfo> {
        let mut workers = self.workers();
        let mut infos: Vec<WorkerInfo> = workers
            .iter_mut()
            .map(|(key, entry)| WorkerInfo {
                key: key.clone(),
                handle: entry.handle.describe(),
                started_at: entry.started_at,
                expires_at: entry.expires_at,
                alive: entry.handle.is_alive(),
            })
            .collect();
        infos.sort_by(|a, b| a.key.cmp(&b.key));
        infos
    }

    async fn spawn(&self, key: &str, config: &Config) -> Result<(), CollectorError> {
        let handle = match self.inner.collector.start(key, config).await {
            Ok(h) => h,
            Err(e) => {
                tracing::error!(key, error = %e, "failed to start worker");
                self.emit(LifecycleEvent::worker_failed(key, e.to_string()));
                return Err(e);
            }
        };

        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let max_runtime = config.collection.max_runtime();
        let grace = config.collection.stop_grace();
        let started_at = Utc::now();
        let expires_at = chrono::Duration::from_std(max_runtime)
            .ok()
            .and_then(|d| started_at.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let expiry = {
            let manager = Arc::downgrade(&self.inner);
            let key = key.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(max_runtime).await;
                if let Some(inner) = Weak::upgrade(&manager) {
                    WorkerManager { inner }.expire(&key, generation, grace).await;
                }
            })
            .abort_handle()
        };

        tracing::info!(key, worker = %handle.describe(), generation, %expires_at, "worker started");
        self.emit(LifecycleEvent::worker_started(key, handle.describe(), expires_at));
        self.workers().insert(
            key.to_string(),
            WorkerEntry {
                handle,
                generation,
                started_at,
                expires_at,
                expiry,
            },
        );
        Ok(())
    }

    async fn stop_locked(&self, key: &str, reason: StopReason, grace: Duration) -> bool {
        let removed = self.workers().remove(key);
        let Some(mut entry) = removed else {
            return false;
        };
        entry.expiry.abort();

        tracing::info!(key, worker = %entry.handle.describe(), ?reason, "stopping worker");
        entry.handle.stop(grace).await;
        self.emit(LifecycleEvent::worker_stopped(key, reason));
        true
    }

    /// Called by a worker's own expiry timer; a newer generation for the same
    /// key is left alone.
    async fn expire(&self, key: &str, generation: u64, grace: Duration) {
        let lock = self.key_lock(key);
        let _guard = lock.lock().await;

        let entry = {
            let mut workers = self.workers();
            match workers.get(key) {
                Some(e) if e.generation == generation => workers.remove(key),
                _ => None,
            }
        };
        let Some(mut entry) = entry else {
            tracing::debug!(key, generation, "stale expiry timer ignored");
            return;
        };

        tracing::info!(key, worker = %entry.handle.describe(), "worker reached max runtime");
        entry.handle.stop(grace).await;
        self.emit(LifecycleEvent::worker_stopped(key, StopReason::Expired));
        self.release_lock(key, &lock);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;

    /// In-memory collector that records every start and stop.
    #[derive(Default)]
    pub(crate) struct FakeCollector {
        pub starts: Mutex<Vec<String>>,
        pub alive: Mutex<HashMap<String, Arc<AtomicBool>>>,
        pub stops: Arc<Mutex<Vec<String>>>,
        pub fail_keys: Mutex<Vec<String>>,
        pub delay: Duration,
    }

    impl FakeCollector {
        pub fn starts(&self) -> Vec<String> {
            self.starts.lock().unwrap().clone()
        }

        pub fn stops(&self) -> Vec<String> {
            self.stops.lock().unwrap().clone()
        }

        /// Simulate the latest worker for `key` exiting on its own.
        pub fn crash(&self, key: &str) {
            if let Some(flag) = self.alive.lock().unwrap().get(key) {
                flag.store(false, Ordering::SeqCst);
            }
        }
    }

    pub(crate) struct FakeHandle {
        key: String,
        alive: Arc<AtomicBool>,
        stops: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl WorkerHandle for FakeHandle {
        fn describe(&self) -> String {
            format!("fake {}", self.key)
        }

        fn is_alive(&mut self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        async fn stop(&mut self, _grace: Duration) {
            self.alive.store(false, Ordering::SeqCst);
            self.stops.lock().unwrap().push(self.key.clone());
        }
    }

    #[async_trait]
    impl Collector for FakeCollector {
        async fn start(
            &self,
            key: &str,
            _config: &Config,
        ) -> Result<Box<dyn WorkerHandle>, CollectorError> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail_keys.lock().unwrap().iter().any(|k| k == key) {
                return Err(CollectorError::Spawn {
                    key: key.to_string(),
                    source: std::io::Error::new(std::io::ErrorKind::Other, "no processes left"),
                });
            }
            self.starts.lock().unwrap().push(key.to_string());
            let alive = Arc::new(AtomicBool::new(true));
            self.alive
                .lock()
                .unwrap()
                .insert(key.to_string(), alive.clone());
            Ok(Box::new(FakeHandle {
                key: key.to_string(),
                alive,
                stops: self.stops.clone(),
            }))
        }
    }

    fn manager(collector: Arc<FakeCollector>) -> (WorkerManager, broadcast::Receiver<LifecycleEvent>) {
        let (tx, rx) = broadcast::channel(64);
        (WorkerManager::new(collector, tx), rx)
    }

    fn keys(ks: &[&str]) -> BTreeSet<String> {
        ks.iter().map(|k| k.to_string()).collect()
    }

    #[tokio::test]
    async fn concurrent_ensure_starts_exactly_one() {
        let collector = Arc::new(FakeCollector {
            delay: Duration::from_millis(20),
            ..Default::default()
        });
        let (workers, _events) = manager(collector.clone());
        let config = Config::default();

        let (a, b) = tokio::join!(workers.ensure("4990", &config), workers.ensure("4990", &config));
        let mut outcomes = vec![a.unwrap(), b.unwrap()];
        outcomes.sort_by_key(|s| format!("{s:?}"));

        assert_eq!(outcomes, [MonitorStatus::AlreadyRunning, MonitorStatus::Started]);
        assert_eq!(collector.starts(), ["4990"]);
        assert_eq!(workers.active_keys(), ["4990"]);
    }

    #[tokio::test]
    async fn restart_stops_before_starting() {
        let collector = Arc::new(FakeCollector::default());
        let (workers, _events) = manager(collector.clone());
        let config = Config::default();

        workers.ensure("1", &config).await.unwrap();
        workers.restart("1", &config).await.unwrap();

        assert_eq!(collector.starts(), ["1", "1"]);
        assert_eq!(collector.stops(), ["1"]);
        assert_eq!(workers.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn key_locks_are_dropped_with_their_workers() {
        let collector = Arc::new(FakeCollector::default());
        collector.fail_keys.lock().unwrap().push("bad".to_string());
        let (workers, _events) = manager(collector.clone());
        let config = Config::default();
        let lock_count = || workers.inner.locks.lock().unwrap().len();

        for key in ["1", "2", "3"] {
            workers.ensure(key, &config).await.unwrap();
        }
        assert!(workers.ensure("bad", &config).await.is_err());
        assert_eq!(lock_count(), 3);

        workers.stop("2", StopReason::Requested, Duration::ZERO).await;
        assert!(!workers.stop("missing", StopReason::Requested, Duration::ZERO).await);
        assert_eq!(lock_count(), 2);

        workers.stop_all(StopReason::Idle, Duration::ZERO).await;
        assert_eq!(lock_count(), 0);

        workers.ensure("1", &config).await.unwrap();
        assert_eq!(workers.active_keys(), ["1"]);
    }

    #[tokio::test]
    async fn dead_worker_is_replaced() {
        let collector = Arc::new(FakeCollector::default());
        let (workers, _events) = manager(collector.clone());
        let config = Config::default();

        workers.ensure("1", &config).await.unwrap();
        collector.crash("1");
        assert!(!workers.snapshot()[0].alive);

        assert_eq!(workers.ensure("1", &config).await.unwrap(), MonitorStatus::Started);
        assert_eq!(collector.starts(), ["1", "1"]);
        assert!(workers.snapshot()[0].alive);
    }

    #[tokio::test]
    async fn reconcile_starts_missing_and_stops_unwanted() {
        let collector = Arc::new(FakeCollector::default());
        let (workers, _events) = manager(collector.clone());
        let config = Config::default();

        workers.reconcile(&keys(&["a", "b"]), &config).await;
        assert_eq!(workers.active_keys(), ["a", "b"]);

        workers.reconcile(&keys(&["b", "c"]), &config).await;
        assert_eq!(workers.active_keys(), ["b", "c"]);
        assert_eq!(collector.stops(), ["a"]);

        let mut started = collector.starts();
        started.sort();
        assert_eq!(started, ["a", "b", "c"]);
    }

    #[tokio::test]
    async fn spawn_failure_skips_only_that_key() {
        let collector = Arc::new(FakeCollector::default());
        collector.fail_keys.lock().unwrap().push("bad".to_string());
        let (workers, mut events) = manager(collector.clone());

        workers
            .reconcile(&keys(&["bad", "good"]), &Config::default())
            .await;
        assert_eq!(workers.active_keys(), ["good"]);

        let mut failed = false;
        while let Ok(event) = events.try_recv() {
            failed |= matches!(event, LifecycleEvent::WorkerFailed { ref key, .. } if key == "bad");
        }
        assert!(failed);
    }

    #[tokio::test]
    async fn stop_all_empties_the_map() {
        let collector = Arc::new(FakeCollector::default());
        let (workers, _events) = manager(collector.clone());
        let config = Config::default();
        workers.reconcile(&keys(&["a", "b", "c"]), &config).await;

        let n = workers.stop_all(StopReason::Idle, Duration::from_millis(10)).await;
        assert_eq!(n, 3);
        assert!(workers.active_keys().is_empty());
        assert!(!workers.stop("a", StopReason::Requested, Duration::ZERO).await);
    }

    #[tokio::test(start_paused = true)]
    async fn worker_expires_after_max_runtime() {
        let collector = Arc::new(FakeCollector::default());
        let (workers, mut events) = manager(collector.clone());
        let mut config = Config::default();
        config.collection.max_runtime_secs = 60;

        workers.ensure("1", &config).await.unwrap();
        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(workers.active_keys(), ["1"]);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(workers.active_keys().is_empty());
        assert_eq!(collector.stops(), ["1"]);

        let mut expired = false;
        while let Ok(event) = events.try_recv() {
            expired |= matches!(
                event,
                LifecycleEvent::WorkerStopped { reason: StopReason::Expired, .. }
            );
        }
        assert!(expired);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_timer_leaves_newer_worker_alone() {
        let collector = Arc::new(FakeCollector::default());
        let (workers, _events) = manager(collector.clone());
        let mut config = Config::default();
        config.collection.max_runtime_secs = 60;

        workers.ensure("1", &config).await.unwrap();
        let first = workers.workers().get("1").unwrap().generation;

        tokio::time::sleep(Duration::from_secs(30)).await;
        workers.restart("1", &config).await.unwrap();

        // The first timer would have fired here; it was cancelled and its
        // generation no longer matches anyway.
        workers.expire("1", first, Duration::ZERO).await;
        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(workers.active_keys(), ["1"]);
        assert_eq!(collector.stops(), ["1"]);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(workers.active_keys().is_empty());
    }
}
