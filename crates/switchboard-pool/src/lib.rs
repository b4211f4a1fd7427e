//! Tiered resource pool for expensive speech-service connections.
//!
//! Acquisition walks three tiers: a resource already pinned to the session
//! (dedicated), a pre-allocated idle resource (warm), or a fresh factory
//! call bounded by a timeout (cold). A single background task keeps the
//! warm queue at its target level and evicts resources that have sat idle
//! past their maximum age. The factory is never called while the pool
//! lock is held.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use switchboard_core::config::PoolSettings;
use switchboard_core::error::{Result, SwitchboardError};

/// Which allocation path satisfied an acquire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Resource was already pinned to the requesting session.
    Dedicated,
    /// Resource came from the pre-allocated warm queue.
    Warm,
    /// Resource was created on demand by the factory.
    Cold,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Dedicated => write!(f, "dedicated"),
            Tier::Warm => write!(f, "warm"),
            Tier::Cold => write!(f, "cold"),
        }
    }
}

/// Creates and tears down pooled resources.
///
/// `create` is always invoked outside the pool lock, so a slow provider
/// handshake never blocks other sessions' acquires.
#[async_trait]
pub trait ResourceFactory<T>: Send + Sync {
    async fn create(&self) -> anyhow::Result<T>;

    /// Tear down a resource that is leaving the pool. The default is a
    /// plain drop, which suits stateless HTTP clients.
    async fn close(&self, _resource: &T) {}
}

/// A resource handed out to a session.
///
/// Derefs to the underlying resource. The same `Arc` is returned on every
/// repeat acquire for the owning session, so callers may hold several
/// handles without duplicating the connection behind them.
pub struct PoolResource<T> {
    resource: Arc<T>,
    pub tier: Tier,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub owner_session_id: String,
}

impl<T> PoolResource<T> {
    pub fn get(&self) -> &T {
        &self.resource
    }

    /// Owned reference to the underlying resource, for moving into a
    /// spawned task while the handle stays with its owner.
    pub fn inner(&self) -> Arc<T> {
        Arc::clone(&self.resource)
    }

    /// Whether two handles point at the same underlying resource.
    pub fn same_instance(&self, other: &PoolResource<T>) -> bool {
        Arc::ptr_eq(&self.resource, &other.resource)
    }
}

impl<T> Deref for PoolResource<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.resource
    }
}

impl<T> fmt::Debug for PoolResource<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolResource")
            .field("tier", &self.tier)
            .field("created_at", &self.created_at)
            .field("owner_session_id", &self.owner_session_id)
            .finish_non_exhaustive()
    }
}

/// Point-in-time pool counters.
///
/// `dedicated_hits`, `warm_hits` and `cold_creates` are cumulative since
/// the pool was built, so warm hit rate can be derived across any window
/// by diffing two snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolMetrics {
    pub warm_level: usize,
    pub dedicated_count: usize,
    pub dedicated_hits: u64,
    pub warm_hits: u64,
    pub cold_creates: u64,
}

impl PoolMetrics {
    pub fn total_acquires(&self) -> u64 {
        self.dedicated_hits + self.warm_hits + self.cold_creates
    }

    /// Fraction of non-dedicated acquires served without a cold create.
    pub fn warm_hit_rate(&self) -> f64 {
        let fresh = self.warm_hits + self.cold_creates;
        if fresh == 0 {
            return 1.0;
        }
        self.warm_hits as f64 / fresh as f64
    }
}

struct PoolEntry<T> {
    resource: Arc<T>,
    created_at: DateTime<Utc>,
    last_used_at: DateTime<Utc>,
}

impl<T> PoolEntry<T> {
    fn new(resource: T) -> Self {
        let now = Utc::now();
        Self {
            resource: Arc::new(resource),
            created_at: now,
            last_used_at: now,
        }
    }

    fn idle_longer_than(&self, max_age: Duration, now: DateTime<Utc>) -> bool {
        (now - self.last_used_at)
            .to_std()
            .map(|idle| idle > max_age)
            .unwrap_or(false)
    }
}

struct Inner<T> {
    warm: VecDeque<PoolEntry<T>>,
    dedicated: HashMap<String, PoolEntry<T>>,
    dedicated_hits: u64,
    warm_hits: u64,
    cold_creates: u64,
}

/// Generic tiered pool. One instance per resource kind (e.g. one for
/// recognizers, one for synthesizers).
pub struct ResourcePool<T> {
    kind: String,
    settings: PoolSettings,
    target_warm: AtomicUsize,
    factory: Arc<dyn ResourceFactory<T>>,
    inner: Mutex<Inner<T>>,
}

impl<T: Send + Sync + 'static> ResourcePool<T> {
    pub fn new(
        kind: impl Into<String>,
        settings: PoolSettings,
        factory: Arc<dyn ResourceFactory<T>>,
    ) -> Arc<Self> {
        let target = settings.target_warm;
        Arc::new(Self {
            kind: kind.into(),
            settings,
            target_warm: AtomicUsize::new(target),
            factory,
            inner: Mutex::new(Inner {
                warm: VecDeque::new(),
                dedicated: HashMap::new(),
                dedicated_hits: 0,
                warm_hits: 0,
                cold_creates: 0,
            }),
        })
    }

    /// Begin filling the warm queue up to `target` instances. Returns
    /// immediately; creation happens on a spawned task and failures are
    /// logged and retried on the next maintenance cycle.
    pub fn prepare(self: &Arc<Self>, target: usize) {
        self.target_warm.store(target, Ordering::Relaxed);
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            pool.top_up().await;
        });
    }

    /// Acquire a resource for `session_id`, walking dedicated, warm, then
    /// cold. The cold path is bounded by `timeout`; expiry maps to
    /// [`SwitchboardError::PoolExhausted`].
    pub async fn acquire_for_session(
        &self,
        session_id: &str,
        timeout: Duration,
    ) -> Result<PoolResource<T>> {
        {
            let mut inner = self.inner.lock().await;
            if let Some(entry) = inner.dedicated.get_mut(session_id) {
                entry.last_used_at = Utc::now();
                let handle = PoolResource {
                    resource: Arc::clone(&entry.resource),
                    tier: Tier::Dedicated,
                    created_at: entry.created_at,
                    last_used_at: entry.last_used_at,
                    owner_session_id: session_id.to_string(),
                };
                inner.dedicated_hits += 1;
                debug!(pool = %self.kind, session = %session_id, "Reusing dedicated resource");
                return Ok(handle);
            }
            if let Some(mut entry) = inner.warm.pop_front() {
                entry.last_used_at = Utc::now();
                let handle = PoolResource {
                    resource: Arc::clone(&entry.resource),
                    tier: Tier::Warm,
                    created_at: entry.created_at,
                    last_used_at: entry.last_used_at,
                    owner_session_id: session_id.to_string(),
                };
                inner.warm_hits += 1;
                inner.dedicated.insert(session_id.to_string(), entry);
                debug!(pool = %self.kind, session = %session_id, "Assigned warm resource");
                return Ok(handle);
            }
        }

        // Cold path: the lock is released, so concurrent sessions can
        // still reach the warm queue while this factory call is in flight.
        let created = tokio::time::timeout(timeout, self.factory.create())
            .await
            .map_err(|_| SwitchboardError::PoolExhausted {
                kind: self.kind.clone(),
                waited: timeout,
            })?
            .map_err(|e| SwitchboardError::UpstreamServiceError {
                service: self.kind.clone(),
                message: e.to_string(),
            })?;

        let entry = PoolEntry::new(created);
        let handle = PoolResource {
            resource: Arc::clone(&entry.resource),
            tier: Tier::Cold,
            created_at: entry.created_at,
            last_used_at: entry.last_used_at,
            owner_session_id: session_id.to_string(),
        };
        let mut inner = self.inner.lock().await;
        inner.cold_creates += 1;
        inner.dedicated.insert(session_id.to_string(), entry);
        debug!(pool = %self.kind, session = %session_id, "Created cold resource");
        Ok(handle)
    }

    /// Return the session's pinned resource to the pool: back onto the
    /// warm queue when it is fresh and the queue is under target,
    /// otherwise closed and discarded. No-op for unknown sessions.
    pub async fn release_for_session(&self, session_id: &str) {
        let target = self.target_warm.load(Ordering::Relaxed);
        let discarded = {
            let mut inner = self.inner.lock().await;
            let Some(mut entry) = inner.dedicated.remove(session_id) else {
                return;
            };
            let now = Utc::now();
            let stale = (now - entry.created_at)
                .to_std()
                .map(|age| age > self.settings.max_age())
                .unwrap_or(false);
            if !stale && inner.warm.len() < target {
                entry.last_used_at = now;
                inner.warm.push_back(entry);
                debug!(pool = %self.kind, session = %session_id, "Released resource to warm queue");
                return;
            }
            entry
        };
        self.discard(discarded).await;
        debug!(pool = %self.kind, session = %session_id, "Released and discarded resource");
    }

    /// Warm level, dedicated count, and cumulative per-tier counters.
    pub async fn snapshot(&self) -> PoolMetrics {
        let inner = self.inner.lock().await;
        PoolMetrics {
            warm_level: inner.warm.len(),
            dedicated_count: inner.dedicated.len(),
            dedicated_hits: inner.dedicated_hits,
            warm_hits: inner.warm_hits,
            cold_creates: inner.cold_creates,
        }
    }

    /// One maintenance cycle: evict idle resources from both the warm
    /// queue and the dedicated map, then top the warm queue back up.
    pub async fn run_maintenance(&self) {
        let max_age = self.settings.max_age();
        let now = Utc::now();
        let mut evicted = Vec::new();
        {
            let mut inner = self.inner.lock().await;
            let mut kept = VecDeque::with_capacity(inner.warm.len());
            while let Some(entry) = inner.warm.pop_front() {
                if entry.idle_longer_than(max_age, now) {
                    evicted.push(entry);
                } else {
                    kept.push_back(entry);
                }
            }
            inner.warm = kept;

            let stale_sessions: Vec<String> = inner
                .dedicated
                .iter()
                .filter(|(_, entry)| entry.idle_longer_than(max_age, now))
                .map(|(session, _)| session.clone())
                .collect();
            for session in stale_sessions {
                if let Some(entry) = inner.dedicated.remove(&session) {
                    warn!(
                        pool = %self.kind,
                        session = %session,
                        "Evicting idle dedicated resource; next acquire will repin"
                    );
                    evicted.push(entry);
                }
            }
        }
        if !evicted.is_empty() {
            debug!(pool = %self.kind, count = evicted.len(), "Evicted idle resources");
        }
        for entry in evicted {
            self.discard(entry).await;
        }
        self.top_up().await;
    }

    /// Run maintenance on a fixed interval until `cancel` fires. This is
    /// the only task that replenishes the pool.
    pub fn spawn_maintenance(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(pool.settings.refresh_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick fires immediately and performs the initial fill.
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => pool.run_maintenance().await,
                }
            }
            debug!(pool = %pool.kind, "Pool maintenance stopped");
        })
    }

    async fn top_up(&self) {
        let target = self.target_warm.load(Ordering::Relaxed);
        loop {
            let deficit = {
                let inner = self.inner.lock().await;
                target.saturating_sub(inner.warm.len())
            };
            if deficit == 0 {
                return;
            }
            match self.factory.create().await {
                Ok(created) => {
                    let mut inner = self.inner.lock().await;
                    if inner.warm.len() >= target {
                        // Another fill won the race while we were creating.
                        drop(inner);
                        self.factory.close(&created).await;
                        return;
                    }
                    inner.warm.push_back(PoolEntry::new(created));
                }
                Err(e) => {
                    warn!(
                        pool = %self.kind,
                        error = %e,
                        "Warm fill failed; retrying on next maintenance cycle"
                    );
                    return;
                }
            }
        }
    }

    async fn discard(&self, entry: PoolEntry<T>) {
        // A session handle may still point at the instance; close only
        // once the pool holds the last reference.
        if Arc::strong_count(&entry.resource) == 1 {
            self.factory.close(&entry.resource).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    struct Probe {
        serial: u64,
    }

    struct ProbeFactory {
        next_serial: AtomicU64,
        closed: AtomicU64,
        create_delay: Duration,
        fail: std::sync::atomic::AtomicBool,
    }

    impl ProbeFactory {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                next_serial: AtomicU64::new(1),
                closed: AtomicU64::new(0),
                create_delay: Duration::ZERO,
                fail: std::sync::atomic::AtomicBool::new(false),
            })
        }

        fn slow(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                next_serial: AtomicU64::new(1),
                closed: AtomicU64::new(0),
                create_delay: delay,
                fail: std::sync::atomic::AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl ResourceFactory<Probe> for ProbeFactory {
        async fn create(&self) -> anyhow::Result<Probe> {
            if !self.create_delay.is_zero() {
                tokio::time::sleep(self.create_delay).await;
            }
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("provider unreachable");
            }
            Ok(Probe {
                serial: self.next_serial.fetch_add(1, Ordering::SeqCst),
            })
        }

        async fn close(&self, _resource: &Probe) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn settings(target_warm: usize) -> PoolSettings {
        PoolSettings {
            target_warm,
            max_age_secs: 300,
            refresh_interval_secs: 30,
            acquire_timeout_ms: 5_000,
        }
    }

    fn pool_with(target_warm: usize, factory: Arc<ProbeFactory>) -> Arc<ResourcePool<Probe>> {
        ResourcePool::new("stt", settings(target_warm), factory)
    }

    #[tokio::test]
    async fn repeat_acquire_returns_same_instance() {
        let pool = pool_with(0, ProbeFactory::new());
        let first = pool
            .acquire_for_session("s1", Duration::from_secs(1))
            .await
            .unwrap();
        let second = pool
            .acquire_for_session("s1", Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(first.tier, Tier::Cold);
        assert_eq!(second.tier, Tier::Dedicated);
        assert!(first.same_instance(&second));
        assert_eq!(first.serial, second.serial);
    }

    #[tokio::test]
    async fn warm_resource_becomes_dedicated() {
        let pool = pool_with(1, ProbeFactory::new());
        pool.top_up().await;
        assert_eq!(pool.snapshot().await.warm_level, 1);

        let handle = pool
            .acquire_for_session("s1", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(handle.tier, Tier::Warm);

        let metrics = pool.snapshot().await;
        assert_eq!(metrics.warm_level, 0);
        assert_eq!(metrics.dedicated_count, 1);
        assert_eq!(metrics.warm_hits, 1);
        assert_eq!(metrics.cold_creates, 0);
    }

    #[tokio::test]
    async fn concurrent_sessions_never_share_an_instance() {
        let pool = pool_with(2, ProbeFactory::new());
        pool.top_up().await;

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..8 {
            let pool = Arc::clone(&pool);
            tasks.spawn(async move {
                let session = format!("s{i}");
                let handle = pool
                    .acquire_for_session(&session, Duration::from_secs(1))
                    .await
                    .unwrap();
                handle.serial
            });
        }
        let mut serials = Vec::new();
        while let Some(serial) = tasks.join_next().await {
            serials.push(serial.unwrap());
        }
        serials.sort_unstable();
        serials.dedup();

        assert_eq!(serials.len(), 8, "each session must own a distinct instance");
        assert_eq!(pool.snapshot().await.dedicated_count, 8);
    }

    #[tokio::test]
    async fn cold_path_timeout_maps_to_pool_exhausted() {
        let pool = pool_with(0, ProbeFactory::slow(Duration::from_millis(200)));
        let err = pool
            .acquire_for_session("s1", Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, SwitchboardError::PoolExhausted { .. }));
        assert_eq!(err.kind(), "pool_exhausted");
    }

    #[tokio::test]
    async fn factory_failure_maps_to_upstream_error() {
        let factory = ProbeFactory::new();
        factory.fail.store(true, Ordering::SeqCst);
        let pool = pool_with(0, factory);
        let err = pool
            .acquire_for_session("s1", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, SwitchboardError::UpstreamServiceError { .. }));
    }

    #[tokio::test]
    async fn release_under_target_returns_to_warm_queue() {
        let pool = pool_with(2, ProbeFactory::new());
        let handle = pool
            .acquire_for_session("s1", Duration::from_secs(1))
            .await
            .unwrap();
        let serial = handle.serial;
        drop(handle);
        pool.release_for_session("s1").await;

        let metrics = pool.snapshot().await;
        assert_eq!(metrics.dedicated_count, 0);
        assert_eq!(metrics.warm_level, 1);

        // The recycled instance is handed to the next session.
        let next = pool
            .acquire_for_session("s2", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(next.tier, Tier::Warm);
        assert_eq!(next.serial, serial);
    }

    #[tokio::test]
    async fn release_at_target_discards_and_closes() {
        let factory = ProbeFactory::new();
        let pool = pool_with(0, Arc::clone(&factory));
        let handle = pool
            .acquire_for_session("s1", Duration::from_secs(1))
            .await
            .unwrap();
        drop(handle);
        pool.release_for_session("s1").await;

        let metrics = pool.snapshot().await;
        assert_eq!(metrics.warm_level, 0);
        assert_eq!(metrics.dedicated_count, 0);
        assert_eq!(factory.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn release_for_unknown_session_is_a_no_op() {
        let factory = ProbeFactory::new();
        let pool = pool_with(1, Arc::clone(&factory));
        pool.release_for_session("nobody").await;
        assert_eq!(factory.closed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn maintenance_converges_warm_queue_to_target() {
        let pool = pool_with(3, ProbeFactory::new());
        pool.run_maintenance().await;
        assert_eq!(pool.snapshot().await.warm_level, 3);

        // Eviction of aged warm entries is followed by an immediate refill.
        {
            let mut inner = pool.inner.lock().await;
            for entry in inner.warm.iter_mut() {
                entry.last_used_at = Utc::now() - chrono::Duration::seconds(3_600);
            }
        }
        pool.run_maintenance().await;
        let metrics = pool.snapshot().await;
        assert_eq!(metrics.warm_level, 3);
        assert_eq!(metrics.cold_creates, 0, "warm fills are not cold acquires");
    }

    #[tokio::test]
    async fn idle_dedicated_resource_is_evicted_then_reacquired_cold() {
        let factory = ProbeFactory::new();
        let pool = pool_with(0, Arc::clone(&factory));
        let first = pool
            .acquire_for_session("s1", Duration::from_secs(1))
            .await
            .unwrap();
        let first_serial = first.serial;
        drop(first);

        {
            let mut inner = pool.inner.lock().await;
            let entry = inner.dedicated.get_mut("s1").unwrap();
            entry.last_used_at = Utc::now() - chrono::Duration::seconds(3_600);
        }
        pool.run_maintenance().await;
        assert_eq!(pool.snapshot().await.dedicated_count, 0);
        assert_eq!(factory.closed.load(Ordering::SeqCst), 1);

        // The session is not wedged: the next acquire repins a new instance.
        let second = pool
            .acquire_for_session("s1", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(second.tier, Tier::Cold);
        assert_ne!(second.serial, first_serial);
    }

    #[tokio::test]
    async fn eviction_skips_close_while_a_handle_is_live() {
        let factory = ProbeFactory::new();
        let pool = pool_with(0, Arc::clone(&factory));
        let handle = pool
            .acquire_for_session("s1", Duration::from_secs(1))
            .await
            .unwrap();

        {
            let mut inner = pool.inner.lock().await;
            let entry = inner.dedicated.get_mut("s1").unwrap();
            entry.last_used_at = Utc::now() - chrono::Duration::seconds(3_600);
        }
        pool.run_maintenance().await;

        assert_eq!(pool.snapshot().await.dedicated_count, 0);
        assert_eq!(factory.closed.load(Ordering::SeqCst), 0);
        drop(handle);
    }

    #[tokio::test]
    async fn prepare_fills_without_blocking_the_caller() {
        let pool = pool_with(0, ProbeFactory::new());
        pool.prepare(2);
        // prepare returns before the fill lands; give the task a beat.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pool.snapshot().await.warm_level, 2);
    }

    #[tokio::test]
    async fn snapshot_hit_rate_reflects_tier_mix() {
        let pool = pool_with(1, ProbeFactory::new());
        pool.top_up().await;

        let _a = pool
            .acquire_for_session("s1", Duration::from_secs(1))
            .await
            .unwrap();
        let _b = pool
            .acquire_for_session("s2", Duration::from_secs(1))
            .await
            .unwrap();
        let _c = pool
            .acquire_for_session("s1", Duration::from_secs(1))
            .await
            .unwrap();

        let metrics = pool.snapshot().await;
        assert_eq!(metrics.dedicated_hits, 1);
        assert_eq!(metrics.warm_hits, 1);
        assert_eq!(metrics.cold_creates, 1);
        assert_eq!(metrics.total_acquires(), 3);
        assert!((metrics.warm_hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn maintenance_task_stops_on_cancel() {
        let pool = pool_with(1, ProbeFactory::new());
        let cancel = CancellationToken::new();
        let task = pool.spawn_maintenance(cancel.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pool.snapshot().await.warm_level, 1);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("maintenance task should exit promptly")
            .unwrap();
    }
}
