use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Notify, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use ad_radar_common::{BrowserPoolConfig, PoolStats, ScrapeError, ScrapeResult};

/// Starts browser processes. The production implementation is
/// `ChromeLauncher`; tests substitute an in-memory fake.
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    /// Launch one browser with an open page. Failures map to
    /// `ScrapeError::BrowserLaunch`.
    async fn launch(&self, config: &BrowserPoolConfig) -> ScrapeResult<Arc<dyn BrowserSession>>;
}

/// A running browser with one reusable page.
#[async_trait]
pub trait BrowserSession: Send + Sync {
    /// Liveness check: evaluate a trivial script.
    async fn probe(&self) -> bool;

    async fn navigate(&self, url: &str) -> ScrapeResult<()>;

    /// Rendered HTML of the current page
    async fn content(&self) -> ScrapeResult<String>;

    async fn evaluate(&self, script: &str) -> ScrapeResult<Value>;

    /// Best effort, never fails
    async fn close(&self);
}

pub struct BrowserInstance {
    pub id: Uuid,
    session: Arc<dyn BrowserSession>,
    in_use: AtomicBool,
    created_at: Instant,
    last_used_at: Mutex<Instant>,
    leases: AtomicU64,
}

impl BrowserInstance {
    fn new(session: Arc<dyn BrowserSession>) -> Self {
        let now = Instant::now();
        Self {
            id: Uuid::new_v4(),
            session,
            in_use: AtomicBool::new(false),
            created_at: now,
            last_used_at: Mutex::new(now),
            leases: AtomicU64::new(0),
        }
    }

    /// Atomically flip idle -> in use. Only one caller can win.
    fn try_claim(&self) -> bool {
        self.in_use
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Undo a claim that did not turn into a lease.
    fn unclaim(&self) {
        self.in_use.store(false, Ordering::SeqCst);
    }

    fn is_in_use(&self) -> bool {
        self.in_use.load(Ordering::SeqCst)
    }

    fn idle_for(&self) -> std::time::Duration {
        self.last_used_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    /// Reason to reclaim this instance, if any
    fn recycle_reason(&self, config: &BrowserPoolConfig) -> Option<&'static str> {
        if self.created_at.elapsed() > config.max_lifetime {
            Some("lifetime exceeded")
        } else if self.idle_for() > config.max_idle_time {
            Some("idle too long")
        } else {
            None
        }
    }
}

/// Exclusive use of one browser instance. Dropping the lease returns the
/// instance to the pool.
pub struct BrowserLease {
    instance: Arc<BrowserInstance>,
    released: Arc<Notify>,
}

impl BrowserLease {
    pub fn id(&self) -> Uuid {
        self.instance.id
    }

    pub fn session(&self) -> &Arc<dyn BrowserSession> {
        &self.instance.session
    }
}

impl fmt::Debug for BrowserLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrowserLease")
            .field("id", &self.instance.id)
            .field("leases", &self.instance.leases.load(Ordering::SeqCst))
            .finish()
    }
}

impl Drop for BrowserLease {
    fn drop(&mut self) {
        *self
            .instance
            .last_used_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
        self.instance.in_use.store(false, Ordering::SeqCst);
        self.released.notify_one();
    }
}

/// A slot held for a launch in progress. Dropping it frees the slot.
struct LaunchSlot<'a> {
    launching: &'a AtomicUsize,
    released: &'a Notify,
}

impl Drop for LaunchSlot<'_> {
    fn drop(&mut self) {
        self.launching.fetch_sub(1, Ordering::SeqCst);
        self.released.notify_one();
    }
}

/// Bounded pool of reusable headless browser instances.
pub struct BrowserPool {
    instances: RwLock<Vec<Arc<BrowserInstance>>>,
    /// Launches in progress; counted against `max_browsers`
    launching: AtomicUsize,
    launcher: Arc<dyn BrowserLauncher>,
    config: BrowserPoolConfig,
    released: Arc<Notify>,
    shut_down: AtomicBool,
    reclaimer: Mutex<Option<CancellationToken>>,

    // Metrics
    total_created: AtomicU64,
    total_recycled: AtomicU64,
}

impl BrowserPool {
    pub fn new(config: BrowserPoolConfig, launcher: Arc<dyn BrowserLauncher>) -> Self {
        info!(
            "Browser pool ready: up to {} instances, created on demand (headless: {}, in container: {})",
            config.max_browsers, config.headless, config.in_container
        );
        Self {
            instances: RwLock::new(Vec::new()),
            launching: AtomicUsize::new(0),
            launcher,
            config,
            released: Arc::new(Notify::new()),
            shut_down: AtomicBool::new(false),
            reclaimer: Mutex::new(None),
            total_created: AtomicU64::new(0),
            total_recycled: AtomicU64::new(0),
        }
    }

    /// Lease an instance, launching one if the pool has room, otherwise
    /// waiting up to `acquire_timeout` for a release.
    pub async fn acquire(&self) -> ScrapeResult<BrowserLease> {
        let deadline = Instant::now() + self.config.acquire_timeout;

        loop {
            // Register interest before scanning so a release in between is not lost
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(lease) = self.try_acquire().await? {
                return Ok(lease);
            }

            debug!(
                "All {} browser instances busy, waiting for a release",
                self.config.max_browsers
            );
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                warn!(
                    "Timed out after {:?} waiting for a browser instance",
                    self.config.acquire_timeout
                );
                return Err(ScrapeError::AcquireTimeout(self.config.acquire_timeout));
            }
        }
    }

    async fn try_acquire(&self) -> ScrapeResult<Option<BrowserLease>> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(ScrapeError::cancelled("browser pool is shutting down"));
        }

        let idle: Vec<Arc<BrowserInstance>> = self
            .instances
            .read()
            .await
            .iter()
            .filter(|instance| !instance.is_in_use())
            .cloned()
            .collect();

        for instance in idle {
            if !instance.try_claim() {
                continue;
            }
            if instance.session.probe().await {
                return Ok(Some(self.lease(instance)));
            }
            warn!(instance_id = %instance.id, "Browser instance failed liveness probe, discarding");
            self.discard(&instance).await;
        }

        let Some(slot) = self.reserve_launch().await else {
            return Ok(None);
        };

        // The launch runs without the lock so idle leases, stats and
        // reclamation are not held up by a slow browser start.
        let session = self.launcher.launch(&self.config).await?;
        let instance = Arc::new(BrowserInstance::new(session));
        instance.in_use.store(true, Ordering::SeqCst);

        {
            let mut instances = self.instances.write().await;
            if self.shut_down.load(Ordering::SeqCst) {
                drop(instances);
                drop(slot);
                instance.session.close().await;
                return Err(ScrapeError::cancelled("browser pool is shutting down"));
            }
            instances.push(Arc::clone(&instance));
            // Freed under the lock, once the instance itself is counted
            drop(slot);
        }
        self.total_created.fetch_add(1, Ordering::SeqCst);

        Ok(Some(self.lease(instance)))
    }

    /// Hold a slot for a new instance if the pool has room.
    async fn reserve_launch(&self) -> Option<LaunchSlot<'_>> {
        let instances = self.instances.write().await;
        let launching = self.launching.load(Ordering::SeqCst);
        if instances.len() + launching >= self.config.max_browsers {
            return None;
        }
        self.launching.fetch_add(1, Ordering::SeqCst);
        info!(
            "Launching browser instance on demand ({}/{})",
            instances.len() + launching + 1,
            self.config.max_browsers
        );
        Some(LaunchSlot {
            launching: &self.launching,
            released: &self.released,
        })
    }

    fn lease(&self, instance: Arc<BrowserInstance>) -> BrowserLease {
        let leases = instance.leases.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(instance_id = %instance.id, leases = leases, "Browser instance leased");
        BrowserLease {
            instance,
            released: Arc::clone(&self.released),
        }
    }

    /// Return a lease. Marks the instance idle and wakes one waiter; the
    /// instance stays open for reuse.
    pub fn release(&self, lease: BrowserLease) {
        debug!(instance_id = %lease.id(), "Browser instance released");
        drop(lease);
    }

    /// Close a leased instance instead of returning it. For pages left in
    /// an unknown state, e.g. a navigation abandoned mid-flight.
    pub async fn retire(&self, lease: BrowserLease, reason: &str) {
        warn!(instance_id = %lease.id(), "Retiring browser instance: {}", reason);
        // Still claimed by the lease, so nobody else can pick it up meanwhile
        self.discard(&lease.instance).await;
        drop(lease);
    }

    /// Remove a claimed instance from the pool and close it.
    async fn discard(&self, instance: &Arc<BrowserInstance>) {
        self.instances
            .write()
            .await
            .retain(|candidate| candidate.id != instance.id);
        self.total_recycled.fetch_add(1, Ordering::SeqCst);
        instance.session.close().await;
        // The freed slot may let a waiter launch a replacement
        self.released.notify_one();
    }

    /// Close idle instances that are past their idle or lifetime limits.
    pub async fn reclaim(&self) -> usize {
        let mut reclaimed = 0;
        for instance in self.reclaim_candidates().await {
            if self.reclaim_one(&instance).await {
                reclaimed += 1;
            }
        }
        reclaimed
    }

    async fn reclaim_candidates(&self) -> Vec<Arc<BrowserInstance>> {
        self.instances
            .read()
            .await
            .iter()
            .filter(|instance| instance.recycle_reason(&self.config).is_some())
            .cloned()
            .collect()
    }

    async fn reclaim_one(&self, instance: &Arc<BrowserInstance>) -> bool {
        // Leased instances are left alone until the next pass
        if !instance.try_claim() {
            return false;
        }
        // It may have been leased and returned since the snapshot
        let Some(reason) = instance.recycle_reason(&self.config) else {
            instance.unclaim();
            self.released.notify_one();
            return false;
        };
        info!(
            instance_id = %instance.id,
            "Reclaiming browser instance ({}, age: {:?}, leases: {})",
            reason,
            instance.created_at.elapsed(),
            instance.leases.load(Ordering::SeqCst)
        );
        self.discard(instance).await;
        true
    }

    /// Run `reclaim` every `reclaim_interval` until `shutdown`.
    pub fn start_reclaimer(self: &Arc<Self>) {
        let token = CancellationToken::new();
        if let Some(previous) = self
            .reclaimer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(token.clone())
        {
            previous.cancel();
        }

        let pool = Arc::clone(self);
        let interval = self.config.reclaim_interval;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        let reclaimed = pool.reclaim().await;
                        if reclaimed > 0 {
                            debug!("Reclamation pass closed {} instances", reclaimed);
                        }
                    }
                }
            }
            debug!("Browser reclamation task stopped");
        });
    }

    /// Stop reclamation and close every instance, leased or not.
    pub async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        if let Some(token) = self
            .reclaimer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            token.cancel();
        }

        let instances: Vec<_> = self.instances.write().await.drain(..).collect();
        let count = instances.len();
        for instance in instances {
            instance.session.close().await;
        }
        // Waiters observe the shutdown flag on their next scan
        self.released.notify_waiters();
        info!("Browser pool shut down, closed {} instances", count);
    }

    pub async fn stats(&self) -> PoolStats {
        let instances = self.instances.read().await;
        let in_use = instances.iter().filter(|i| i.is_in_use()).count();

        PoolStats {
            total: instances.len(),
            in_use,
            available: instances.len() - in_use,
            max_browsers: self.config.max_browsers,
            total_created: self.total_created.load(Ordering::SeqCst),
            total_recycled: self.total_recycled.load(Ordering::SeqCst),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    /// In-memory browser. Pages are looked up by a fragment of the URL.
    pub struct FakeSession {
        pub alive: AtomicBool,
        pub closed: AtomicBool,
        pages: HashMap<String, String>,
        current: Mutex<String>,
        navigation_delay: Duration,
    }

    #[async_trait]
    impl BrowserSession for FakeSession {
        async fn probe(&self) -> bool {
            self.alive.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst)
        }

        async fn navigate(&self, url: &str) -> ScrapeResult<()> {
            if !self.navigation_delay.is_zero() {
                tokio::time::sleep(self.navigation_delay).await;
            }
            *self.current.lock().unwrap() = url.to_string();
            Ok(())
        }

        async fn content(&self) -> ScrapeResult<String> {
            let current = self.current.lock().unwrap().clone();
            self.pages
                .iter()
                .find(|(fragment, _)| current.contains(fragment.as_str()))
                .map(|(_, html)| html.clone())
                .ok_or_else(|| ScrapeError::Browser(format!("no page for {}", current)))
        }

        async fn evaluate(&self, _script: &str) -> ScrapeResult<Value> {
            Ok(Value::Null)
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    pub struct FakeLauncher {
        pub launches: AtomicUsize,
        pub fail: AtomicBool,
        pub pages: HashMap<String, String>,
        pub sessions: Mutex<Vec<Arc<FakeSession>>>,
        /// Delay applied to the next launch only
        pub slow_launch: Mutex<Option<Duration>>,
        pub navigation_delay: Duration,
    }

    impl FakeLauncher {
        pub fn with_pages(pages: HashMap<String, String>) -> Self {
            Self {
                pages,
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl BrowserLauncher for FakeLauncher {
        async fn launch(
            &self,
            _config: &BrowserPoolConfig,
        ) -> ScrapeResult<Arc<dyn BrowserSession>> {
            let delay = self.slow_launch.lock().unwrap().take();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(ScrapeError::BrowserLaunch("chromium: not found".to_string()));
            }
            self.launches.fetch_add(1, Ordering::SeqCst);
            let session = Arc::new(FakeSession {
                alive: AtomicBool::new(true),
                closed: AtomicBool::new(false),
                pages: self.pages.clone(),
                current: Mutex::new(String::new()),
                navigation_delay: self.navigation_delay,
            });
            self.sessions.lock().unwrap().push(Arc::clone(&session));
            Ok(session)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeLauncher;
    use super::*;
    use std::time::Duration;

    fn pool(max_browsers: usize, launcher: Arc<FakeLauncher>) -> Arc<BrowserPool> {
        let config = BrowserPoolConfig {
            max_browsers,
            acquire_timeout: Duration::from_secs(30),
            ..BrowserPoolConfig::default()
        };
        Arc::new(BrowserPool::new(config, launcher))
    }

    #[tokio::test]
    async fn test_third_acquire_waits_for_release() {
        let launcher = Arc::new(FakeLauncher::default());
        let pool = pool(2, Arc::clone(&launcher));

        let first = pool.acquire().await.unwrap();
        let second = pool.acquire().await.unwrap();
        assert_ne!(first.id(), second.id());

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        let released_id = first.id();
        pool.release(first);
        let third = waiter.await.unwrap().unwrap();

        assert_eq!(third.id(), released_id);
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 2);
        assert_eq!(pool.stats().await.in_use, 2);
        drop(second);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_times_out_at_capacity() {
        let launcher = Arc::new(FakeLauncher::default());
        let pool = pool(1, launcher);
        let _held = pool.acquire().await.unwrap();

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, ScrapeError::AcquireTimeout(_)));
        assert_eq!(err.kind(), ad_radar_common::FailureKind::ResourceExhausted);
    }

    #[tokio::test]
    async fn test_dead_instance_is_replaced() {
        let launcher = Arc::new(FakeLauncher::default());
        let pool = pool(1, Arc::clone(&launcher));

        let lease = pool.acquire().await.unwrap();
        let dead_id = lease.id();
        drop(lease);
        launcher.sessions.lock().unwrap()[0]
            .alive
            .store(false, Ordering::SeqCst);

        let lease = pool.acquire().await.unwrap();
        assert_ne!(lease.id(), dead_id);
        assert!(launcher.sessions.lock().unwrap()[0].closed.load(Ordering::SeqCst));

        let stats = pool.stats().await;
        assert_eq!(stats.total, 1);
        assert_eq!(stats.total_created, 2);
        assert_eq!(stats.total_recycled, 1);
    }

    #[tokio::test]
    async fn test_launch_failure_is_fatal() {
        let launcher = Arc::new(FakeLauncher::default());
        launcher.fail.store(true, Ordering::SeqCst);
        let pool = pool(1, launcher);

        let err = pool.acquire().await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(pool.stats().await.total, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reclaims_idle_instances_only() {
        let launcher = Arc::new(FakeLauncher::default());
        let pool = pool(2, launcher);

        let busy = pool.acquire().await.unwrap();
        let idle = pool.acquire().await.unwrap();
        drop(idle);

        tokio::time::advance(BrowserPoolConfig::default().max_idle_time + Duration::from_secs(1))
            .await;
        assert_eq!(pool.reclaim().await, 1);

        let stats = pool.stats().await;
        assert_eq!(stats.total, 1);
        assert_eq!(stats.in_use, 1);
        drop(busy);
    }

    #[tokio::test]
    async fn test_lease_reuse_without_relaunch() {
        let launcher = Arc::new(FakeLauncher::default());
        let pool = pool(3, Arc::clone(&launcher));

        for _ in 0..5 {
            let lease = pool.acquire().await.unwrap();
            pool.release(lease);
        }
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
        let stats = pool.stats().await;
        assert_eq!(stats.available, 1);
        assert_eq!(stats.max_browsers, 3);
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything_and_rejects_acquire() {
        let launcher = Arc::new(FakeLauncher::default());
        let pool = pool(2, Arc::clone(&launcher));
        let lease = pool.acquire().await.unwrap();

        pool.shutdown().await;
        assert!(launcher.sessions.lock().unwrap()[0].closed.load(Ordering::SeqCst));
        assert_eq!(pool.stats().await.total, 0);
        assert!(pool.acquire().await.unwrap_err().is_cancelled());
        drop(lease);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_launch_does_not_block_idle_leases_or_stats() {
        let launcher = Arc::new(FakeLauncher::default());
        let pool = pool(2, Arc::clone(&launcher));
        let first = pool.acquire().await.unwrap();
        let first_id = first.id();

        *launcher.slow_launch.lock().unwrap() = Some(Duration::from_secs(60));
        let launching = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire().await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        pool.release(first);

        let reused = tokio::time::timeout(Duration::from_secs(1), pool.acquire())
            .await
            .expect("idle instance leased while another launches")
            .unwrap();
        assert_eq!(reused.id(), first_id);

        let stats = tokio::time::timeout(Duration::from_secs(1), pool.stats())
            .await
            .unwrap();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.in_use, 1);

        // The pending launch holds the second slot
        assert!(tokio::time::timeout(Duration::from_secs(1), pool.acquire())
            .await
            .is_err());

        let second = launching.await.unwrap().unwrap();
        assert_ne!(second.id(), first_id);
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 2);
        assert_eq!(pool.stats().await.total, 2);
    }

    #[tokio::test]
    async fn test_failed_launch_frees_its_slot() {
        let launcher = Arc::new(FakeLauncher::default());
        let pool = pool(1, Arc::clone(&launcher));

        launcher.fail.store(true, Ordering::SeqCst);
        assert!(pool.acquire().await.unwrap_err().is_fatal());

        launcher.fail.store(false, Ordering::SeqCst);
        let lease = pool.acquire().await.unwrap();
        assert_eq!(pool.stats().await.total, 1);
        drop(lease);
    }

    #[tokio::test]
    async fn test_retired_lease_is_closed_not_reused() {
        let launcher = Arc::new(FakeLauncher::default());
        let pool = pool(1, Arc::clone(&launcher));

        let lease = pool.acquire().await.unwrap();
        let retired_id = lease.id();
        pool.retire(lease, "navigation abandoned").await;

        assert!(launcher.sessions.lock().unwrap()[0].closed.load(Ordering::SeqCst));
        let stats = pool.stats().await;
        assert_eq!(stats.total, 0);
        assert_eq!(stats.total_recycled, 1);

        let next = pool.acquire().await.unwrap();
        assert_ne!(next.id(), retired_id);
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reclaim_skips_instance_used_since_snapshot() {
        let launcher = Arc::new(FakeLauncher::default());
        let pool = pool(1, launcher);
        drop(pool.acquire().await.unwrap());

        tokio::time::advance(BrowserPoolConfig::default().max_idle_time + Duration::from_secs(1))
            .await;
        let candidates = pool.reclaim_candidates().await;
        assert_eq!(candidates.len(), 1);

        // Fresh use between the snapshot and the claim
        let lease = pool.acquire().await.unwrap();
        pool.release(lease);

        assert!(!pool.reclaim_one(&candidates[0]).await);
        let stats = pool.stats().await;
        assert_eq!(stats.total, 1);
        assert_eq!(stats.available, 1);
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn test_lease_debug_shows_instance() {
        let pool = pool(1, Arc::new(FakeLauncher::default()));
        let lease = pool.acquire().await.unwrap();
        let debug = format!("{:?}", lease);
        assert!(debug.contains(&lease.id().to_string()));
        assert!(debug.contains("leases: 1"));
    }
}
