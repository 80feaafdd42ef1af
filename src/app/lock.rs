//! Distributed lock service over the store's lock table.
//!
//! Locks are leases, not flags: every acquisition carries a TTL, and a
//! background heartbeat extends the leases this instance holds. A crashed
//! holder stops heartbeating and its leases expire on their own, so no
//! manual cleanup is ever needed for fleet safety. Contention is an expected
//! outcome (`None`), never an error; only store I/O failures surface as
//! errors.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::AppError;
use crate::infra::store::SqliteStore;

/// Lock service configuration
#[derive(Debug, Clone)]
pub struct LockServiceConfig {
    /// Lease length when the caller does not specify one
    pub default_ttl: Duration,
    /// How often held leases are extended; must be well under the TTL
    pub heartbeat_interval: Duration,
}

impl Default for LockServiceConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(20),
        }
    }
}

/// Per-call acquisition options
#[derive(Debug, Clone)]
pub struct AcquireOptions {
    /// Lease TTL; the service default when `None`
    pub ttl: Option<Duration>,
    /// Retry on contention instead of returning immediately
    pub retry: bool,
    /// Further attempts after the first, when retrying
    pub max_retries: u32,
    /// Fixed delay between attempts
    pub retry_delay: Duration,
}

impl Default for AcquireOptions {
    fn default() -> Self {
        Self {
            ttl: None,
            retry: false,
            max_retries: 5,
            retry_delay: Duration::from_millis(500),
        }
    }
}

/// A held lease. Dropping the handle does NOT release the lock; the lease
/// either gets released explicitly or expires on its own.
pub struct LockHandle {
    service: Arc<LockService>,
    name: String,
}

impl LockHandle {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Release the lease if still owned; idempotent
    pub async fn release(&self) -> Result<bool, AppError> {
        self.service.release(&self.name).await
    }

    /// Push the lease forward; `false` when ownership was lost
    pub async fn extend(&self, ttl: Option<Duration>) -> Result<bool, AppError> {
        self.service.extend(&self.name, ttl).await
    }

    /// Re-read the row and confirm ownership and non-expiry
    pub async fn is_valid(&self) -> Result<bool, AppError> {
        let now = chrono::Utc::now().timestamp();
        Ok(self
            .service
            .store
            .get_lock(&self.name)
            .await?
            .is_some_and(|lock| {
                lock.owner_id == self.service.owner_id && !lock.is_expired_at(now)
            }))
    }
}

/// Fleet-wide mutual exclusion keyed by lock name.
///
/// One instance per process; the random owner id is what distinguishes
/// instances in the shared lock table.
pub struct LockService {
    store: Arc<SqliteStore>,
    owner_id: String,
    config: LockServiceConfig,
    /// Held lease registry: lock name to its TTL in seconds, consumed by the
    /// heartbeat when re-extending
    held: DashMap<String, i64>,
    shutting_down: AtomicBool,
    heartbeat: std::sync::Mutex<Option<JoinHandle<()>>>,
}

fn ttl_seconds(ttl: Duration) -> i64 {
    (ttl.as_secs() as i64).max(1)
}

impl LockService {
    #[must_use]
    pub fn new(store: Arc<SqliteStore>, config: LockServiceConfig) -> Self {
        let owner_id = Uuid::new_v4().to_string();
        info!(owner_id = %owner_id, "Lock service initialized");
        Self {
            store,
            owner_id,
            config,
            held: DashMap::new(),
            shutting_down: AtomicBool::new(false),
            heartbeat: std::sync::Mutex::new(None),
        }
    }

    #[must_use]
    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// Single atomic acquisition attempt. `None` when another live owner
    /// holds the lock or this service is shutting down.
    pub async fn try_acquire(
        self: &Arc<Self>,
        name: &str,
        ttl: Option<Duration>,
    ) -> Result<Option<LockHandle>, AppError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let ttl = ttl_seconds(ttl.unwrap_or(self.config.default_ttl));
        let acquired = self
            .store
            .try_acquire_lock(name, &self.owner_id, ttl, None)
            .await?;
        if !acquired {
            return Ok(None);
        }
        self.held.insert(name.to_string(), ttl);
        debug!(lock = name, ttl_seconds = ttl, "Lock acquired");
        Ok(Some(LockHandle {
            service: Arc::clone(self),
            name: name.to_string(),
        }))
    }

    /// Acquire with optional bounded retrying; never blocks indefinitely.
    pub async fn acquire(
        self: &Arc<Self>,
        name: &str,
        options: AcquireOptions,
    ) -> Result<Option<LockHandle>, AppError> {
        let mut attempts_left = if options.retry { options.max_retries } else { 0 };
        loop {
            if let Some(handle) = self.try_acquire(name, options.ttl).await? {
                return Ok(Some(handle));
            }
            if attempts_left == 0 || self.shutting_down.load(Ordering::SeqCst) {
                return Ok(None);
            }
            attempts_left -= 1;
            tokio::time::sleep(options.retry_delay).await;
        }
    }

    /// Run `work` under the named lock.
    ///
    /// Returns `Ok(None)` without running when the lock stays contended
    /// through the acquisition options. The lock is released whether `work`
    /// succeeds or fails; a failure is propagated after the release.
    pub async fn with_lock<T, F, Fut>(
        self: &Arc<Self>,
        name: &str,
        options: AcquireOptions,
        work: F,
    ) -> Result<Option<T>, AppError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let Some(handle) = self.acquire(name, options).await? else {
            return Ok(None);
        };

        let result = work().await;

        if let Err(error) = handle.release().await {
            warn!(lock = name, error = %error, "Failed to release lock after work");
        }

        result.map(Some)
    }

    /// Release a held lease; idempotent, `false` when not held
    pub async fn release(&self, name: &str) -> Result<bool, AppError> {
        self.held.remove(name);
        self.store.release_lock(name, &self.owner_id).await
    }

    /// Extend a held lease in place; `false` when ownership was lost
    pub async fn extend(&self, name: &str, ttl: Option<Duration>) -> Result<bool, AppError> {
        let ttl = ttl_seconds(ttl.unwrap_or(self.config.default_ttl));
        let extended = self.store.extend_lock(name, &self.owner_id, ttl).await?;
        if extended {
            self.held.insert(name.to_string(), ttl);
        } else {
            self.held.remove(name);
        }
        Ok(extended)
    }

    /// Release every lease this instance holds
    pub async fn release_all(&self) -> Result<u64, AppError> {
        self.held.clear();
        let released = self.store.release_all_locks(&self.owner_id).await?;
        if released > 0 {
            info!(count = released, "Released all held locks");
        }
        Ok(released)
    }

    /// Whether this instance believes it holds the named lock
    #[must_use]
    pub fn holds_lock(&self, name: &str) -> bool {
        self.held.contains_key(name)
    }

    /// Whether any live owner holds the named lock
    pub async fn is_locked(&self, name: &str) -> Result<bool, AppError> {
        let now = chrono::Utc::now().timestamp();
        Ok(self
            .store
            .get_lock(name)
            .await?
            .is_some_and(|lock| !lock.is_expired_at(now)))
    }

    /// Names of every lease this instance holds
    #[must_use]
    pub fn list_held_locks(&self) -> Vec<String> {
        self.held.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Start the background lease-extension task. Idempotent.
    pub fn start_heartbeat(self: &Arc<Self>) {
        let mut guard = self.heartbeat.lock().expect("heartbeat state poisoned");
        if guard.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }

        let service = Arc::clone(self);
        let interval = self.config.heartbeat_interval;
        *guard = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if service.shutting_down.load(Ordering::SeqCst) {
                    break;
                }
                service.heartbeat_once().await;
            }
        }));
    }

    /// Extend every held lease once. Losing a lease is logged and dropped
    /// from the registry; a store error leaves the registry untouched so the
    /// next beat retries.
    async fn heartbeat_once(&self) {
        let held: Vec<(String, i64)> = self
            .held
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();

        for (name, ttl) in held {
            match self.store.extend_lock(&name, &self.owner_id, ttl).await {
                Ok(true) => debug!(lock = %name, "Lease extended"),
                Ok(false) => {
                    warn!(lock = %name, "Lease lost; dropping from held registry");
                    self.held.remove(&name);
                }
                Err(error) => {
                    warn!(lock = %name, error = %error, "Lease extension failed");
                }
            }
        }
    }

    /// Stop the background lease-extension task without touching held
    /// leases. The service stays usable; `start_heartbeat` brings the task
    /// back.
    pub fn stop_heartbeat(&self) {
        if let Some(task) = self
            .heartbeat
            .lock()
            .expect("heartbeat state poisoned")
            .take()
        {
            task.abort();
        }
    }

    /// Terminal shutdown for process exit: stop heartbeating, refuse new
    /// acquisitions for good, and release everything. Idempotent.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop_heartbeat();
        if let Err(error) = self.release_all().await {
            warn!(error = %error, "Failed to release locks during shutdown");
        }
        info!(owner_id = %self.owner_id, "Lock service shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn service() -> (Arc<SqliteStore>, Arc<LockService>) {
        let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());
        let lock_service = Arc::new(LockService::new(
            Arc::clone(&store),
            LockServiceConfig::default(),
        ));
        (store, lock_service)
    }

    #[tokio::test]
    async fn test_mutual_exclusion_between_instances() {
        let (store, first) = service().await;
        let second = Arc::new(LockService::new(
            Arc::clone(&store),
            LockServiceConfig::default(),
        ));

        let handle = first.try_acquire("job", None).await.unwrap().unwrap();
        assert!(second.try_acquire("job", None).await.unwrap().is_none());

        assert!(handle.release().await.unwrap());
        assert!(second.try_acquire("job", None).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_reacquire_by_same_owner_extends() {
        let (_store, service) = service().await;

        let first = service.try_acquire("job", None).await.unwrap();
        assert!(first.is_some());
        let second = service.try_acquire("job", None).await.unwrap();
        assert!(second.is_some());
        assert!(service.holds_lock("job"));
    }

    #[tokio::test]
    async fn test_handle_validity_tracks_ownership() {
        let (store, first) = service().await;
        let second = Arc::new(LockService::new(
            Arc::clone(&store),
            LockServiceConfig::default(),
        ));

        let handle = first.try_acquire("job", None).await.unwrap().unwrap();
        assert!(handle.is_valid().await.unwrap());

        // Simulate losing the lease to another owner
        store.release_all_locks(first.owner_id()).await.unwrap();
        let stolen = second.try_acquire("job", None).await.unwrap();
        assert!(stolen.is_some());

        assert!(!handle.is_valid().await.unwrap());
        assert!(!handle.extend(None).await.unwrap());
        assert!(!first.holds_lock("job"));
    }

    #[tokio::test]
    async fn test_with_lock_releases_on_success_and_failure() {
        let (_store, service) = service().await;

        let result = service
            .with_lock("job", AcquireOptions::default(), || async {
                Ok::<_, AppError>(7)
            })
            .await
            .unwrap();
        assert_eq!(result, Some(7));
        assert!(!service.holds_lock("job"));

        let result: Result<Option<()>, AppError> = service
            .with_lock("job", AcquireOptions::default(), || async {
                Err(AppError::Internal("boom".to_string()))
            })
            .await;
        assert!(result.is_err());
        // Lock must be free again even though the work failed
        assert!(!service.is_locked("job").await.unwrap());
    }

    #[tokio::test]
    async fn test_with_lock_skips_work_when_contended() {
        let (store, first) = service().await;
        let second = Arc::new(LockService::new(
            Arc::clone(&store),
            LockServiceConfig::default(),
        ));
        let _held = first.try_acquire("job", None).await.unwrap().unwrap();

        let ran = std::sync::atomic::AtomicBool::new(false);
        let result = second
            .with_lock("job", AcquireOptions::default(), || async {
                ran.store(true, Ordering::SeqCst);
                Ok::<_, AppError>(())
            })
            .await
            .unwrap();

        assert!(result.is_none());
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_with_lock_retries_through_a_short_holder() {
        let (store, first) = service().await;
        let second = Arc::new(LockService::new(
            Arc::clone(&store),
            LockServiceConfig::default(),
        ));
        let held = first.try_acquire("job", None).await.unwrap().unwrap();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            held.release().await.unwrap();
        });

        let result = second
            .with_lock(
                "job",
                AcquireOptions {
                    retry: true,
                    max_retries: 10,
                    retry_delay: Duration::from_millis(50),
                    ..AcquireOptions::default()
                },
                || async { Ok::<_, AppError>(42) },
            )
            .await
            .unwrap();
        assert_eq!(result, Some(42));
    }

    #[tokio::test]
    async fn test_acquire_without_retry_fails_fast() {
        let (store, first) = service().await;
        let second = Arc::new(LockService::new(
            Arc::clone(&store),
            LockServiceConfig::default(),
        ));
        let _held = first.try_acquire("job", None).await.unwrap().unwrap();

        let outcome = second
            .acquire("job", AcquireOptions::default())
            .await
            .unwrap();
        assert!(outcome.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_releases_and_refuses_acquire() {
        let (_store, service) = service().await;
        assert!(service.try_acquire("a", None).await.unwrap().is_some());
        assert!(service.try_acquire("b", None).await.unwrap().is_some());

        service.shutdown().await;
        assert!(service.list_held_locks().is_empty());
        assert!(!service.is_locked("a").await.unwrap());
        assert!(service.try_acquire("c", None).await.unwrap().is_none());

        // Second shutdown is a no-op
        service.shutdown().await;
    }
}
