//! Weighted failover pool over upstream RPC endpoints.
//!
//! Upstream providers degrade independently and transiently. Retrying one
//! endpoint forever wastes time during a provider-wide incident, while
//! unconditional round-robin wastes the better-performing primary. This
//! manager fails over after sustained connectivity failures and, when every
//! endpoint has been exhausted, resets the whole pool to healthy and returns
//! to the primary — bounded degradation instead of permanent lockout.

use std::future::Future;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::domain::{AppError, ChainClient, ChainError, ConfigError, EndpointStatus, ErrorKind};

/// Static endpoint configuration
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub url: String,
    pub weight: u32,
}

impl EndpointConfig {
    #[must_use]
    pub fn new(url: impl Into<String>, weight: u32) -> Self {
        Self {
            url: url.into(),
            weight,
        }
    }
}

/// Failover behavior knobs
#[derive(Debug, Clone)]
pub struct FailoverConfig {
    /// Connectivity failures in a row before an endpoint is marked unhealthy
    pub max_consecutive_failures: u32,
    /// Interval between background liveness probes
    pub health_check_interval: Duration,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 3,
            health_check_interval: Duration::from_secs(30),
        }
    }
}

/// Options for the retrying execute wrapper
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    /// Total attempts, including the first
    pub max_retries: u32,
    /// Per-attempt timeout, distinct from the overall retry budget
    pub timeout: Duration,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Builds a live client for an endpoint URL
pub type ConnectFn = Box<dyn Fn(&str) -> Arc<dyn ChainClient> + Send + Sync>;

/// Invoked as `(old_url, new_url, reason)` whenever the current endpoint changes
pub type EndpointChangeFn = Box<dyn Fn(&str, &str, &str) + Send + Sync>;

struct EndpointState {
    url: String,
    weight: u32,
    is_healthy: bool,
    /// Failures since the last success on this endpoint (reported)
    consecutive_failures: u32,
    /// Connectivity-class failures in a row; this is what drives failover
    connectivity_failures: u32,
    last_latency_ms: Option<u64>,
}

impl EndpointState {
    fn new(config: &EndpointConfig) -> Self {
        Self {
            url: config.url.clone(),
            weight: config.weight,
            is_healthy: true,
            consecutive_failures: 0,
            connectivity_failures: 0,
            last_latency_ms: None,
        }
    }

    fn reset(&mut self) {
        self.is_healthy = true;
        self.consecutive_failures = 0;
        self.connectivity_failures = 0;
    }
}

struct Inner {
    /// Always sorted by descending weight for deterministic primary selection
    endpoints: Vec<EndpointState>,
    current: usize,
    client: Arc<dyn ChainClient>,
}

/// Failover connection manager over a weighted endpoint pool.
///
/// Owns its endpoint state exclusively; all callers share one manager
/// instance per process.
pub struct FailoverManager {
    inner: Mutex<Inner>,
    connect: ConnectFn,
    config: FailoverConfig,
    on_endpoint_change: Option<EndpointChangeFn>,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl FailoverManager {
    /// Build a manager over a non-empty endpoint list.
    ///
    /// Endpoints are sorted descending by weight; the heaviest becomes
    /// current.
    pub fn new(
        endpoints: Vec<EndpointConfig>,
        config: FailoverConfig,
        connect: ConnectFn,
    ) -> Result<Self, AppError> {
        if endpoints.is_empty() {
            return Err(AppError::Config(ConfigError::Invalid {
                field: "endpoints".to_string(),
                message: "at least one RPC endpoint is required".to_string(),
            }));
        }

        let mut states: Vec<EndpointState> = endpoints.iter().map(EndpointState::new).collect();
        states.sort_by(|a, b| b.weight.cmp(&a.weight));

        let client = connect(&states[0].url);
        info!(
            primary = %states[0].url,
            pool_size = states.len(),
            "Failover manager initialized"
        );

        Ok(Self {
            inner: Mutex::new(Inner {
                endpoints: states,
                current: 0,
                client,
            }),
            connect,
            config,
            on_endpoint_change: None,
            health_task: Mutex::new(None),
        })
    }

    /// Register a callback for endpoint changes (failover, manual switch,
    /// removal). Builder-style; call before sharing the manager.
    #[must_use]
    pub fn with_endpoint_change_callback(mut self, callback: EndpointChangeFn) -> Self {
        self.on_endpoint_change = Some(callback);
        self
    }

    /// The live client for the current endpoint. Stable across calls until a
    /// failover or switch replaces it.
    #[must_use]
    pub fn connection(&self) -> Arc<dyn ChainClient> {
        let inner = self.inner.lock().expect("failover state poisoned");
        Arc::clone(&inner.client)
    }

    /// URL of the current endpoint
    #[must_use]
    pub fn current_url(&self) -> String {
        let inner = self.inner.lock().expect("failover state poisoned");
        inner.endpoints[inner.current].url.clone()
    }

    /// Reset the current endpoint's failure counters and mark it healthy
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("failover state poisoned");
        let current = inner.current;
        let endpoint = &mut inner.endpoints[current];
        endpoint.consecutive_failures = 0;
        endpoint.connectivity_failures = 0;
        endpoint.is_healthy = true;
    }

    /// Record a classified failure against the current endpoint.
    ///
    /// Every failure bumps the reported counter, but only connectivity-class
    /// kinds advance toward failover; a program rejecting an instruction says
    /// nothing about endpoint health. Returns whether a failover occurred.
    pub fn record_failure(&self, kind: ErrorKind) -> bool {
        let change = {
            let mut inner = self.inner.lock().expect("failover state poisoned");
            let current = inner.current;
            let max = self.config.max_consecutive_failures;

            let endpoint = &mut inner.endpoints[current];
            endpoint.consecutive_failures += 1;
            if !kind.is_connectivity() {
                return false;
            }
            endpoint.connectivity_failures += 1;
            if endpoint.connectivity_failures < max {
                return false;
            }

            endpoint.is_healthy = false;
            let old_url = endpoint.url.clone();
            warn!(
                url = %old_url,
                failures = endpoint.connectivity_failures,
                "Endpoint marked unhealthy"
            );
            Some(self.advance_locked(&mut inner, old_url, "consecutive connectivity failures"))
        };

        if let Some((old, new, reason)) = change {
            self.notify_change(&old, &new, &reason);
            return true;
        }
        false
    }

    /// Pick the next-healthiest endpoint by weight order. When none is left,
    /// reset the whole pool and return to the primary; liveness beats strict
    /// health tracking during a provider-wide incident.
    fn advance_locked(
        &self,
        inner: &mut Inner,
        old_url: String,
        reason: &str,
    ) -> (String, String, String) {
        let next = inner.endpoints.iter().position(|e| e.is_healthy);
        let new_index = match next {
            Some(index) => index,
            None => {
                warn!("All endpoints unhealthy; resetting pool to primary");
                for endpoint in &mut inner.endpoints {
                    endpoint.reset();
                }
                0
            }
        };

        inner.current = new_index;
        let new_url = inner.endpoints[new_index].url.clone();
        inner.client = (self.connect)(&new_url);
        info!(from = %old_url, to = %new_url, reason, "Failed over to new endpoint");
        (old_url, new_url, reason.to_string())
    }

    fn notify_change(&self, old: &str, new: &str, reason: &str) {
        if let Some(callback) = &self.on_endpoint_change {
            callback(old, new, reason);
        }
    }

    /// Run `operation` against the current connection with a per-attempt
    /// timeout, retrying up to `max_retries` total attempts. A retry runs
    /// against whatever is current by then, so it can land on a different
    /// endpoint after a failover. Exhausting retries rethrows the last error.
    pub async fn execute_with_failover<T, F, Fut>(
        &self,
        options: ExecuteOptions,
        operation: F,
    ) -> Result<T, AppError>
    where
        F: Fn(Arc<dyn ChainClient>) -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let attempts = options.max_retries.max(1);
        let mut last_error: Option<AppError> = None;

        for attempt in 1..=attempts {
            let client = self.connection();
            match tokio::time::timeout(options.timeout, operation(client)).await {
                Ok(Ok(value)) => {
                    self.record_success();
                    return Ok(value);
                }
                Ok(Err(error)) => {
                    let failed_over = self.record_failure(error.kind());
                    debug!(
                        attempt,
                        failed_over,
                        error = %error,
                        "Chain operation attempt failed"
                    );
                    last_error = Some(error);
                }
                Err(_) => {
                    let error = AppError::Chain(ChainError::Timeout(format!(
                        "operation exceeded {:?}",
                        options.timeout
                    )));
                    self.record_failure(ErrorKind::NetworkTimeout);
                    debug!(attempt, "Chain operation attempt timed out");
                    last_error = Some(error);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| AppError::Internal("retry loop without attempts".to_string())))
    }

    /// Start the background liveness probe. Idempotent: a second call while
    /// a probe task is live never spawns a duplicate.
    ///
    /// Probes update latency and health metadata only; failover stays the
    /// sole responsibility of `record_failure`.
    pub fn start_health_checks(self: &Arc<Self>) {
        let mut guard = self.health_task.lock().expect("health task state poisoned");
        if guard.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        let interval = self.config.health_check_interval;
        *guard = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                manager.probe_current().await;
            }
        }));
    }

    /// Stop the background probe; safe to call when not running
    pub fn stop_health_checks(&self) {
        let mut guard = self.health_task.lock().expect("health task state poisoned");
        if let Some(task) = guard.take() {
            task.abort();
        }
    }

    async fn probe_current(&self) {
        let client = self.connection();
        let started = Instant::now();
        let result = client.health_check().await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let mut inner = self.inner.lock().expect("failover state poisoned");
        let current = inner.current;
        let endpoint = &mut inner.endpoints[current];
        match result {
            Ok(()) => {
                endpoint.last_latency_ms = Some(elapsed_ms);
                endpoint.is_healthy = true;
                debug!(url = %endpoint.url, latency_ms = elapsed_ms, "Health probe ok");
            }
            Err(error) => {
                endpoint.last_latency_ms = None;
                debug!(url = %endpoint.url, error = %error, "Health probe failed");
            }
        }
    }

    /// Per-endpoint snapshot for observability
    #[must_use]
    pub fn endpoint_status(&self) -> Vec<EndpointStatus> {
        let inner = self.inner.lock().expect("failover state poisoned");
        inner
            .endpoints
            .iter()
            .enumerate()
            .map(|(index, endpoint)| EndpointStatus {
                url: endpoint.url.clone(),
                weight: endpoint.weight,
                is_healthy: endpoint.is_healthy,
                is_current: index == inner.current,
                consecutive_failures: endpoint.consecutive_failures,
                latency_ms: endpoint.last_latency_ms,
            })
            .collect()
    }

    /// Manually switch to a known endpoint; `false` if the URL is unknown
    pub fn switch_to_endpoint(&self, url: &str) -> bool {
        let change = {
            let mut inner = self.inner.lock().expect("failover state poisoned");
            let Some(index) = inner.endpoints.iter().position(|e| e.url == url) else {
                return false;
            };
            if index == inner.current {
                return true;
            }
            let old_url = inner.endpoints[inner.current].url.clone();
            inner.current = index;
            inner.endpoints[index].reset();
            inner.client = (self.connect)(url);
            (old_url, url.to_string())
        };
        self.notify_change(&change.0, &change.1, "manual switch");
        true
    }

    /// Add an endpoint to the pool, keeping the descending-weight order.
    /// The current endpoint is unchanged even if the newcomer outweighs it.
    pub fn add_endpoint(&self, config: EndpointConfig) {
        let mut inner = self.inner.lock().expect("failover state poisoned");
        let current_url = inner.endpoints[inner.current].url.clone();
        inner.endpoints.push(EndpointState::new(&config));
        inner.endpoints.sort_by(|a, b| b.weight.cmp(&a.weight));
        inner.current = inner
            .endpoints
            .iter()
            .position(|e| e.url == current_url)
            .unwrap_or(0);
    }

    /// Remove an endpoint. Rejects removing the last one; removing the
    /// current endpoint switches to the best remaining healthy endpoint.
    pub fn remove_endpoint(&self, url: &str) -> bool {
        let change = {
            let mut inner = self.inner.lock().expect("failover state poisoned");
            if inner.endpoints.len() <= 1 {
                return false;
            }
            let Some(index) = inner.endpoints.iter().position(|e| e.url == url) else {
                return false;
            };

            let was_current = index == inner.current;
            let old_url = inner.endpoints[inner.current].url.clone();
            inner.endpoints.remove(index);

            if was_current {
                let next = inner.endpoints.iter().position(|e| e.is_healthy).unwrap_or(0);
                inner.current = next;
                let new_url = inner.endpoints[next].url.clone();
                inner.client = (self.connect)(&new_url);
                Some((old_url, new_url))
            } else {
                let current_url = old_url;
                inner.current = inner
                    .endpoints
                    .iter()
                    .position(|e| e.url == current_url)
                    .unwrap_or(0);
                None
            }
        };

        if let Some((old, new)) = change {
            self.notify_change(&old, &new, "endpoint removed");
        }
        true
    }
}
