//! The rate limiter facade used by the gateway client.
//!
//! `RateLimiter` owns the admission controller, the load and health monitors
//! and the backpressure queue, and runs their background tasks.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::FloodgateConfig;
use crate::error::Result;
use crate::monitor::{HealthMonitor, LoadLevel, LoadMetrics, LoadMonitor};
use crate::tasks::{spawn_periodic, spawn_supervised};

use super::admission::{AdmissionController, AdmissionDecision, DecisionReason};
use super::backend::{guarded_call, AdmissionBackend, CallError};
use super::class::RequestClass;
use super::queue::BackpressureQueue;

/// Read-only snapshot for dashboards and health checks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LimiterStatus {
    pub is_healthy: bool,
    pub load_level: LoadLevel,
    /// Aggregate behind the current load level
    pub load_metrics: Option<LoadMetrics>,
    pub queue_size: usize,
    /// Effective per-caller limit for each class
    pub limits: BTreeMap<String, u64>,
    pub caller_requests_last_minute: Option<usize>,
    pub endpoint_requests_last_minute: Option<usize>,
}

/// In-process admission control for outbound downstream calls.
///
/// This struct is thread-safe and can be shared across multiple tasks.
pub struct RateLimiter {
    config: Arc<FloodgateConfig>,
    controller: Arc<AdmissionController>,
    load: Arc<LoadMonitor>,
    health: Arc<HealthMonitor>,
    queue: Arc<BackpressureQueue>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RateLimiter {
    /// Create a limiter from a configuration. Invalid configuration is rejected here.
    pub fn new(config: FloodgateConfig) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let load = Arc::new(LoadMonitor::new(
            config.thresholds.performance_threshold_ms,
            config.adaptive.min_dwell(),
        ));
        let health = Arc::new(HealthMonitor::new(
            config.thresholds.error_rate_threshold,
            config.thresholds.performance_threshold_ms,
        ));
        let queue = Arc::new(BackpressureQueue::new(
            config.queue.enabled,
            config.queue.capacity,
            config.queue.poll_interval(),
        ));
        let controller = Arc::new(AdmissionController::new(config.clone(), load.clone()));

        Ok(Self {
            config,
            controller,
            load,
            health,
            queue,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the load monitor, health monitor, sweep and queue worker tasks.
    ///
    /// Must be called from within a Tokio runtime. Calling it again while
    /// tasks are running has no effect.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            warn!("Rate limiter background tasks already running");
            return;
        }

        let load = self.load.clone();
        let queue = self.queue.clone();
        tasks.push(spawn_periodic(
            "load-monitor",
            self.config.adaptive.load_check_interval(),
            self.cancel.clone(),
            move |now| {
                load.recompute(now, queue.utilization());
            },
        ));

        let load = self.load.clone();
        let health = self.health.clone();
        tasks.push(spawn_periodic(
            "health-monitor",
            self.config.health.check_interval(),
            self.cancel.clone(),
            move |now| {
                health.check(&load.snapshot(now));
            },
        ));

        let controller = self.controller.clone();
        tasks.push(spawn_periodic(
            "key-sweep",
            self.config.sweep.interval(),
            self.cancel.clone(),
            move |now| {
                controller.sweep(now);
            },
        ));

        let queue = self.queue.clone();
        let controller = self.controller.clone();
        let cancel = self.cancel.clone();
        tasks.push(spawn_supervised("queue-worker", self.cancel.clone(), move || {
            let queue = queue.clone();
            let controller = controller.clone();
            let cancel = cancel.clone();
            async move { queue.run(&*controller, cancel).await }
        }));

        info!(
            load_check_interval_secs = self.config.adaptive.load_check_interval_secs,
            health_check_interval_secs = self.config.health.check_interval_secs,
            queue_capacity = self.config.queue.capacity,
            "Rate limiter started"
        );
    }

    /// Stop background tasks and wait for them to finish. Callers still in
    /// the queue are resolved before this returns.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        let count = tasks.len();
        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        info!(tasks = count, "Rate limiter stopped");
    }

    /// Decide whether a request may go out now. Never blocks.
    pub fn check_admission(&self, caller_id: &str, endpoint: &str, request_class: &str) -> AdmissionDecision {
        self.check_admission_at(caller_id, endpoint, request_class, Instant::now())
    }

    /// [`Self::check_admission`] at an explicit instant.
    pub fn check_admission_at(
        &self,
        caller_id: &str,
        endpoint: &str,
        request_class: &str,
        now: Instant,
    ) -> AdmissionDecision {
        let class = RequestClass::from_name(request_class);
        self.controller.check_admission(caller_id, endpoint, class, now)
    }

    /// Wait in the backpressure queue for admission, for at most `timeout`.
    pub async fn enqueue(
        &self,
        caller_id: &str,
        endpoint: &str,
        request_class: &str,
        timeout: Duration,
    ) -> AdmissionDecision {
        let class = RequestClass::from_name(request_class);
        self.queue.enqueue(caller_id, endpoint, class, timeout).await
    }

    /// Check admission, falling back to the queue when denied by a limit.
    pub async fn acquire(
        &self,
        caller_id: &str,
        endpoint: &str,
        request_class: &str,
        timeout: Option<Duration>,
    ) -> AdmissionDecision {
        let decision = self.check_admission(caller_id, endpoint, request_class);
        if decision.allowed
            || !self.queue.is_enabled()
            || decision.reason == DecisionReason::InternalError
        {
            return decision;
        }

        let timeout = timeout.unwrap_or_else(|| self.config.queue.timeout());
        debug!(
            caller = %caller_id,
            endpoint = %endpoint,
            reason = %decision.reason,
            timeout_ms = timeout.as_millis() as u64,
            "Queuing denied request"
        );
        self.enqueue(caller_id, endpoint, request_class, timeout).await
    }

    /// Report the outcome of a completed downstream call.
    pub fn record_outcome(&self, caller_id: &str, endpoint: &str, latency_ms: f64, success: bool) {
        self.load
            .record_outcome(caller_id, endpoint, latency_ms, success, Instant::now());
    }

    /// Acquire admission, run `call`, and report its outcome.
    pub async fn call<F, Fut, T, E>(
        &self,
        caller_id: &str,
        endpoint: &str,
        request_class: &str,
        timeout: Option<Duration>,
        call: F,
    ) -> std::result::Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        guarded_call(self, caller_id, endpoint, request_class, timeout, call).await
    }

    pub fn current_load_level(&self) -> LoadLevel {
        self.load.current_load_level()
    }

    /// Effective per-caller limit for a class at the current load level.
    pub fn effective_limit(&self, request_class: &str) -> u64 {
        self.controller
            .effective_limit(RequestClass::from_name(request_class))
    }

    pub fn is_healthy(&self) -> bool {
        self.health.is_healthy()
    }

    /// Snapshot of limiter state. Reading it never changes any window.
    pub fn status(&self, caller_id: Option<&str>, endpoint: Option<&str>) -> LimiterStatus {
        self.status_at(caller_id, endpoint, Instant::now())
    }

    /// [`Self::status`] at an explicit instant.
    pub fn status_at(&self, caller_id: Option<&str>, endpoint: Option<&str>, now: Instant) -> LimiterStatus {
        let limits = RequestClass::ALL
            .iter()
            .map(|class| (class.to_string(), self.controller.effective_limit(*class)))
            .collect();

        LimiterStatus {
            is_healthy: self.health.is_healthy(),
            load_level: self.load.current_load_level(),
            load_metrics: self.load.latest_metrics(),
            queue_size: self.queue.len(),
            limits,
            caller_requests_last_minute: caller_id
                .and_then(|caller| self.controller.caller_requests(caller, now)),
            endpoint_requests_last_minute: endpoint
                .and_then(|endpoint| self.controller.endpoint_requests(endpoint, now)),
        }
    }

    pub fn config(&self) -> &FloodgateConfig {
        &self.config
    }

    pub fn load_monitor(&self) -> &Arc<LoadMonitor> {
        &self.load
    }

    pub fn health_monitor(&self) -> &Arc<HealthMonitor> {
        &self.health
    }
}

#[async_trait]
impl AdmissionBackend for RateLimiter {
    async fn acquire(
        &self,
        caller_id: &str,
        endpoint: &str,
        request_class: &str,
        timeout: Option<Duration>,
    ) -> AdmissionDecision {
        RateLimiter::acquire(self, caller_id, endpoint, request_class, timeout).await
    }

    fn record_outcome(&self, caller_id: &str, endpoint: &str, latency_ms: f64, success: bool) {
        RateLimiter::record_outcome(self, caller_id, endpoint, latency_ms, success)
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
