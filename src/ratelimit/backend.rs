//! Admission backend trait used by code that wraps downstream calls.

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

use super::admission::AdmissionDecision;

/// Trait for anything that can admit outbound requests and receive their outcomes.
///
/// Gateway clients depend on this rather than on [`super::RateLimiter`] so
/// they can be exercised against a fixed policy in tests.
#[async_trait]
pub trait AdmissionBackend: Send + Sync {
    /// Admit a request, waiting up to `timeout` in the backpressure queue if
    /// it is denied and queuing is available. `None` uses the configured default.
    async fn acquire(
        &self,
        caller_id: &str,
        endpoint: &str,
        request_class: &str,
        timeout: Option<Duration>,
    ) -> AdmissionDecision;

    /// Report how a downstream call went.
    fn record_outcome(&self, caller_id: &str, endpoint: &str, latency_ms: f64, success: bool);
}

/// Error from a guarded downstream call.
#[derive(Debug, Error)]
pub enum CallError<E> {
    /// The limiter did not admit the call; it was never made
    #[error("request throttled: {0}")]
    Throttled(AdmissionDecision),

    /// The downstream call ran and failed
    #[error("downstream call failed: {0}")]
    Downstream(E),
}

/// Run `call` only if the backend admits it, then report its latency and
/// whether it succeeded.
pub async fn guarded_call<B, F, Fut, T, E>(
    backend: &B,
    caller_id: &str,
    endpoint: &str,
    request_class: &str,
    timeout: Option<Duration>,
    call: F,
) -> Result<T, CallError<E>>
where
    B: AdmissionBackend + ?Sized,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let decision = backend
        .acquire(caller_id, endpoint, request_class, timeout)
        .await;
    if !decision.allowed {
        return Err(CallError::Throttled(decision));
    }

    let started = Instant::now();
    let result = call().await;
    let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
    backend.record_outcome(caller_id, endpoint, latency_ms, result.is_ok());

    result.map_err(CallError::Downstream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::DecisionReason;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Backend with a fixed decision that remembers reported outcomes.
    struct FixedBackend {
        decision: AdmissionDecision,
        outcomes: Mutex<Vec<(String, bool)>>,
    }

    impl FixedBackend {
        fn new(decision: AdmissionDecision) -> Self {
            Self {
                decision,
                outcomes: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl AdmissionBackend for FixedBackend {
        async fn acquire(
            &self,
            _caller_id: &str,
            _endpoint: &str,
            _request_class: &str,
            _timeout: Option<Duration>,
        ) -> AdmissionDecision {
            self.decision.clone()
        }

        fn record_outcome(&self, _caller_id: &str, endpoint: &str, _latency_ms: f64, success: bool) {
            self.outcomes.lock().push((endpoint.to_string(), success));
        }
    }

    #[tokio::test]
    async fn test_admitted_call_reports_success() {
        let backend = FixedBackend::new(AdmissionDecision::allow());
        let result: Result<u32, CallError<String>> =
            guarded_call(&backend, "user", "/v1/orders", "orders", None, || async { Ok(7) }).await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(*backend.outcomes.lock(), vec![("/v1/orders".to_string(), true)]);
    }

    #[tokio::test]
    async fn test_admitted_call_reports_failure() {
        let backend = FixedBackend::new(AdmissionDecision::allow());
        let result: Result<u32, CallError<String>> = guarded_call(
            &backend,
            "user",
            "/v1/orders",
            "orders",
            None,
            || async { Err("boom".to_string()) },
        )
        .await;

        assert!(matches!(result, Err(CallError::Downstream(ref e)) if e == "boom"));
        assert_eq!(*backend.outcomes.lock(), vec![("/v1/orders".to_string(), false)]);
    }

    #[tokio::test]
    async fn test_throttled_call_never_runs() {
        let denied = AdmissionDecision::deny(DecisionReason::CallerLimit, Duration::from_secs(3));
        let backend = FixedBackend::new(denied.clone());
        let ran = AtomicBool::new(false);
        let result: Result<u32, CallError<String>> =
            guarded_call(&backend, "user", "/v1/orders", "orders", None, || async {
                ran.store(true, Ordering::SeqCst);
                Ok(1)
            })
            .await;

        assert!(!ran.load(Ordering::SeqCst));

        match result {
            Err(CallError::Throttled(decision)) => assert_eq!(decision, denied),
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(backend.outcomes.lock().is_empty());
    }

    #[test]
    fn test_throttled_display() {
        let err: CallError<String> =
            CallError::Throttled(AdmissionDecision::deny(DecisionReason::BurstLimit, Duration::from_secs(2)));
        assert_eq!(err.to_string(), "request throttled: burst_limit, retry in 2.000s");
    }
}
