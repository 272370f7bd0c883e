//! Backpressure queue for denied callers.
//!
//! Callers that would rather wait than fail are parked in a bounded FIFO. A
//! single worker sweeps the whole queue on every pass, re-running the
//! admission check for each entry in order, so one blocked caller never
//! holds up the callers behind it. Entries leave the queue when they are
//! admitted, when their caller gives up, or when their deadline passes.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};
use uuid::Uuid;

use super::admission::{AdmissionCheck, AdmissionDecision, DecisionReason};
use super::class::RequestClass;

const MIN_PAUSE: Duration = Duration::from_millis(1);

/// A caller parked in the queue.
struct QueuedRequest {
    id: Uuid,
    caller_id: String,
    endpoint: String,
    class: RequestClass,
    enqueued_at: Instant,
    deadline: Instant,
    responder: oneshot::Sender<AdmissionDecision>,
}

#[derive(Default)]
struct QueueState {
    entries: VecDeque<QueuedRequest>,
    /// Set once the worker has drained the queue for shutdown
    closed: bool,
}

/// Bounded FIFO of callers waiting for admission.
pub struct BackpressureQueue {
    enabled: bool,
    capacity: usize,
    poll_interval: Duration,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl BackpressureQueue {
    pub fn new(enabled: bool, capacity: usize, poll_interval: Duration) -> Self {
        Self {
            enabled,
            capacity,
            poll_interval,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Callers currently parked.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fill ratio between 0 and 1.
    pub fn utilization(&self) -> f64 {
        (self.len() as f64 / self.capacity as f64).min(1.0)
    }

    /// Park a caller until it is admitted or `timeout` elapses.
    pub async fn enqueue(
        &self,
        caller_id: &str,
        endpoint: &str,
        class: RequestClass,
        timeout: Duration,
    ) -> AdmissionDecision {
        if !self.enabled {
            return AdmissionDecision::deny(DecisionReason::QueueFull, timeout);
        }

        let now = Instant::now();
        let id = Uuid::new_v4();
        let (responder, mut response) = oneshot::channel();
        {
            let mut state = self.state.lock();
            if state.closed || state.entries.len() >= self.capacity {
                debug!(
                    caller = %caller_id,
                    capacity = self.capacity,
                    closed = state.closed,
                    "Backpressure queue not accepting requests"
                );
                return AdmissionDecision::deny(DecisionReason::QueueFull, timeout);
            }
            state.entries.push_back(QueuedRequest {
                id,
                caller_id: caller_id.to_string(),
                endpoint: endpoint.to_string(),
                class,
                enqueued_at: now,
                deadline: now + timeout,
                responder,
            });
        }
        self.notify.notify_one();
        trace!(id = %id, caller = %caller_id, endpoint = %endpoint, "Request queued");

        match tokio::time::timeout(timeout, &mut response).await {
            Ok(Ok(decision)) => decision,
            // The worker dropped the entry at its deadline
            Ok(Err(_)) => {
                debug!(id = %id, caller = %caller_id, "Queued request expired");
                AdmissionDecision::deny(DecisionReason::QueueTimeout, Duration::ZERO)
            }
            Err(_) => {
                // The worker answers under the state lock, so once the entry
                // is gone from the queue any answer is already in the channel.
                if !self.withdraw(id) {
                    if let Ok(decision) = response.try_recv() {
                        return decision;
                    }
                }
                debug!(id = %id, caller = %caller_id, "Queued request timed out");
                AdmissionDecision::deny(DecisionReason::QueueTimeout, Duration::ZERO)
            }
        }
    }

    /// Remove an entry whose caller stopped waiting. Returns whether it was
    /// still queued.
    fn withdraw(&self, id: Uuid) -> bool {
        let mut state = self.state.lock();
        let before = state.entries.len();
        state.entries.retain(|request| request.id != id);
        state.entries.len() != before
    }

    /// Worker loop. Sweeps the queue whenever a caller arrives or the
    /// shortest suggested wait elapses, until `cancel` fires. Everything still
    /// queued then gets a final admission check.
    pub async fn run<C>(&self, checker: &C, cancel: CancellationToken)
    where
        C: AdmissionCheck + ?Sized,
    {
        debug!("Backpressure queue worker started");
        let mut pause = self.poll_interval;

        loop {
            let idle = self.is_empty();
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(pause), if !idle => {}
            }
            pause = self.sweep(checker, Instant::now());
        }

        let drained = self.drain(checker);
        info!(drained = drained, "Backpressure queue worker stopped");
    }

    /// One pass over the queue. Returns how long to wait before the next.
    ///
    /// Each entry is checked where it sits and only removed once resolved, so
    /// a panicking check leaves the queue intact for the restarted worker.
    fn sweep<C>(&self, checker: &C, now: Instant) -> Duration
    where
        C: AdmissionCheck + ?Sized,
    {
        let mut state = self.state.lock();
        let mut pause = self.poll_interval;
        let mut index = 0;

        while index < state.entries.len() {
            let request = &state.entries[index];
            let answer = if request.responder.is_closed() {
                debug!(id = %request.id, "Queued caller gave up");
                None
            } else if now >= request.deadline {
                debug!(id = %request.id, "Queued request expired");
                None
            } else {
                let decision =
                    checker.check(&request.caller_id, &request.endpoint, request.class, now);
                if !decision.allowed {
                    pause = pause
                        .min(decision.wait())
                        .min(request.deadline.saturating_duration_since(now));
                    index += 1;
                    continue;
                }
                trace!(
                    id = %request.id,
                    waited_ms = now.saturating_duration_since(request.enqueued_at).as_millis() as u64,
                    "Queued request admitted"
                );
                Some(decision)
            };

            if let Some(request) = state.entries.remove(index) {
                if let Some(decision) = answer {
                    let _ = request.responder.send(decision);
                }
            }
        }

        pause.max(MIN_PAUSE)
    }

    /// Close the queue and resolve every entry with one last check.
    fn drain<C>(&self, checker: &C) -> usize
    where
        C: AdmissionCheck + ?Sized,
    {
        let mut state = self.state.lock();
        state.closed = true;
        let now = Instant::now();
        let mut drained = 0usize;
        while let Some(request) = state.entries.pop_front() {
            if request.responder.is_closed() {
                continue;
            }
            let decision = checker.check(&request.caller_id, &request.endpoint, request.class, now);
            let _ = request.responder.send(decision);
            drained += 1;
        }
        drained
    }
}
