//! Supervised background tasks.
//!
//! Every long-running loop is spawned under a supervisor that restarts it if
//! it panics, and stops it when the shared cancellation token fires.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Spawn `task` and restart it whenever it panics, until it returns normally
/// or `cancel` has fired.
pub fn spawn_supervised<F, Fut>(name: &'static str, cancel: CancellationToken, task: F) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            match tokio::spawn(task()).await {
                Ok(()) => break,
                Err(e) if e.is_panic() => {
                    if cancel.is_cancelled() {
                        error!(task = name, "Background task panicked during shutdown");
                        break;
                    }
                    error!(task = name, "Background task panicked, restarting");
                }
                Err(e) => {
                    warn!(task = name, error = %e, "Background task aborted");
                    break;
                }
            }
        }
        debug!(task = name, "Background task stopped");
    })
}

/// Run `tick` every `period` until `cancel` fires. The first tick happens one
/// period after the task starts.
pub fn spawn_periodic<F>(
    name: &'static str,
    period: Duration,
    cancel: CancellationToken,
    tick: F,
) -> JoinHandle<()>
where
    F: Fn(Instant) + Send + Sync + 'static,
{
    let tick = Arc::new(tick);
    let token = cancel.clone();
    spawn_supervised(name, cancel, move || {
        let tick = tick.clone();
        let cancel = token.clone();
        async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    at = interval.tick() => tick(at),
                }
            }
        }
    })
}
