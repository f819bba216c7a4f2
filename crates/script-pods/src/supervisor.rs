//! Supervised background loops
//!
//! Every long-running loop (pod watch, watchdogs) is spawned through a
//! [`Supervisor`], which owns the cancellation token and joins the tasks on
//! shutdown. [`retry_forever`] keeps a loop alive across unexpected failures,
//! backing off exponentially between attempts. [`retry_transient`] retries a
//! single call a bounded number of times.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::error::Result;

/// Longest wait between two attempts of a failing loop
pub const MAX_BACKOFF: Duration = Duration::from_secs(70);

/// Delay before retry number `attempt` (1-based): 1s, 2s, 4s, ... capped.
#[must_use]
pub fn backoff_delay(attempt: u32, max: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(32);
    let secs = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
    Duration::from_secs(secs).min(max)
}

/// Run `operation` until cancelled, restarting it whenever it fails.
///
/// An `Ok` return also ends the loop. A run that stayed healthy for longer than
/// the backoff cap resets the attempt counter.
pub async fn retry_forever<F, Fut>(name: &str, cancel: CancellationToken, mut operation: F)
where
    F: FnMut(CancellationToken) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut attempt = 0u32;

    loop {
        if cancel.is_cancelled() {
            break;
        }

        let started = Instant::now();
        let outcome = tokio::select! {
            () = cancel.cancelled() => break,
            outcome = operation(cancel.clone()) => outcome,
        };

        match outcome {
            Ok(()) => {
                debug!(loop_name = name, "Supervised loop finished");
                break;
            }
            Err(e) => {
                if started.elapsed() > MAX_BACKOFF {
                    attempt = 0;
                }
                attempt = attempt.saturating_add(1);
                let delay = backoff_delay(attempt, MAX_BACKOFF);
                error!(
                    loop_name = name,
                    error = %e,
                    attempt,
                    "Unexpected error in supervised loop, re-running in {:?}",
                    delay
                );

                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

/// Attempts made by [`retry_transient`] before giving up.
pub const TRANSIENT_ATTEMPTS: u32 = 4;

/// Run `operation`, retrying transient failures up to `max_attempts` times in
/// total with the same backoff as [`retry_forever`].
///
/// Non-transient errors and the last failure are returned as they are.
pub async fn retry_transient<T, F, Fut>(name: &str, max_attempts: u32, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1u32;
    loop {
        match operation().await {
            Err(e) if e.is_transient() && attempt < max_attempts => {
                let delay = backoff_delay(attempt, MAX_BACKOFF);
                warn!(
                    operation = name,
                    error = %e,
                    attempt,
                    "Transient failure, retrying in {:?}",
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            outcome => return outcome,
        }
    }
}

/// Owner of the agent's background tasks.
#[derive(Debug, Clone, Default)]
pub struct Supervisor {
    token: CancellationToken,
    tracker: TaskTracker,
}

impl Supervisor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Token cancelled when the supervisor shuts down.
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Spawn a supervised loop that is restarted with backoff on failure.
    pub fn spawn_loop<F, Fut>(&self, name: &'static str, operation: F)
    where
        F: FnMut(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let cancel = self.token.clone();
        info!(loop_name = name, "Starting supervised loop");
        self.tracker
            .spawn(async move { retry_forever(name, cancel, operation).await });
    }

    /// Cancel every task and wait up to `grace` for them to unwind.
    ///
    /// Returns `false` when some task was still running after the grace period;
    /// those are left for the runtime to drop.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.token.cancel();
        self.tracker.close();

        if tokio::time::timeout(grace, self.tracker.wait()).await.is_ok() {
            info!("All supervised tasks stopped");
            true
        } else {
            warn!(
                remaining = self.tracker.len(),
                "Supervised tasks did not stop within {:?}", grace
            );
            false
        }
    }
}
