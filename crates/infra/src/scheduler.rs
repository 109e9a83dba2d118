//! Fixed-interval background loops.
//!
//! Each loop runs one iteration, then sleeps its interval; iterations never
//! overlap. Cancellation is graceful: an in-flight iteration finishes, the
//! sleep is cut short.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A named periodic task, not yet started.
#[derive(Debug, Clone)]
pub struct PeriodicLoop {
    name: String,
    interval: Duration,
}

impl PeriodicLoop {
    pub fn new(name: impl Into<String>, interval: Duration) -> Self {
        Self {
            name: name.into(),
            interval,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Spawn the loop on the current tokio runtime.
    ///
    /// The loop stops when `shutdown` (or the returned handle) is cancelled.
    pub fn spawn<F, Fut>(self, shutdown: &CancellationToken, mut iteration: F) -> LoopHandle
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = shutdown.child_token();
        let loop_token = token.clone();
        let name = self.name.clone();
        let interval = self.interval;

        let join = tokio::spawn(async move {
            info!(loop_name = %name, interval_ms = interval.as_millis() as u64, "loop started");

            loop {
                if loop_token.is_cancelled() {
                    break;
                }

                iteration().await;

                tokio::select! {
                    biased;

                    _ = loop_token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }

            info!(loop_name = %name, "loop stopped");
        });

        LoopHandle {
            name: self.name,
            token,
            join: Some(join),
        }
    }
}

/// Handle to a running loop.
#[derive(Debug)]
pub struct LoopHandle {
    name: String,
    token: CancellationToken,
    join: Option<JoinHandle<()>>,
}

impl LoopHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask the loop to stop after its current iteration.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().map_or(true, |j| j.is_finished())
    }

    /// Cancel and wait for the loop to exit.
    pub async fn shutdown(mut self) {
        self.token.cancel();
        if let Some(join) = self.join.take() {
            if let Err(err) = join.await {
                warn!(loop_name = %self.name, error = %err, "loop task ended abnormally");
            } else {
                debug!(loop_name = %self.name, "loop joined");
            }
        }
    }
}
