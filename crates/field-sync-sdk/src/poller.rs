use std::time::Duration;

use rand::Rng;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::agent::SessionSync;
use crate::FieldSyncApi;

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub min_delay: Duration,
    pub max_delay: Duration,
    /// Added to the delay after each empty delta.
    pub idle_step: Duration,
    /// Floor applied after a failed poll.
    pub error_delay: Duration,
    /// Upper bound of the random delay added to every wait.
    pub jitter: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(5_000),
            idle_step: Duration::from_millis(500),
            error_delay: Duration::from_millis(2_000),
            jitter: Duration::from_millis(200),
        }
    }
}

/// Adaptive poll delay: fast while the session is busy, slower while idle.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: PollerConfig,
    current: Duration,
}

impl Backoff {
    pub fn new(config: PollerConfig) -> Self {
        let current = config.min_delay;
        Self { config, current }
    }

    pub fn delay(&self) -> Duration {
        self.current
    }

    pub fn on_changes(&mut self) {
        self.current = self.config.min_delay;
    }

    pub fn on_idle(&mut self) {
        self.current = (self.current + self.config.idle_step).min(self.config.max_delay);
    }

    pub fn on_error(&mut self) {
        self.current = self
            .current
            .max(self.config.error_delay)
            .min(self.config.max_delay.max(self.config.error_delay));
    }

    fn jittered(&self) -> Duration {
        let max = self.config.jitter.as_millis() as u64;
        if max == 0 {
            return self.current;
        }
        self.current + Duration::from_millis(rand::thread_rng().gen_range(0..=max))
    }
}

/// Owns the background poll task. Dropping the handle stops the task.
pub struct PollerHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl PollerHandle {
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Stops the poller and waits for the in-flight poll, if any, to finish.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                warn!(error = %err, "field poller task ended abnormally");
            }
        }
    }
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

pub(crate) fn spawn<A: FieldSyncApi + 'static>(
    sync: SessionSync<A>,
    config: PollerConfig,
) -> PollerHandle {
    let (tx, mut rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        let mut backoff = Backoff::new(config);
        loop {
            match sync.poll_once().await {
                Ok(0) => backoff.on_idle(),
                Ok(changed) => {
                    debug!(session = %sync.session_code(), changed, "field delta applied");
                    backoff.on_changes();
                }
                Err(err) => {
                    warn!(session = %sync.session_code(), error = %err, "field poll failed");
                    backoff.on_error();
                }
            }

            let delay = backoff.jittered();
            tokio::select! {
                _ = &mut rx => break,
                _ = sync.nudged() => backoff.on_changes(),
                _ = tokio::time::sleep(delay) => {}
            }
        }
        debug!(session = %sync.session_code(), "field poller stopped");
    });
    PollerHandle {
        shutdown: Some(tx),
        task: Some(task),
    }
}
