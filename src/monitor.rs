//! Health monitor: restarts the control server if it goes down on its own.
//!
//! Runs on its own timer, independent of the accept loop. A restart is
//! `stop`, a short backoff, then `start`; attempts are bounded and the
//! counter resets after every successful restart. Once the budget is spent
//! the monitor records a terminal error and stops trying.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Something the monitor can observe and restart.
pub trait Supervised: Send + Sync + 'static {
    fn is_running(&self) -> bool;

    /// False after an explicit operator stop; the monitor leaves it alone.
    fn should_be_running(&self) -> bool;

    fn start(&self) -> impl Future<Output = Result<(), String>> + Send;

    fn stop(&self) -> impl Future<Output = Result<(), String>> + Send;

    fn on_terminal_failure(&self, _message: &str) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthConfig {
    pub interval: Duration,
    pub cooldown: Duration,
    pub backoff: Duration,
    pub max_retries: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            cooldown: Duration::from_secs(30),
            backoff: Duration::from_millis(500),
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorStatus {
    /// Consecutive failed restarts since the last success.
    pub retries: u32,
    pub restarts: u64,
    pub last_failure: Option<String>,
    pub terminal_error: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct MonitorHandle(Arc<Mutex<MonitorStatus>>);

impl MonitorHandle {
    pub fn snapshot(&self) -> MonitorStatus {
        self.0.lock().clone()
    }
}

pub struct HealthMonitor<S> {
    target: Arc<S>,
    config: HealthConfig,
    status: MonitorHandle,
}

impl<S: Supervised> HealthMonitor<S> {
    pub fn new(target: Arc<S>, config: HealthConfig) -> Self {
        Self {
            target,
            config,
            status: MonitorHandle::default(),
        }
    }

    pub fn handle(&self) -> MonitorHandle {
        self.status.clone()
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; the server was just started.
        ticker.tick().await;

        let mut down_since: Option<Instant> = None;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if self.target.is_running() || !self.target.should_be_running() {
                down_since = None;
                continue;
            }
            let since = *down_since.get_or_insert_with(|| {
                tracing::warn!("server found down, waiting out cooldown before restart");
                Instant::now()
            });
            if since.elapsed() < self.config.cooldown {
                continue;
            }

            match self.restart().await {
                Ok(()) => down_since = None,
                Err(()) => {
                    if self.status.0.lock().terminal_error.is_some() {
                        break;
                    }
                    down_since = Some(Instant::now());
                }
            }
        }
        tracing::debug!("health monitor exited");
    }

    async fn restart(&self) -> Result<(), ()> {
        let attempt = self.status.0.lock().retries + 1;
        tracing::info!(attempt, max = self.config.max_retries, "restarting control server");

        if let Err(e) = self.target.stop().await {
            tracing::warn!(error = %e, "stop before restart failed");
        }
        tokio::time::sleep(self.config.backoff).await;
        if !self.target.should_be_running() {
            tracing::info!("server was shut down during restart backoff, not restarting");
            return Ok(());
        }

        match self.target.start().await {
            Ok(()) => {
                let mut status = self.status.0.lock();
                status.retries = 0;
                status.restarts += 1;
                status.last_failure = None;
                tracing::info!(restarts = status.restarts, "control server restarted");
                Ok(())
            }
            Err(e) => {
                let terminal = {
                    let mut status = self.status.0.lock();
                    status.retries = attempt;
                    status.last_failure = Some(e.clone());
                    if attempt >= self.config.max_retries {
                        let message = format!(
                            "server restart failed {attempt} time(s), giving up: {e}"
                        );
                        status.terminal_error = Some(message.clone());
                        Some(message)
                    } else {
                        None
                    }
                };
                match terminal {
                    Some(message) => {
                        tracing::error!("{message}");
                        self.target.on_terminal_failure(&message);
                    }
                    None => tracing::warn!(attempt, error = %e, "restart attempt failed"),
                }
                Err(())
            }
        }
    }
}
