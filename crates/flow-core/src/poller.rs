//! Background polling of execution instances
//!
//! The poller fetches one instance at [`PollConfig::interval`] and forwards
//! every record through a channel. It stops on a terminal status, when the
//! receiver goes away, or when its [`PollHandle`] is stopped or dropped.
//! Failed fetches are retried with bounded backoff. The first failure is
//! followed by up to [`PollConfig::max_retries`] retries; when those fail as
//! well a [`FlowError::PollFailure`] carrying `max_retries + 1` attempts is
//! sent and polling ends.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::backend::WorkflowBackend;
use crate::config::PollConfig;
use crate::error::{FlowError, Result};
use crate::execution::ExecutionRecord;

/// Records are small and consumed promptly; a short buffer is enough
const CHANNEL_CAPACITY: usize = 16;

/// Spawns poll loops against a backend
#[derive(Clone)]
pub struct ExecutionPoller {
    backend: Arc<dyn WorkflowBackend>,
    config: PollConfig,
}

impl ExecutionPoller {
    /// Poller fetching through `backend`
    pub fn new(backend: Arc<dyn WorkflowBackend>, config: PollConfig) -> Self {
        Self { backend, config }
    }

    /// Interval and retry settings
    pub fn config(&self) -> &PollConfig {
        &self.config
    }

    /// Start polling `instance_id`
    pub fn start(
        &self,
        instance_id: impl Into<String>,
    ) -> (PollHandle, mpsc::Receiver<Result<ExecutionRecord>>) {
        let instance_id = instance_id.into();
        let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);
        let running = Arc::new(AtomicBool::new(true));

        let backend = self.backend.clone();
        let config = self.config.clone();
        let flag = running.clone();
        let id = instance_id.clone();

        log::info!(
            "Polling execution '{}' every {}ms",
            instance_id,
            config.interval_ms
        );

        let task = tokio::spawn(async move {
            let mut failures = 0u32;

            while flag.load(Ordering::SeqCst) {
                match backend.get_execution(&id).await {
                    Ok(record) => {
                        failures = 0;
                        let terminal = record.is_terminal();
                        let status = record.status.clone();
                        if sender.send(Ok(record)).await.is_err() {
                            log::debug!("Poll receiver for '{}' dropped", id);
                            break;
                        }
                        if terminal {
                            log::info!("Execution '{}' finished with {}", id, status);
                            break;
                        }
                        tokio::time::sleep(config.interval()).await;
                    }
                    Err(e) => {
                        failures += 1;
                        if failures > config.max_retries {
                            log::warn!(
                                "Giving up polling '{}' after {} attempts: {}",
                                id,
                                failures,
                                e
                            );
                            let _ = sender
                                .send(Err(FlowError::PollFailure {
                                    key: id.clone(),
                                    attempts: failures,
                                    message: e.to_string(),
                                }))
                                .await;
                            break;
                        }

                        let delay = config.backoff(failures);
                        log::debug!(
                            "Poll of '{}' failed ({}), retry {} in {}ms",
                            id,
                            e,
                            failures,
                            delay.as_millis()
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }

            flag.store(false, Ordering::SeqCst);
            log::debug!("Stopped polling '{}'", id);
        });

        let handle = PollHandle {
            instance_id,
            running,
            task: task.abort_handle(),
        };
        (handle, receiver)
    }
}

impl std::fmt::Debug for ExecutionPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionPoller")
            .field("config", &self.config)
            .finish()
    }
}

/// Owner of one poll loop; dropping it stops the loop
#[derive(Debug)]
pub struct PollHandle {
    instance_id: String,
    running: Arc<AtomicBool>,
    task: AbortHandle,
}

impl PollHandle {
    /// Instance being polled
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// The loop has not exited
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) && !self.task.is_finished()
    }

    /// Ask the loop to exit before its next fetch
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            log::debug!("Stopping poll of '{}'", self.instance_id);
        }
        self.task.abort();
    }
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
