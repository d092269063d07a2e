//! Global job poller: periodic `GET /download/jobs` while anything is live.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::client::JobBackend;
use crate::core::QueueEvent;

pub struct JobPoller {
    backend: Arc<dyn JobBackend>,
    event_tx: mpsc::Sender<QueueEvent>,
    interval: Duration,
    task: Option<AbortHandle>,
}

impl JobPoller {
    pub fn new(
        backend: Arc<dyn JobBackend>,
        event_tx: mpsc::Sender<QueueEvent>,
        interval: Duration,
    ) -> Self {
        Self {
            backend,
            event_tx,
            interval,
            task: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Start polling.  No-op when already running.
    pub fn start(&mut self) {
        if self.is_running() {
            return;
        }
        info!("Job poller: starting ({:?} interval)", self.interval);
        let backend = Arc::clone(&self.backend);
        let event_tx = self.event_tx.clone();
        let interval = self.interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                match backend.jobs().await {
                    Ok(jobs) => {
                        if event_tx.send(QueueEvent::Snapshot(jobs)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => debug!("Job poller: fetch failed: {}", e),
                }
            }
        });
        self.task = Some(task.abort_handle());
    }

    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            info!("Job poller: stopping");
            task.abort();
        }
    }
}

impl Drop for JobPoller {
    fn drop(&mut self) {
        self.stop();
    }
}
