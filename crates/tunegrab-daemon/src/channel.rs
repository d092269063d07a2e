//! Per-job status channel.
//!
//! Subscribes to the backend's push socket for one job and forwards every
//! message to the queue core.  When the socket cannot be opened or drops
//! before the job finishes, the channel keeps tracking the job by polling
//! its status endpoint.  The task ends after a terminal status.

use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use tunegrab_proto::protocol::JobUpdate;

use crate::client::JobBackend;
use crate::core::QueueEvent;
use crate::entry::EntryId;
use crate::error::ClientError;

/// Live subscription for one `(entry, job)` pair.  Dropping it aborts the task.
#[derive(Debug)]
pub struct JobChannel {
    job_id: String,
    task: AbortHandle,
}

impl JobChannel {
    pub fn open(
        backend: Arc<dyn JobBackend>,
        id: EntryId,
        job_id: String,
        event_tx: mpsc::Sender<QueueEvent>,
        fallback_interval: Duration,
    ) -> Self {
        debug!("Job channel {} open for {}", job_id, id);
        let task = tokio::spawn(run(
            backend,
            id,
            job_id.clone(),
            event_tx,
            fallback_interval,
        ))
        .abort_handle();
        Self { job_id, task }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for JobChannel {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// What the caller should do after handing an update to the core.
enum Delivery {
    Continue,
    Done,
}

async fn deliver(
    event_tx: &mpsc::Sender<QueueEvent>,
    id: EntryId,
    job_id: &str,
    update: JobUpdate,
) -> Delivery {
    let terminal = update.is_terminal();
    let event = QueueEvent::Observed {
        id,
        job_id: job_id.to_string(),
        update,
    };
    if event_tx.send(event).await.is_err() || terminal {
        Delivery::Done
    } else {
        Delivery::Continue
    }
}

async fn run(
    backend: Arc<dyn JobBackend>,
    id: EntryId,
    job_id: String,
    event_tx: mpsc::Sender<QueueEvent>,
    fallback_interval: Duration,
) {
    match backend.subscribe(&job_id).await {
        Ok(mut updates) => {
            while let Some(item) = updates.next().await {
                match item {
                    Ok(update) => {
                        if let Delivery::Done = deliver(&event_tx, id, &job_id, update).await {
                            return;
                        }
                    }
                    Err(ClientError::Decode(e)) => {
                        debug!("Job channel {}: skipping malformed message: {}", job_id, e);
                    }
                    Err(e) => {
                        warn!("Job channel {} dropped: {}", job_id, e);
                        break;
                    }
                }
            }
            info!("Job channel {}: push closed early, polling instead", job_id);
        }
        Err(e) => {
            info!("Job channel {}: push unavailable ({}), polling instead", job_id, e);
        }
    }

    poll(backend, id, job_id, event_tx, fallback_interval).await;
}

async fn poll(
    backend: Arc<dyn JobBackend>,
    id: EntryId,
    job_id: String,
    event_tx: mpsc::Sender<QueueEvent>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        match backend.job_status(&job_id).await {
            Ok(snapshot) => {
                let update = JobUpdate::from(snapshot);
                if let Delivery::Done = deliver(&event_tx, id, &job_id, update).await {
                    return;
                }
            }
            Err(ClientError::NotFound(_)) => {
                warn!("Job channel {}: backend no longer knows the job", job_id);
                let _ = event_tx
                    .send(QueueEvent::ChannelFailed {
                        id,
                        job_id: job_id.clone(),
                        error: ClientError::NotFound(job_id),
                    })
                    .await;
                return;
            }
            // Stale-but-safe: keep the last known values and try again.
            Err(e) => debug!("Job channel {}: status poll failed: {}", job_id, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeBackend;
    use tunegrab_proto::protocol::{DownloadMode, EnqueueRequest, JobStatus};

    async fn enqueue(fake: &FakeBackend) -> String {
        fake.enqueue(EnqueueRequest {
            url: "https://www.youtube.com/watch?v=a".into(),
            quality: "320".into(),
            mode: DownloadMode::Audio,
            pitch: 0,
            speed: 1.0,
            organize: false,
            title: None,
            artist: None,
            cover_path: None,
            playlist_id: None,
            video_id: None,
        })
        .await
        .unwrap()
    }

    fn open(
        fake: &Arc<FakeBackend>,
        id: u64,
        job_id: &str,
        tx: mpsc::Sender<QueueEvent>,
    ) -> JobChannel {
        JobChannel::open(
            fake.clone(),
            EntryId(id),
            job_id.to_string(),
            tx,
            Duration::from_millis(10),
        )
    }

    async fn next_event(rx: &mut mpsc::Receiver<QueueEvent>) -> QueueEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("no event from channel")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn test_push_messages_are_forwarded_until_terminal() {
        let fake = Arc::new(FakeBackend::new());
        let job_id = enqueue(&fake).await;
        fake.push(&job_id, r#"{"status": "downloading", "progress": 12}"#);
        fake.push(&job_id, r#"{"status": "completed", "progress": 100}"#);

        let (tx, mut rx) = mpsc::channel(16);
        let channel = open(&fake, 1, &job_id, tx);

        match next_event(&mut rx).await {
            QueueEvent::Observed { id, job_id: j, update } => {
                assert_eq!(id, EntryId(1));
                assert_eq!(j, job_id);
                assert_eq!(update.progress, Some(12.0));
            }
            other => panic!("unexpected event {:?}", other),
        }
        match next_event(&mut rx).await {
            QueueEvent::Observed { update, .. } => {
                assert_eq!(update.status, Some(JobStatus::Completed))
            }
            other => panic!("unexpected event {:?}", other),
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(channel.is_finished());
    }

    #[tokio::test]
    async fn test_falls_back_to_polling_without_push() {
        let fake = Arc::new(FakeBackend::new().without_push());
        let job_id = enqueue(&fake).await;
        fake.set_job(&job_id, JobStatus::Done, 100.0);

        let (tx, mut rx) = mpsc::channel(16);
        let _channel = open(&fake, 3, &job_id, tx);

        match next_event(&mut rx).await {
            QueueEvent::Observed { id, update, .. } => {
                assert_eq!(id, EntryId(3));
                assert_eq!(update.status, Some(JobStatus::Done));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_lost_job_reports_channel_failure() {
        let fake = Arc::new(FakeBackend::new().without_push());
        let job_id = enqueue(&fake).await;
        fake.forget(&job_id);

        let (tx, mut rx) = mpsc::channel(16);
        let _channel = open(&fake, 4, &job_id, tx);

        match next_event(&mut rx).await {
            QueueEvent::ChannelFailed { id, job_id: j, error } => {
                assert_eq!(id, EntryId(4));
                assert_eq!(j, job_id);
                assert!(matches!(error, ClientError::NotFound(_)));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_drop_stops_the_task() {
        let fake = Arc::new(FakeBackend::new().without_push());
        let job_id = enqueue(&fake).await;

        let (tx, mut rx) = mpsc::channel(16);
        let channel = open(&fake, 5, &job_id, tx);
        // first poll reports `queued`
        assert!(matches!(next_event(&mut rx).await, QueueEvent::Observed { .. }));
        drop(channel);

        tokio::time::sleep(Duration::from_millis(30)).await;
        while rx.try_recv().is_ok() {}
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }
}
