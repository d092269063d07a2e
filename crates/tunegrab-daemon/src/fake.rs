//! In-memory backend for unit tests.

use futures_util::future::BoxFuture;
use futures_util::{FutureExt, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tokio::sync::mpsc;

use tunegrab_proto::protocol::{
    EnqueueRequest, JobSnapshot, JobStatus, JobUpdate, JobsSnapshot, PlaylistDetails,
    PlaylistRequest, RetryRequest,
};

use crate::client::{JobBackend, UpdateStream};
use crate::error::ClientError;

type PushSender = mpsc::UnboundedSender<Result<JobUpdate, ClientError>>;
type PushReceiver = mpsc::UnboundedReceiver<Result<JobUpdate, ClientError>>;

#[derive(Default)]
struct FakeState {
    next_job: u64,
    enqueued: Vec<(String, EnqueueRequest)>,
    failing_urls: HashSet<String>,
    jobs: JobsSnapshot,
    pushes: HashMap<String, (PushSender, Option<PushReceiver>)>,
    push_disabled: bool,
    retries: Vec<RetryRequest>,
    reject_retry: bool,
    offline: bool,
    failed_polls: usize,
    playlist: Option<PlaylistDetails>,
}

impl FakeState {
    fn unreachable(&mut self) -> Option<ClientError> {
        if !self.offline {
            return None;
        }
        self.failed_polls += 1;
        Some(ClientError::Rejected {
            status: 503,
            detail: "backend unavailable".into(),
        })
    }

    fn push_channel(&mut self, job_id: &str) -> &mut (PushSender, Option<PushReceiver>) {
        self.pushes.entry(job_id.to_string()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            (tx, Some(rx))
        })
    }
}

/// Accepts every enqueue (unless told otherwise) and keeps each job `queued`
/// until a test moves it.
#[derive(Default)]
pub(crate) struct FakeBackend {
    state: Mutex<FakeState>,
}

impl FakeBackend {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Refuse websocket subscriptions so channels fall back to polling.
    pub(crate) fn without_push(self) -> Self {
        self.lock().push_disabled = true;
        self
    }

    pub(crate) fn with_playlist(self, details: PlaylistDetails) -> Self {
        self.lock().playlist = Some(details);
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub(crate) fn fail_enqueue(&self, url: &str) {
        self.lock().failing_urls.insert(url.to_string());
    }

    pub(crate) fn reject_retry(&self) {
        self.lock().reject_retry = true;
    }

    pub(crate) fn enqueued(&self) -> Vec<(String, EnqueueRequest)> {
        self.lock().enqueued.clone()
    }

    pub(crate) fn retries(&self) -> Vec<RetryRequest> {
        self.lock().retries.clone()
    }

    /// Deliver a raw JSON message on the job's push channel.
    pub(crate) fn push(&self, job_id: &str, json: &str) {
        let update = JobUpdate::from_json(json).unwrap();
        let mut state = self.lock();
        let _ = state.push_channel(job_id).0.send(Ok(update));
    }

    /// Change what polling sees for a job.
    pub(crate) fn set_job(&self, job_id: &str, status: JobStatus, progress: f64) {
        let mut state = self.lock();
        if let Some(job) = state.jobs.get_mut(job_id) {
            job.status = status;
            job.progress = progress;
        }
    }

    /// While offline every status and snapshot poll fails like a network blip.
    pub(crate) fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    pub(crate) fn failed_polls(&self) -> usize {
        self.lock().failed_polls
    }

    /// Make the backend forget a job: polling it now returns 404.
    pub(crate) fn forget(&self, job_id: &str) {
        self.lock().jobs.remove(job_id);
    }
}

impl JobBackend for FakeBackend {
    fn enqueue(&self, request: EnqueueRequest) -> BoxFuture<'static, Result<String, ClientError>> {
        let mut state = self.lock();
        let result = if state.failing_urls.contains(&request.url) {
            Err(ClientError::Rejected {
                status: 500,
                detail: "boom".into(),
            })
        } else {
            state.next_job += 1;
            let job_id = format!("job-{}", state.next_job);
            state.jobs.insert(
                job_id.clone(),
                JobSnapshot {
                    id: job_id.clone(),
                    status: JobStatus::Queued,
                    progress: 0.0,
                    title: None,
                    filename: None,
                    error: None,
                    created_at: 0.0,
                    started_at: None,
                    finished_at: None,
                },
            );
            state.enqueued.push((job_id.clone(), request));
            Ok(job_id)
        };
        async move { result }.boxed()
    }

    fn job_status(&self, job_id: &str) -> BoxFuture<'static, Result<JobSnapshot, ClientError>> {
        let mut state = self.lock();
        let result = match state.unreachable() {
            Some(e) => Err(e),
            None => state
                .jobs
                .get(job_id)
                .cloned()
                .ok_or_else(|| ClientError::NotFound(job_id.to_string())),
        };
        async move { result }.boxed()
    }

    fn jobs(&self) -> BoxFuture<'static, Result<JobsSnapshot, ClientError>> {
        let mut state = self.lock();
        let result = match state.unreachable() {
            Some(e) => Err(e),
            None => Ok(state.jobs.clone()),
        };
        async move { result }.boxed()
    }

    fn subscribe(&self, job_id: &str) -> BoxFuture<'static, Result<UpdateStream, ClientError>> {
        let mut state = self.lock();
        let result = if state.push_disabled {
            Err(ClientError::Rejected {
                status: 403,
                detail: "websocket refused".into(),
            })
        } else {
            match state.push_channel(job_id).1.take() {
                Some(rx) => {
                    let stream = futures_util::stream::unfold(rx, |mut rx| async move {
                        rx.recv().await.map(|item| (item, rx))
                    })
                    .boxed();
                    Ok(stream)
                }
                None => Err(ClientError::Rejected {
                    status: 409,
                    detail: "already subscribed".into(),
                }),
            }
        };
        async move { result }.boxed()
    }

    fn retry(&self, request: RetryRequest) -> BoxFuture<'static, Result<(), ClientError>> {
        let mut state = self.lock();
        let result = if state.reject_retry {
            Err(ClientError::Rejected {
                status: 404,
                detail: "Playlist item not found".into(),
            })
        } else {
            state.retries.push(request);
            Ok(())
        };
        async move { result }.boxed()
    }

    fn playlist_details(
        &self,
        request: PlaylistRequest,
    ) -> BoxFuture<'static, Result<PlaylistDetails, ClientError>> {
        let result = self.lock().playlist.clone().ok_or(ClientError::Rejected {
            status: 400,
            detail: format!("not a playlist: {}", request.url),
        });
        async move { result }.boxed()
    }
}
