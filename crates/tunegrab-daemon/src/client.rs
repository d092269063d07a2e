//! Client side of the download backend.
//!
//! [`JobBackend`] is the seam the queue core talks through; [`HttpBackend`]
//! implements it over reqwest (REST) and tokio-tungstenite (push channel).

use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use futures_util::{FutureExt, StreamExt};
use std::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::debug;

use tunegrab_proto::config::BackendConfig;
use tunegrab_proto::protocol::{
    EnqueueRequest, EnqueueResponse, ErrorBody, JobSnapshot, JobUpdate, JobsSnapshot,
    PlaylistDetails, PlaylistRequest, RetryRequest,
};

use crate::error::ClientError;

/// Live stream of updates for one job.  Ends when the backend closes it.
pub type UpdateStream = BoxStream<'static, Result<JobUpdate, ClientError>>;

/// Everything the queue needs from the backend.
///
/// Futures are boxed and `'static` so callers can move them into spawned
/// tasks without holding on to the backend.
pub trait JobBackend: Send + Sync + 'static {
    /// `POST /download/enqueue`, returning the new job id.
    fn enqueue(&self, request: EnqueueRequest) -> BoxFuture<'static, Result<String, ClientError>>;

    /// `GET /download/status/{job_id}`.
    fn job_status(&self, job_id: &str) -> BoxFuture<'static, Result<JobSnapshot, ClientError>>;

    /// `GET /download/jobs`.
    fn jobs(&self) -> BoxFuture<'static, Result<JobsSnapshot, ClientError>>;

    /// `WS /ws/download/{job_id}`.
    fn subscribe(&self, job_id: &str) -> BoxFuture<'static, Result<UpdateStream, ClientError>>;

    /// `POST /download/retry`.
    fn retry(&self, request: RetryRequest) -> BoxFuture<'static, Result<(), ClientError>>;

    /// `POST /playlist/details`.
    fn playlist_details(
        &self,
        request: PlaylistRequest,
    ) -> BoxFuture<'static, Result<PlaylistDetails, ClientError>>;
}

#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    ws_base_url: String,
    playlist_timeout: Duration,
}

impl HttpBackend {
    pub fn new(config: &BackendConfig) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        let base_url = config.base_url.trim_end_matches('/').to_string();
        Ok(Self {
            client,
            ws_base_url: ws_base_url(&base_url),
            base_url,
            playlist_timeout: config.playlist_timeout(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// `http://host` → `ws://host`, `https://host` → `wss://host`.
fn ws_base_url(base_url: &str) -> String {
    match base_url.strip_prefix("http") {
        Some(rest) => format!("ws{}", rest),
        None => base_url.to_string(),
    }
}

/// Turn non-2xx responses into `ClientError`, keeping the backend's `detail`.
async fn check(
    response: reqwest::Response,
    job_id: Option<&str>,
) -> Result<reqwest::Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == reqwest::StatusCode::NOT_FOUND {
        if let Some(job_id) = job_id {
            return Err(ClientError::NotFound(job_id.to_string()));
        }
    }
    let body = response.text().await.unwrap_or_default();
    let detail = serde_json::from_str::<ErrorBody>(&body)
        .map(|b| b.message())
        .unwrap_or(body);
    Err(ClientError::Rejected {
        status: status.as_u16(),
        detail,
    })
}

impl JobBackend for HttpBackend {
    fn enqueue(&self, request: EnqueueRequest) -> BoxFuture<'static, Result<String, ClientError>> {
        let this = self.clone();
        async move {
            let response = this
                .client
                .post(this.url("/download/enqueue"))
                .json(&request)
                .send()
                .await?;
            let body: EnqueueResponse = check(response, None).await?.json().await?;
            Ok(body.job_id)
        }
        .boxed()
    }

    fn job_status(&self, job_id: &str) -> BoxFuture<'static, Result<JobSnapshot, ClientError>> {
        let this = self.clone();
        let job_id = job_id.to_string();
        async move {
            let response = this
                .client
                .get(this.url(&format!("/download/status/{}", job_id)))
                .send()
                .await?;
            Ok(check(response, Some(&job_id)).await?.json().await?)
        }
        .boxed()
    }

    fn jobs(&self) -> BoxFuture<'static, Result<JobsSnapshot, ClientError>> {
        let this = self.clone();
        async move {
            let response = this.client.get(this.url("/download/jobs")).send().await?;
            Ok(check(response, None).await?.json().await?)
        }
        .boxed()
    }

    fn subscribe(&self, job_id: &str) -> BoxFuture<'static, Result<UpdateStream, ClientError>> {
        let url = format!("{}/ws/download/{}", self.ws_base_url, job_id);
        async move {
            debug!("Connecting job channel {}", url);
            let (ws_stream, _) = connect_async(url.as_str()).await?;
            let updates = ws_stream
                .filter_map(|msg| async move {
                    match msg {
                        Ok(Message::Text(text)) => {
                            Some(JobUpdate::from_json(&text).map_err(ClientError::from))
                        }
                        Ok(_) => None,
                        Err(e) => Some(Err(ClientError::from(e))),
                    }
                })
                .boxed();
            Ok(updates)
        }
        .boxed()
    }

    fn retry(&self, request: RetryRequest) -> BoxFuture<'static, Result<(), ClientError>> {
        let this = self.clone();
        async move {
            let response = this
                .client
                .post(this.url("/download/retry"))
                .json(&request)
                .send()
                .await?;
            check(response, None).await?;
            Ok(())
        }
        .boxed()
    }

    fn playlist_details(
        &self,
        request: PlaylistRequest,
    ) -> BoxFuture<'static, Result<PlaylistDetails, ClientError>> {
        let this = self.clone();
        async move {
            let response = this
                .client
                .post(this.url("/playlist/details"))
                .timeout(this.playlist_timeout)
                .json(&request)
                .send()
                .await?;
            Ok(check(response, None).await?.json().await?)
        }
        .boxed()
    }
}
