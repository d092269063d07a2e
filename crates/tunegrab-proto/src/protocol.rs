//! Wire format of the download backend.
//!
//! Field names follow the backend's JSON exactly; everything the backend may
//! omit is `#[serde(default)]` so a partial payload still decodes.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Media kind requested from the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadMode {
    #[default]
    Audio,
    Video,
}

/// Job status as reported by the backend.
///
/// The backend is not consistent about naming: `running` and `downloading`
/// mean the same thing, as do `done` and `completed`.  Unknown strings decode
/// to `Unknown` and are ignored by reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Queued,
    Running,
    Downloading,
    Processing,
    Done,
    Completed,
    Error,
    Timeout,
    #[serde(other)]
    Unknown,
}

impl JobStatus {
    /// True when the backend will not report anything else for this job.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Done | JobStatus::Completed | JobStatus::Error | JobStatus::Timeout
        )
    }
}

/// Body of `POST /download/enqueue`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub url: String,
    pub quality: String,
    pub mode: DownloadMode,
    pub pitch: i8,
    pub speed: f32,
    pub organize: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artist: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cover_path: Option<String>,
    /// Persistence hints: lets the backend record which playlist an item came from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub playlist_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueResponse {
    pub job_id: String,
}

/// Full job state, as returned by `/download/status/{id}` and `/download/jobs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    #[serde(default)]
    pub id: String,
    pub status: JobStatus,
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub created_at: f64,
    #[serde(default)]
    pub started_at: Option<f64>,
    #[serde(default)]
    pub finished_at: Option<f64>,
}

/// `GET /download/jobs`: every job the backend knows, keyed by job id.
pub type JobsSnapshot = HashMap<String, JobSnapshot>;

/// One observation of a job, from the push channel or a poll.
///
/// Every field is optional: a missing field means "unchanged", never
/// "cleared".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobUpdate {
    #[serde(default)]
    pub status: Option<JobStatus>,
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl JobUpdate {
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    /// The reported status, unless it is one we do not understand.
    pub fn known_status(&self) -> Option<JobStatus> {
        self.status.filter(|s| *s != JobStatus::Unknown)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.map(|s| s.is_terminal()).unwrap_or(false)
    }
}

impl From<JobSnapshot> for JobUpdate {
    fn from(snapshot: JobSnapshot) -> Self {
        Self {
            status: Some(snapshot.status),
            progress: Some(snapshot.progress),
            title: snapshot.title,
            filename: snapshot.filename,
            error: snapshot.error,
        }
    }
}

/// Body of `POST /download/retry`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryRequest {
    pub playlist_id: String,
    pub video_id: String,
}

/// Body of `POST /playlist/details`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaylistRequest {
    pub url: String,
    pub limit: u32,
}

/// Response of `POST /playlist/details`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlaylistDetails {
    #[serde(default)]
    pub playlist_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub total_videos: usize,
    #[serde(default)]
    pub uploader: Option<String>,
    #[serde(default)]
    pub videos: Vec<PlaylistVideo>,
}

/// Whether the backend already holds a finished download of a listing item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaylistItemStatus {
    Downloaded,
    #[default]
    #[serde(other)]
    Pending,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaylistVideo {
    pub index: usize,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub duration_string: Option<String>,
    #[serde(default)]
    pub uploader: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub status: PlaylistItemStatus,
}

impl PlaylistVideo {
    /// Listing URL, or the watch URL built from the id when the listing had none.
    pub fn canonical_url(&self) -> String {
        match self.url.as_deref() {
            Some(url) if !url.is_empty() => url.to_string(),
            _ => watch_url(&self.id),
        }
    }

    pub fn is_downloaded(&self) -> bool {
        self.status == PlaylistItemStatus::Downloaded
    }
}

pub fn watch_url(video_id: &str) -> String {
    format!("https://www.youtube.com/watch?v={}", video_id)
}

/// Error body: the backend answers failures with `{"detail": ...}` where
/// `detail` is either a string or a list of validation errors.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorBody {
    pub detail: serde_json::Value,
}

impl ErrorBody {
    pub fn message(&self) -> String {
        match &self.detail {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}
