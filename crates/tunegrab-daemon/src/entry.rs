//! Queue entry model: one user-requested download and the patches applied to it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use tunegrab_proto::config::{DefaultsConfig, PITCH_RANGE, SPEED_RANGE};
use tunegrab_proto::protocol::{DownloadMode, PlaylistVideo};

/// Client-side identifier of an entry.  Allocated by the store, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(pub u64);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Canonical entry status.  Backend aliases are folded in by reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Pending,
    Queued,
    Downloading,
    Processing,
    Completed,
    Error,
}

impl EntryStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EntryStatus::Completed | EntryStatus::Error)
    }

    /// The backend has picked the job up and is working on it.
    pub fn has_started(&self) -> bool {
        matches!(self, EntryStatus::Downloading | EntryStatus::Processing)
    }

    pub fn label(&self) -> &'static str {
        match self {
            EntryStatus::Pending => "pending",
            EntryStatus::Queued => "queued",
            EntryStatus::Downloading => "downloading",
            EntryStatus::Processing => "processing",
            EntryStatus::Completed => "completed",
            EntryStatus::Error => "error",
        }
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Who set the current status: the client optimistically, or the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusOrigin {
    Local,
    Confirmed,
}

/// Why an entry ended up in `error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    /// The enqueue call failed (network or backend rejection).
    Admission,
    /// The status subscription could not be kept alive.
    Channel,
    /// The backend reported a failure while downloading or processing.
    Job,
    /// The backend gave up waiting for the job to finish.
    Timeout,
}

impl ErrorKind {
    pub fn default_message(&self) -> &'static str {
        match self {
            ErrorKind::Admission => "Failed to enqueue download",
            ErrorKind::Channel => "Lost track of the download job",
            ErrorKind::Job => "Download failed",
            ErrorKind::Timeout => "Download timed out",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntryFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl EntryFailure {
    pub fn new(kind: ErrorKind, message: Option<String>) -> Self {
        let message = message
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| kind.default_message().to_string());
        Self { kind, message }
    }
}

/// Reference to the remote media item plus what the UI shows for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRef {
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub uploader: Option<String>,
    #[serde(default)]
    pub duration: Option<String>,
}

impl SourceRef {
    pub fn from_video(video: &PlaylistVideo) -> Self {
        Self {
            id: video.id.clone(),
            url: video.canonical_url(),
            title: video.title.clone(),
            thumbnail: video.thumbnail.clone(),
            uploader: video.uploader.clone(),
            duration: video.duration_string.clone(),
        }
    }
}

/// Where an entry came from, forwarded to the backend so it can record it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    #[serde(default)]
    pub playlist_id: Option<String>,
    #[serde(default)]
    pub video_id: Option<String>,
}

impl Provenance {
    pub fn playlist_item(playlist_id: &str, video_id: &str) -> Self {
        Self {
            playlist_id: Some(playlist_id.to_string()).filter(|s| !s.is_empty()),
            video_id: Some(video_id.to_string()).filter(|s| !s.is_empty()),
        }
    }

    /// Both ids, when the backend can be asked to re-admit the item.
    pub fn retry_key(&self) -> Option<(&str, &str)> {
        Some((self.playlist_id.as_deref()?, self.video_id.as_deref()?))
    }
}

/// Transform settings captured when an entry is added.
///
/// Built only through [`TransformParams::new`], which clamps to the ranges the
/// backend accepts.  Video downloads are never pitch-shifted or re-timed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransformParams {
    pitch: i8,
    speed: f32,
    quality: String,
    mode: DownloadMode,
    organize: bool,
}

impl TransformParams {
    pub fn new(pitch: i8, speed: f32, quality: String, mode: DownloadMode, organize: bool) -> Self {
        let (pitch, speed) = match mode {
            DownloadMode::Audio => (
                pitch.clamp(*PITCH_RANGE.start(), *PITCH_RANGE.end()),
                speed.clamp(*SPEED_RANGE.start(), *SPEED_RANGE.end()),
            ),
            DownloadMode::Video => (0, 1.0),
        };
        Self {
            pitch,
            speed,
            quality,
            mode,
            organize,
        }
    }

    pub fn from_defaults(defaults: &DefaultsConfig) -> Self {
        Self::new(
            defaults.pitch,
            defaults.speed,
            defaults.quality.clone(),
            defaults.mode,
            defaults.organize,
        )
    }

    pub fn pitch(&self) -> i8 {
        self.pitch
    }

    pub fn speed(&self) -> f32 {
        self.speed
    }

    pub fn quality(&self) -> &str {
        &self.quality
    }

    pub fn mode(&self) -> DownloadMode {
        self.mode
    }

    pub fn organize(&self) -> bool {
        self.organize
    }
}

/// An entry before the store gives it an id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEntry {
    pub source: SourceRef,
    pub params: TransformParams,
    pub provenance: Provenance,
}

impl NewEntry {
    pub fn new(source: SourceRef, params: TransformParams) -> Self {
        let provenance = Provenance {
            playlist_id: None,
            video_id: Some(source.id.clone()).filter(|s| !s.is_empty()),
        };
        Self {
            source,
            params,
            provenance,
        }
    }

    pub fn with_provenance(mut self, provenance: Provenance) -> Self {
        self.provenance = provenance;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueEntry {
    pub unique_id: EntryId,
    pub source: SourceRef,
    pub params: TransformParams,
    pub provenance: Provenance,
    pub job_id: Option<String>,
    pub status: EntryStatus,
    pub status_origin: StatusOrigin,
    pub progress: f64,
    pub title: String,
    pub filename: Option<String>,
    pub error: Option<EntryFailure>,
    pub added_at: DateTime<Utc>,
}

impl QueueEntry {
    pub(crate) fn new(unique_id: EntryId, new: NewEntry) -> Self {
        let title = new.source.title.clone();
        Self {
            unique_id,
            source: new.source,
            params: new.params,
            provenance: new.provenance,
            job_id: None,
            status: EntryStatus::Pending,
            status_origin: StatusOrigin::Local,
            progress: 0.0,
            title,
            filename: None,
            error: None,
            added_at: Utc::now(),
        }
    }

    /// True while the entry holds one of the concurrency slots.
    pub fn occupies_slot(&self) -> bool {
        !self.status.is_terminal()
            && (self.status != EntryStatus::Pending || self.job_id.is_some())
    }

    /// True when admission may pick this entry.
    pub fn is_admissible(&self) -> bool {
        self.status == EntryStatus::Pending && self.job_id.is_none()
    }

    /// A fresh entry for the same item: same source and provenance.
    pub fn retry_template(&self, params: TransformParams) -> NewEntry {
        NewEntry {
            source: self.source.clone(),
            params,
            provenance: self.provenance.clone(),
        }
    }

    /// One-line status for list rows and notifications.
    pub fn status_text(&self) -> String {
        match self.status {
            EntryStatus::Pending => "Waiting".to_string(),
            EntryStatus::Queued => "Queued".to_string(),
            EntryStatus::Downloading if self.progress >= 98.0 => "Finishing...".to_string(),
            EntryStatus::Downloading => format!("Downloading {:.1}%", self.progress),
            EntryStatus::Processing => "Finishing...".to_string(),
            EntryStatus::Completed => "Completed".to_string(),
            EntryStatus::Error => match &self.error {
                Some(failure) => format!("Error - {}", failure.message),
                None => "Error".to_string(),
            },
        }
    }
}

/// A partial update of an entry.  `None` fields are left alone.
///
/// Setting a non-error status clears any previous failure; setting `error`
/// implies status `error`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntryPatch {
    pub status: Option<(EntryStatus, StatusOrigin)>,
    pub progress: Option<f64>,
    pub title: Option<String>,
    pub filename: Option<String>,
    pub job_id: Option<String>,
    pub error: Option<EntryFailure>,
}

impl EntryPatch {
    pub fn status(status: EntryStatus, origin: StatusOrigin) -> Self {
        Self {
            status: Some((status, origin)),
            ..Self::default()
        }
    }

    pub fn failed(failure: EntryFailure, origin: StatusOrigin) -> Self {
        Self {
            status: Some((EntryStatus::Error, origin)),
            error: Some(failure),
            ..Self::default()
        }
    }

    pub fn bind_job(job_id: String) -> Self {
        Self {
            job_id: Some(job_id),
            ..Self::default()
        }
    }

    pub fn with_progress(mut self, progress: f64) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Apply to `entry`; returns whether anything changed.
    pub(crate) fn apply(&self, entry: &mut QueueEntry) -> bool {
        let before = entry.clone();

        if let Some((status, origin)) = self.status {
            entry.status = status;
            entry.status_origin = origin;
            if status != EntryStatus::Error {
                entry.error = None;
            }
        }
        if let Some(progress) = self.progress {
            entry.progress = progress.clamp(0.0, 100.0);
        }
        if let Some(title) = &self.title {
            entry.title = title.clone();
        }
        if let Some(filename) = &self.filename {
            entry.filename = Some(filename.clone());
        }
        if let Some(job_id) = &self.job_id {
            entry.job_id = Some(job_id.clone());
        }
        if let Some(failure) = &self.error {
            entry.status = EntryStatus::Error;
            entry.error = Some(failure.clone());
        }

        *entry != before
    }
}
