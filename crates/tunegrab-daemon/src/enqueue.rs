//! Enqueue client: submits one admitted entry to the backend.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use tunegrab_proto::protocol::EnqueueRequest;

use crate::client::JobBackend;
use crate::core::QueueEvent;
use crate::entry::QueueEntry;

/// Build the `POST /download/enqueue` body for an entry.
///
/// Uploader and thumbnail travel as `artist` and `cover_path` so the backend
/// can tag the output; provenance ids let it mark playlist items downloaded.
pub fn request_for(entry: &QueueEntry) -> EnqueueRequest {
    let params = &entry.params;
    EnqueueRequest {
        url: entry.source.url.clone(),
        quality: params.quality().to_string(),
        mode: params.mode(),
        pitch: params.pitch(),
        speed: params.speed(),
        organize: params.organize(),
        title: Some(entry.title.clone()).filter(|t| !t.is_empty()),
        artist: entry.source.uploader.clone(),
        cover_path: entry.source.thumbnail.clone(),
        playlist_id: entry.provenance.playlist_id.clone(),
        video_id: entry.provenance.video_id.clone(),
    }
}

/// Fire the enqueue call in its own task; the outcome comes back to the core
/// as [`QueueEvent::Enqueued`].  No automatic retry.
pub fn spawn(
    backend: Arc<dyn JobBackend>,
    entry: &QueueEntry,
    event_tx: mpsc::Sender<QueueEvent>,
) -> tokio::task::JoinHandle<()> {
    let id = entry.unique_id;
    let request = request_for(entry);
    tokio::spawn(async move {
        debug!("Enqueue {}: {}", id, request.url);
        let result = backend.enqueue(request).await;
        if let Err(e) = &result {
            warn!("Enqueue {} failed: {}", id, e);
        }
        if event_tx.send(QueueEvent::Enqueued { id, result }).await.is_err() {
            debug!("Enqueue {}: queue core is gone", id);
        }
    })
}
