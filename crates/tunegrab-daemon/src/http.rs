use crate::client::JobBackend;
use crate::core::QueueHandle;
use crate::entry::{EntryId, NewEntry, Provenance, QueueEntry, SourceRef, TransformParams};
use crate::error::{QueueError, StoreError};
use crate::playlist::{self, PlaylistSelection};
use crate::store::StatusCounts;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};
use tunegrab_proto::config::Config;
use tunegrab_proto::protocol::{watch_url, DownloadMode, PlaylistVideo};

#[derive(Clone)]
struct HttpState {
    handle: QueueHandle,
    backend: Arc<dyn JobBackend>,
    config: Arc<Config>,
}

type ApiResult<T> = Result<Json<T>, (StatusCode, String)>;

#[derive(Serialize)]
struct ApiQueue {
    rev: u64,
    counts: StatusCounts,
    entries: Vec<ApiEntry>,
}

#[derive(Serialize)]
struct ApiEntry {
    #[serde(flatten)]
    entry: QueueEntry,
    status_text: String,
}

/// One item to add.  Anything not given falls back to `[defaults]`.
#[derive(Debug, Deserialize)]
struct AddItem {
    id: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    title: String,
    #[serde(default)]
    thumbnail: Option<String>,
    #[serde(default)]
    uploader: Option<String>,
    #[serde(default)]
    duration: Option<String>,
    #[serde(default)]
    playlist_id: Option<String>,
    #[serde(default)]
    pitch: Option<i8>,
    #[serde(default)]
    speed: Option<f32>,
    #[serde(default)]
    quality: Option<String>,
    #[serde(default)]
    mode: Option<DownloadMode>,
    #[serde(default)]
    organize: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct PlaylistForm {
    url: String,
    #[serde(default)]
    limit: Option<u32>,
    /// Positions in the resolved listing to queue.  Absent means every item
    /// the backend has not downloaded yet.
    #[serde(default)]
    selected: Option<Vec<usize>>,
}

/// A downloaded playlist item to fetch again.
#[derive(Debug, Deserialize)]
struct PlaylistRetryForm {
    playlist_id: String,
    item: PlaylistVideo,
}

#[derive(Serialize)]
struct Added {
    ids: Vec<EntryId>,
}

#[derive(Serialize)]
struct PlaylistAdded {
    playlist_id: String,
    title: String,
    ids: Vec<EntryId>,
    /// Items in the listing the backend already has.
    downloaded: usize,
    /// Requested positions that were out of range or already downloaded.
    ignored: Vec<usize>,
}

#[derive(Serialize)]
struct Retried {
    id: EntryId,
}

#[derive(Serialize)]
struct Cleared {
    removed: usize,
}

pub fn router(handle: QueueHandle, backend: Arc<dyn JobBackend>, config: Config) -> Router {
    let app_state = HttpState {
        handle,
        backend,
        config: Arc::new(config),
    };

    Router::new()
        .route("/api/queue", get(get_queue).post(add_item))
        .route("/api/queue/clear", post(clear_queue))
        .route("/api/queue/:id", delete(remove_entry))
        .route("/api/queue/:id/retry", post(retry_entry))
        .route("/api/playlist", post(add_playlist))
        .route("/api/playlist/retry", post(retry_playlist_item))
        .layer(CorsLayer::permissive())
        .with_state(app_state)
}

pub fn start_server(
    bind_address: String,
    port: u16,
    handle: QueueHandle,
    backend: Arc<dyn JobBackend>,
    config: Config,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = router(handle, backend, config);

        let addr = format!("{}:{}", bind_address, port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind HTTP server to {}: {}", addr, e);
                return;
            }
        };

        info!("HTTP API server listening on http://{}", addr);

        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    })
}

fn reject(err: QueueError) -> (StatusCode, String) {
    let status = match &err {
        QueueError::Store(StoreError::NotFound(_)) => StatusCode::NOT_FOUND,
        QueueError::Store(_) | QueueError::NotRetryable { .. } => StatusCode::CONFLICT,
        QueueError::Backend(_) => StatusCode::BAD_GATEWAY,
        QueueError::Closed => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, err.to_string())
}

async fn get_queue(State(state): State<HttpState>) -> Json<ApiQueue> {
    let snapshot = state.handle.snapshot();
    let entries = snapshot
        .entries
        .iter()
        .map(|e| ApiEntry {
            status_text: e.status_text(),
            entry: e.clone(),
        })
        .collect();
    Json(ApiQueue {
        rev: snapshot.rev,
        counts: snapshot.counts,
        entries,
    })
}

async fn add_item(State(state): State<HttpState>, Json(item): Json<AddItem>) -> ApiResult<Added> {
    info!("HTTP API: Add {}", item.id);
    if item.id.trim().is_empty() && item.url.as_deref().map_or(true, str::is_empty) {
        return Err((StatusCode::UNPROCESSABLE_ENTITY, "id or url required".into()));
    }

    let defaults = &state.config.defaults;
    let params = TransformParams::new(
        item.pitch.unwrap_or(defaults.pitch),
        item.speed.unwrap_or(defaults.speed),
        item.quality.unwrap_or_else(|| defaults.quality.clone()),
        item.mode.unwrap_or(defaults.mode),
        item.organize.unwrap_or(defaults.organize),
    );
    let url = match item.url {
        Some(url) if !url.is_empty() => url,
        _ => watch_url(&item.id),
    };
    let mut entry = NewEntry::new(
        SourceRef {
            id: item.id,
            url,
            title: item.title,
            thumbnail: item.thumbnail,
            uploader: item.uploader,
            duration: item.duration,
        },
        params,
    );
    if let Some(playlist_id) = item.playlist_id {
        let provenance = Provenance::playlist_item(&playlist_id, &entry.source.id);
        entry = entry.with_provenance(provenance);
    }

    let ids = state.handle.add(vec![entry]).await.map_err(reject)?;
    Ok(Json(Added { ids }))
}

async fn remove_entry(
    State(state): State<HttpState>,
    Path(id): Path<u64>,
) -> ApiResult<QueueEntry> {
    info!("HTTP API: Remove #{}", id);
    let removed = state.handle.remove(EntryId(id)).await.map_err(reject)?;
    Ok(Json(removed))
}

async fn clear_queue(State(state): State<HttpState>) -> ApiResult<Cleared> {
    info!("HTTP API: Clear");
    let removed = state.handle.clear().await.map_err(reject)?;
    Ok(Json(Cleared { removed }))
}

async fn retry_entry(State(state): State<HttpState>, Path(id): Path<u64>) -> ApiResult<Retried> {
    info!("HTTP API: Retry #{}", id);
    let id = state.handle.retry(EntryId(id)).await.map_err(reject)?;
    Ok(Json(Retried { id }))
}

/// Resolve a playlist and queue the selected items.
async fn add_playlist(
    State(state): State<HttpState>,
    Json(form): Json<PlaylistForm>,
) -> ApiResult<PlaylistAdded> {
    info!("HTTP API: Playlist {}", form.url);
    let limit = form.limit.unwrap_or(state.config.queue.playlist_limit);
    let details = playlist::fetch_details(state.backend.as_ref(), &form.url, limit)
        .await
        .map_err(|e| {
            warn!("Playlist lookup failed: {}", e);
            (StatusCode::BAD_GATEWAY, e.to_string())
        })?;

    let mut selection = PlaylistSelection::new(details);
    let mut ignored = Vec::new();
    match form.selected {
        Some(positions) => {
            selection.clear();
            for pos in positions {
                if !selection.is_selected(pos) && !selection.toggle(pos) {
                    ignored.push(pos);
                }
            }
        }
        None => selection.select_all(),
    }

    let playlist_id = selection.details().playlist_id.clone();
    let title = selection.details().title.clone();
    let downloaded = selection
        .details()
        .videos
        .iter()
        .filter(|v| v.is_downloaded())
        .count();
    let params = TransformParams::from_defaults(&state.config.defaults);

    let ids = state
        .handle
        .add(selection.into_entries(&params))
        .await
        .map_err(reject)?;
    Ok(Json(PlaylistAdded {
        playlist_id,
        title,
        ids,
        downloaded,
        ignored,
    }))
}

async fn retry_playlist_item(
    State(state): State<HttpState>,
    Json(form): Json<PlaylistRetryForm>,
) -> ApiResult<Retried> {
    info!("HTTP API: Retry {} from {}", form.item.id, form.playlist_id);
    let id = state
        .handle
        .retry_item(form.item, form.playlist_id)
        .await
        .map_err(reject)?;
    Ok(Json(Retried { id }))
}
