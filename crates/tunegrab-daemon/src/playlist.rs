//! Playlist selection: which items of a resolved listing go into the queue.

use std::collections::BTreeSet;

use tracing::info;

use tunegrab_proto::protocol::{PlaylistDetails, PlaylistRequest, PlaylistVideo};

use crate::client::JobBackend;
use crate::entry::{NewEntry, Provenance, SourceRef, TransformParams};
use crate::error::ClientError;

/// Resolve a playlist URL into its listing.
pub async fn fetch_details(
    backend: &dyn JobBackend,
    url: &str,
    limit: u32,
) -> Result<PlaylistDetails, ClientError> {
    let details = backend
        .playlist_details(PlaylistRequest {
            url: url.to_string(),
            limit,
        })
        .await?;
    info!(
        "Playlist {} \"{}\": {} of {} videos listed",
        details.playlist_id,
        details.title,
        details.videos.len(),
        details.total_videos
    );
    Ok(details)
}

/// Selected positions in a playlist listing.
///
/// Items the backend already downloaded start unselected and cannot be
/// toggled on; they go back into the queue through retry instead.
#[derive(Debug, Clone)]
pub struct PlaylistSelection {
    details: PlaylistDetails,
    selected: BTreeSet<usize>,
}

impl PlaylistSelection {
    pub fn new(details: PlaylistDetails) -> Self {
        let selected = selectable(&details.videos).collect();
        Self { details, selected }
    }

    pub fn details(&self) -> &PlaylistDetails {
        &self.details
    }

    /// Flip one item.  Returns whether it is selected afterwards.
    pub fn toggle(&mut self, pos: usize) -> bool {
        match self.details.videos.get(pos) {
            Some(video) if !video.is_downloaded() => {
                if !self.selected.remove(&pos) {
                    self.selected.insert(pos);
                }
                self.selected.contains(&pos)
            }
            _ => false,
        }
    }

    pub fn select_all(&mut self) {
        self.selected = selectable(&self.details.videos).collect();
    }

    pub fn clear(&mut self) {
        self.selected.clear();
    }

    pub fn is_selected(&self, pos: usize) -> bool {
        self.selected.contains(&pos)
    }

    pub fn len(&self) -> usize {
        self.selected.len()
    }

    pub fn is_empty(&self) -> bool {
        self.selected.is_empty()
    }

    /// New entries for the selected items, in listing order, all with the
    /// same transform parameters.
    pub fn into_entries(self, params: &TransformParams) -> Vec<NewEntry> {
        let playlist_id = &self.details.playlist_id;
        self.selected
            .iter()
            .filter_map(|pos| self.details.videos.get(*pos))
            .map(|video| {
                NewEntry::new(SourceRef::from_video(video), params.clone())
                    .with_provenance(Provenance::playlist_item(playlist_id, &video.id))
            })
            .collect()
    }
}

fn selectable(videos: &[PlaylistVideo]) -> impl Iterator<Item = usize> + '_ {
    videos
        .iter()
        .enumerate()
        .filter(|(_, v)| !v.is_downloaded())
        .map(|(pos, _)| pos)
}
