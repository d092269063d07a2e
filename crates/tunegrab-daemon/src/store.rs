//! Ordered collection of queue entries.
//!
//! Every mutation builds a new `Vec` and swaps the shared pointer, so a
//! snapshot handed out by [`QueueStore::entries`] never changes under its
//! reader.  `rev` bumps on every effective change.

use serde::Serialize;
use std::sync::Arc;

use crate::entry::{EntryId, EntryPatch, EntryStatus, NewEntry, QueueEntry};
use crate::error::StoreError;

/// Entry counts by status, for admission and UI badges.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub queued: usize,
    pub downloading: usize,
    pub processing: usize,
    pub completed: usize,
    pub error: usize,
    /// Entries holding a concurrency slot.
    pub in_flight: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.pending + self.queued + self.downloading + self.processing + self.completed + self.error
    }
}

#[derive(Debug, Default)]
pub struct QueueStore {
    entries: Arc<Vec<QueueEntry>>,
    next_id: u64,
    rev: u64,
}

impl QueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rev(&self) -> u64 {
        self.rev
    }

    /// Shared snapshot of the current entries, in insertion order.
    pub fn entries(&self) -> Arc<Vec<QueueEntry>> {
        Arc::clone(&self.entries)
    }

    pub fn get(&self, id: EntryId) -> Option<&QueueEntry> {
        self.entries.iter().find(|e| e.unique_id == id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append entries in order and return their freshly allocated ids.
    pub fn add(&mut self, items: Vec<NewEntry>) -> Vec<EntryId> {
        if items.is_empty() {
            return Vec::new();
        }
        let mut next = (*self.entries).clone();
        let mut ids = Vec::with_capacity(items.len());
        for item in items {
            self.next_id += 1;
            let id = EntryId(self.next_id);
            next.push(QueueEntry::new(id, item));
            ids.push(id);
        }
        self.replace(next);
        ids
    }

    /// Append a single entry.
    pub fn push(&mut self, item: NewEntry) -> EntryId {
        let mut next = (*self.entries).clone();
        self.next_id += 1;
        let id = EntryId(self.next_id);
        next.push(QueueEntry::new(id, item));
        self.replace(next);
        id
    }

    /// Remove an entry.  Only entries that hold no backend job and are not
    /// finished successfully can go: `pending` without a job, or `error`.
    pub fn remove(&mut self, id: EntryId) -> Result<QueueEntry, StoreError> {
        let entry = self.get(id).ok_or(StoreError::NotFound(id))?;
        check_removable(entry)?;

        let mut next = Vec::with_capacity(self.entries.len() - 1);
        let mut removed = None;
        for e in self.entries.iter() {
            if e.unique_id == id {
                removed = Some(e.clone());
            } else {
                next.push(e.clone());
            }
        }
        self.replace(next);
        removed.ok_or(StoreError::NotFound(id))
    }

    /// Apply a patch to one entry.  Returns `false` for unknown ids and for
    /// patches that change nothing.
    pub fn update(&mut self, id: EntryId, patch: &EntryPatch) -> bool {
        self.update_many(&[id], patch)
    }

    /// Apply the same patch to several entries in a single swap.
    pub fn update_many(&mut self, ids: &[EntryId], patch: &EntryPatch) -> bool {
        if ids.is_empty() || patch.is_empty() {
            return false;
        }
        let mut next = (*self.entries).clone();
        let mut changed = false;
        for entry in next.iter_mut().filter(|e| ids.contains(&e.unique_id)) {
            changed |= patch.apply(entry);
        }
        if changed {
            self.replace(next);
        }
        changed
    }

    /// Drop every entry that holds no slot (pending without a job, completed,
    /// failed).  In-flight entries stay so their backend jobs are not orphaned.
    pub fn clear(&mut self) -> Vec<QueueEntry> {
        let (kept, removed): (Vec<_>, Vec<_>) =
            self.entries.iter().cloned().partition(|e| e.occupies_slot());
        if !removed.is_empty() {
            self.replace(kept);
        }
        removed
    }

    pub fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for entry in self.entries.iter() {
            match entry.status {
                EntryStatus::Pending => counts.pending += 1,
                EntryStatus::Queued => counts.queued += 1,
                EntryStatus::Downloading => counts.downloading += 1,
                EntryStatus::Processing => counts.processing += 1,
                EntryStatus::Completed => counts.completed += 1,
                EntryStatus::Error => counts.error += 1,
            }
            if entry.occupies_slot() {
                counts.in_flight += 1;
            }
        }
        counts
    }

    /// Entries bound to a backend job that has not finished yet.
    pub fn live_jobs(&self) -> impl Iterator<Item = (EntryId, &str)> {
        self.entries.iter().filter_map(|e| match &e.job_id {
            Some(job_id) if !e.status.is_terminal() => Some((e.unique_id, job_id.as_str())),
            _ => None,
        })
    }

    fn replace(&mut self, next: Vec<QueueEntry>) {
        self.entries = Arc::new(next);
        self.rev += 1;
    }
}

fn check_removable(entry: &QueueEntry) -> Result<(), StoreError> {
    let id = entry.unique_id;
    match entry.status {
        EntryStatus::Error => Ok(()),
        EntryStatus::Pending if entry.job_id.is_none() => Ok(()),
        EntryStatus::Completed => Err(StoreError::NotRemovable {
            id,
            status: entry.status,
        }),
        status => Err(StoreError::InFlight { id, status }),
    }
}
