//! Admission control: which pending entries may start now.
//!
//! The slot pool is never tracked separately; it is recomputed from the
//! entries on every pass.  Selected entries must be marked `queued` before
//! any enqueue call goes out, so the next pass cannot pick them again.

use crate::entry::{EntryId, QueueEntry};

/// Concurrency ceiling used when nothing else is configured.
pub const CONCURRENCY_LIMIT: usize = 4;

/// Number of slots still free under `limit`.
pub fn free_slots(entries: &[QueueEntry], limit: usize) -> usize {
    let active = entries.iter().filter(|e| e.occupies_slot()).count();
    limit.saturating_sub(active)
}

/// Pick the entries to admit: the oldest admissible ones, up to the free
/// slot count.  Idempotent as long as the caller marks the result `queued`.
pub fn select(entries: &[QueueEntry], limit: usize) -> Vec<EntryId> {
    let free = free_slots(entries, limit);
    if free == 0 {
        return Vec::new();
    }
    entries
        .iter()
        .filter(|e| e.is_admissible())
        .take(free)
        .map(|e| e.unique_id)
        .collect()
}
