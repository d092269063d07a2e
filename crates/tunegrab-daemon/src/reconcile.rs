//! Merging backend observations into queue entries.
//!
//! The push channel and the global poller observe the same job independently
//! and their deliveries interleave.  Both go through [`reconcile`], which
//! decides per field whether the observation moves the entry forward.

use tunegrab_proto::protocol::{JobStatus, JobUpdate};

use crate::entry::{EntryFailure, EntryPatch, EntryStatus, ErrorKind, QueueEntry, StatusOrigin};

/// Fold backend status aliases into the canonical entry status.
///
/// Returns `None` for statuses we do not understand.
pub fn canonical(status: JobStatus) -> Option<(EntryStatus, Option<ErrorKind>)> {
    let mapped = match status {
        JobStatus::Pending => (EntryStatus::Pending, None),
        JobStatus::Queued => (EntryStatus::Queued, None),
        JobStatus::Running | JobStatus::Downloading => (EntryStatus::Downloading, None),
        JobStatus::Processing => (EntryStatus::Processing, None),
        JobStatus::Done | JobStatus::Completed => (EntryStatus::Completed, None),
        JobStatus::Error => (EntryStatus::Error, Some(ErrorKind::Job)),
        JobStatus::Timeout => (EntryStatus::Error, Some(ErrorKind::Timeout)),
        JobStatus::Unknown => return None,
    };
    Some(mapped)
}

/// Compute the patch an observation implies for `entry`, or `None` when it
/// changes nothing.  Applying the result and reconciling the same update
/// again always yields `None`.
pub fn reconcile(entry: &QueueEntry, update: &JobUpdate) -> Option<EntryPatch> {
    let confirmed = entry.status_origin == StatusOrigin::Confirmed;
    if confirmed && entry.status.is_terminal() {
        return None;
    }

    let incoming = update.known_status().and_then(canonical);
    let patch = match incoming {
        Some((status, kind)) if status != entry.status => {
            if confirmed
                && entry.status.has_started()
                && matches!(status, EntryStatus::Pending | EntryStatus::Queued)
            {
                // Late `pending`/`queued` from the other source.
                return None;
            }
            status_change(entry, update, status, kind)
        }
        Some((status, kind)) => {
            let mut patch = same_status(entry, update, status);
            if !confirmed {
                patch.status = Some((status, StatusOrigin::Confirmed));
            }
            if status == EntryStatus::Error {
                let failure = EntryFailure::new(
                    kind.unwrap_or(ErrorKind::Job),
                    update.error.clone(),
                );
                if entry.error.as_ref() != Some(&failure) {
                    patch.error = Some(failure);
                }
            }
            patch
        }
        None => same_status(entry, update, entry.status),
    };

    (!patch.is_empty()).then_some(patch)
}

/// Status moved: status, progress, title and error are replaced together.
fn status_change(
    entry: &QueueEntry,
    update: &JobUpdate,
    status: EntryStatus,
    kind: Option<ErrorKind>,
) -> EntryPatch {
    let progress = match (update.progress, status) {
        (Some(p), _) => p.clamp(0.0, 100.0),
        (None, EntryStatus::Completed) => 100.0,
        (None, EntryStatus::Pending | EntryStatus::Queued) => 0.0,
        (None, _) => entry.progress,
    };

    let mut patch = EntryPatch::status(status, StatusOrigin::Confirmed).with_progress(progress);
    patch.title = update.title.clone().filter(|t| !t.is_empty());
    patch.filename = update.filename.clone();
    if status == EntryStatus::Error {
        patch.error = Some(EntryFailure::new(
            kind.unwrap_or(ErrorKind::Job),
            update.error.clone(),
        ));
    }
    patch
}

/// Status unchanged or absent: progress (never backwards), title, filename.
fn same_status(entry: &QueueEntry, update: &JobUpdate, status: EntryStatus) -> EntryPatch {
    let mut patch = EntryPatch::default();

    if let Some(progress) = update.progress {
        let progress = progress.clamp(0.0, 100.0);
        if !status.is_terminal() && progress > entry.progress {
            patch.progress = Some(progress);
        }
    }
    if let Some(title) = update.title.as_ref().filter(|t| !t.is_empty()) {
        if *title != entry.title {
            patch.title = Some(title.clone());
        }
    }
    if let Some(filename) = &update.filename {
        if entry.filename.as_ref() != Some(filename) {
            patch.filename = Some(filename.clone());
        }
    }
    patch
}
