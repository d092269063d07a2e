//! Client-side download queue orchestrator.
//!
//! Entries are admitted against a bounded pool of backend job slots, tracked
//! through push and poll observations, and reconciled into a single ordered
//! queue owned by [`core::QueueCore`].

pub mod admission;
pub mod channel;
pub mod client;
pub mod core;
pub mod enqueue;
pub mod entry;
pub mod error;
pub mod http;
pub mod playlist;
pub mod poller;
pub mod reconcile;
pub mod store;

#[cfg(test)]
pub(crate) mod fake;

pub use crate::core::{QueueBroadcast, QueueCore, QueueEvent, QueueHandle, QueueSnapshot};
pub use client::{HttpBackend, JobBackend};
pub use entry::{EntryId, EntryStatus, NewEntry, QueueEntry};
