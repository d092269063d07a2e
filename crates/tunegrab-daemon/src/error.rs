use thiserror::Error;

use crate::entry::{EntryId, EntryStatus};

/// Failure talking to the download backend.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("backend rejected request ({status}): {detail}")]
    Rejected { status: u16, detail: String },

    #[error("job {0} is unknown to the backend")]
    NotFound(String),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("malformed backend message: {0}")]
    Decode(#[from] serde_json::Error),
}

/// A queue mutation the store refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("entry {0} not found")]
    NotFound(EntryId),

    #[error("entry {id} is {status} and bound to a backend job")]
    InFlight { id: EntryId, status: EntryStatus },

    #[error("entry {id} is {status} and cannot be removed")]
    NotRemovable { id: EntryId, status: EntryStatus },
}

/// Failure of a command issued through `QueueHandle`.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("entry {id} is {status}; only completed or failed entries can be retried")]
    NotRetryable { id: EntryId, status: EntryStatus },

    #[error(transparent)]
    Backend(#[from] ClientError),

    #[error("queue is shut down")]
    Closed,
}
