use streamer_common::{EntryId, StoreError};
use thiserror::Error;

/// Enumeration of errors that end a consumption session.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("failed to set up consumer group")]
    Establish(#[source] StoreError),
    #[error("failed to fetch entries from the stream")]
    Fetch(#[source] StoreError),
    #[error("failed to acknowledge entry {id}")]
    Ack {
        id: EntryId,
        #[source]
        source: StoreError,
    },
    #[error("handler failed on entry {id}")]
    Handler {
        id: EntryId,
        #[source]
        source: anyhow::Error,
    },
    #[error("a step task panicked or was aborted")]
    StepPanicked(#[from] tokio::task::JoinError),
    #[error("the entry stream ended")]
    StreamEnded,
    #[error("failed to remove consumer from its group")]
    Retire(#[source] StoreError),
}
