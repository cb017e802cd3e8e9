use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use streamer_common::{Entry, EntryId, LogStore, StoreError};
use thiserror::Error;
use tracing::{debug, error};

use crate::error::WorkerError;
use crate::handler::Handler;

/// Whether an entry is acknowledged before or after its handler runs.
///
/// This decides what happens to an entry when the process dies in the middle of a step:
/// * `AfterHandler`: the entry is still pending and gets delivered again (at-least-once).
/// * `BeforeHandler`: the entry is already acknowledged and is lost (at-most-once).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckOrder {
    BeforeHandler,
    #[default]
    AfterHandler,
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("{0} is not a valid ack order, expected 'before' or 'after'")]
pub struct ParseAckOrderError(String);

impl FromStr for AckOrder {
    type Err = ParseAckOrderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_ref() {
            "before" | "before-handler" => Ok(AckOrder::BeforeHandler),
            "after" | "after-handler" => Ok(AckOrder::AfterHandler),
            invalid => Err(ParseAckOrderError(invalid.to_owned())),
        }
    }
}

impl fmt::Display for AckOrder {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AckOrder::BeforeHandler => write!(f, "before"),
            AckOrder::AfterHandler => write!(f, "after"),
        }
    }
}

/// Couples acknowledgement and handling of an entry into one step.
///
/// Every dispatched entry is acknowledged once and handled once, whatever the outcome of the
/// other half. A failure of either half fails the step; when both fail, the acknowledgement
/// error is reported and the handler error is logged.
pub struct Dispatcher {
    store: Arc<dyn LogStore>,
    stream: String,
    group: String,
    handler: Arc<dyn Handler>,
    ack_order: AckOrder,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn LogStore>,
        stream: &str,
        group: &str,
        handler: Arc<dyn Handler>,
        ack_order: AckOrder,
    ) -> Self {
        Self {
            store,
            stream: stream.to_owned(),
            group: group.to_owned(),
            handler,
            ack_order,
        }
    }

    /// Acknowledge and handle `entry`, returning how many entries the acknowledgement covered.
    pub async fn dispatch(&self, entry: Entry) -> Result<u64, WorkerError> {
        let Entry { id, payload } = entry;
        let labels = [("stream", self.stream.clone()), ("group", self.group.clone())];

        let (acked, handled) = match self.ack_order {
            AckOrder::BeforeHandler => {
                let acked = self.ack(&id).await;
                let handled = self.handler.handle(&payload).await;
                (acked, handled)
            }
            AckOrder::AfterHandler => {
                let handled = self.handler.handle(&payload).await;
                let acked = self.ack(&id).await;
                (acked, handled)
            }
        };

        if handled.is_err() {
            metrics::counter!("streamer_handler_failures_total", &labels).increment(1);
        }

        let acked = match acked {
            Ok(acked) => acked,
            Err(source) => {
                if let Err(handler_error) = &handled {
                    error!(entry_id = %id, error = %handler_error, "handler also failed");
                }
                return Err(WorkerError::Ack { id, source });
            }
        };
        metrics::counter!("streamer_entries_acked_total", &labels).increment(acked);

        handled.map_err(|source| WorkerError::Handler {
            id: id.clone(),
            source,
        })?;

        debug!(entry_id = %id, acked, "dispatched entry");

        Ok(acked)
    }

    async fn ack(&self, id: &EntryId) -> Result<u64, StoreError> {
        self.store.ack(&self.stream, &self.group, id).await
    }
}
