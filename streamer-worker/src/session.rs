use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use streamer_common::{ConsumerId, LogStore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::dispatch::{AckOrder, Dispatcher};
use crate::driver::{default_concurrency, drive, DriverOptions};
use crate::error::WorkerError;
use crate::group::ConsumerGroup;
use crate::handler::Handler;
use crate::unpack::{unpack, GroupReader};

/// Settings for one consumption session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Identity to consume as. A random one is generated when unset.
    pub consumer: Option<ConsumerId>,
    pub concurrency: NonZeroUsize,
    /// Maximum entries claimed per read.
    pub fetch_count: usize,
    /// How long a read blocks waiting for entries. `None` blocks until entries arrive.
    pub block: Option<Duration>,
    /// Pause between a read that came back empty and the next one.
    pub idle_backoff: Duration,
    pub shutdown_timeout: Duration,
    pub ack_order: AckOrder,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            consumer: None,
            concurrency: default_concurrency(),
            fetch_count: 16,
            block: None,
            idle_backoff: Duration::from_millis(100),
            shutdown_timeout: Duration::from_secs(30),
            ack_order: AckOrder::default(),
        }
    }
}

/// Consume `stream` as a member of `group`, passing every entry to `handler`.
///
/// The group is created if it does not exist yet. The session runs until a fetch or a step fails,
/// or until `shutdown` is cancelled, which is not a failure. Entries already claimed by this
/// consumer are still dispatched when it stops. Whichever way it ends, the consumer is removed
/// from the group before this returns.
pub async fn stream_into(
    store: Arc<dyn LogStore>,
    handler: Arc<dyn Handler>,
    stream: &str,
    group: &str,
    options: SessionOptions,
    shutdown: CancellationToken,
) -> Result<(), WorkerError> {
    let consumer = options.consumer.unwrap_or_else(ConsumerId::generate);

    let membership = ConsumerGroup::new(store.clone(), stream, group)
        .join(consumer.clone())
        .await
        .map_err(WorkerError::Establish)?;

    info!(
        %consumer,
        group,
        stream,
        concurrency = options.concurrency.get(),
        ack_order = %options.ack_order,
        "consuming stream"
    );

    let reader = GroupReader::new(store.clone(), stream, group, consumer.clone())
        .count(options.fetch_count)
        .block(options.block);
    let dispatcher = Arc::new(Dispatcher::new(
        store,
        stream,
        group,
        handler,
        options.ack_order,
    ));

    let outcome = drive(
        unpack(reader, options.idle_backoff),
        dispatcher,
        DriverOptions {
            workers: options.concurrency,
            shutdown_timeout: options.shutdown_timeout,
        },
        shutdown,
    )
    .await;

    let retired = membership.retire().await;

    match (outcome, retired) {
        (Ok(()), Ok(pending)) => {
            if pending > 0 {
                warn!(
                    %consumer,
                    pending,
                    "removed consumer still had pending entries, they are no longer tracked by the group"
                );
            }
            info!(%consumer, group, stream, "session ended");
            Ok(())
        }
        (Ok(()), Err(error)) => Err(WorkerError::Retire(error)),
        (Err(failure), Ok(_)) => Err(failure),
        (Err(failure), Err(error)) => {
            error!(%consumer, %error, "failed to remove consumer after the session failed");
            Err(failure)
        }
    }
}
