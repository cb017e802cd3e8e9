use std::num::NonZeroUsize;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use streamer_common::emitter::{emit, payload_from_json};
use streamer_common::{ConsumerId, LogStore, SharedStore};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{Config, LogFormat};
use crate::dispatch::AckOrder;
use crate::handler::HandlerRegistry;
use crate::session::stream_into;

#[derive(Parser)]
#[command(version, about = "Produce to and consume from Redis streams", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Log output format, overrides STREAMER_LOG_FORMAT
    #[arg(long, global = true)]
    pub log_format: Option<LogFormat>,

    /// Most verbose level to log, overrides RUST_LOG
    #[arg(long, global = true)]
    pub log_level: Option<tracing::Level>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Append a payload, given as a flat JSON object, to a stream
    Emit {
        stream: String,
        /// e.g. '{"msg": "A new user signed up.", "user_id": 42}'
        payload: String,
        /// Trim the stream to approximately this many entries
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Consume a stream as a member of a consumer group until interrupted
    Consume {
        stream: String,
        group: String,
        /// Name of the handler every entry is passed to: log, stdout or discard
        handler: String,
        /// Consumer identity within the group, generated when omitted
        #[arg(long)]
        consumer: Option<String>,
        /// Number of entries handled concurrently, defaults to the number of CPUs
        #[arg(long)]
        concurrency: Option<NonZeroUsize>,
        /// Acknowledge entries before or after handling them
        #[arg(long)]
        ack_order: Option<AckOrder>,
    },
}

impl Cli {
    pub async fn run(
        self,
        config: &Config,
        store: &SharedStore,
        handlers: &HandlerRegistry,
        shutdown: CancellationToken,
    ) -> anyhow::Result<()> {
        match self.command {
            Commands::Emit {
                stream,
                payload,
                limit,
            } => {
                let value: serde_json::Value =
                    serde_json::from_str(&payload).context("payload is not valid JSON")?;
                let payload = payload_from_json(&value)?;

                let store = store.get().await?;
                let id = emit(store.as_ref(), &stream, &payload, limit).await?;

                info!(%stream, %id, "emitted entry");
                println!("{id}");
            }
            Commands::Consume {
                stream,
                group,
                handler,
                consumer,
                concurrency,
                ack_order,
            } => {
                let handler = handlers.get(&handler).with_context(|| {
                    format!(
                        "unknown handler {handler}, expected one of: {}",
                        handlers.names().join(", ")
                    )
                })?;
                let options =
                    config.session_options(consumer.map(ConsumerId::new), concurrency, ack_order);

                let store: Arc<dyn LogStore> = store.get().await?;
                stream_into(store, handler, &stream, &group, options, shutdown).await?;
            }
        }

        Ok(())
    }
}
