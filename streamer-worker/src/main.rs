//! Emit entries to, and consume entries from, Redis streams.
use anyhow::Context;
use clap::Parser;
use envconfig::Envconfig;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use streamer::cli::{Cli, Commands};
use streamer::config::{Config, LogFormat};
use streamer::handler::HandlerRegistry;
use streamer::signals::cancel_on_shutdown_signal;
use streamer_common::metrics::{serve, setup_metrics_router};
use streamer_common::SharedStore;

/// A `level` given on the command line replaces whatever RUST_LOG asks for.
fn init_tracing(format: LogFormat, level: Option<tracing::Level>) {
    let filter = match level {
        Some(level) => EnvFilter::builder()
            .with_default_directive(level.into())
            .parse_lossy(""),
        None => EnvFilter::builder()
            .with_default_directive(tracing::Level::INFO.into())
            .from_env_lossy(),
    };
    let builder = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::init_from_env().context("invalid configuration")?;

    init_tracing(cli.log_format.unwrap_or(config.log_format), cli.log_level);

    if config.metrics_enabled && matches!(cli.command, Commands::Consume { .. }) {
        let router = setup_metrics_router().context("failed to set up metrics recorder")?;
        let bind = config.bind();
        tokio::task::spawn(async move {
            info!(%bind, "serving metrics");
            if let Err(error) = serve(router, &bind).await {
                error!(%error, "failed to serve metrics");
            }
        });
    }

    let shutdown = CancellationToken::new();
    cancel_on_shutdown_signal(shutdown.clone());

    let store = SharedStore::new(config.redis_url.clone());
    let handlers = HandlerRegistry::with_builtins();

    cli.run(&config, &store, &handlers, shutdown).await
}
