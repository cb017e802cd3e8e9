use std::num::NonZeroUsize;
use std::str::FromStr;
use std::time;

use envconfig::Envconfig;
use streamer_common::ConsumerId;

use crate::dispatch::AckOrder;
use crate::driver::default_concurrency;
use crate::session::SessionOptions;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "STREAMER_REDIS_URL", default = "redis://localhost:6379/0")]
    pub redis_url: String,

    #[envconfig(from = "STREAMER_FETCH_COUNT", default = "16")]
    pub fetch_count: usize,

    /// Zero blocks until entries arrive.
    #[envconfig(from = "STREAMER_BLOCK_MS", default = "0")]
    pub block: EnvMsDuration,

    #[envconfig(from = "STREAMER_IDLE_BACKOFF_MS", default = "100")]
    pub idle_backoff: EnvMsDuration,

    #[envconfig(from = "STREAMER_SHUTDOWN_TIMEOUT_MS", default = "30000")]
    pub shutdown_timeout: EnvMsDuration,

    #[envconfig(from = "STREAMER_ACK_ORDER", default = "after")]
    pub ack_order: AckOrder,

    #[envconfig(from = "STREAMER_CONCURRENCY")]
    pub concurrency: Option<NonZeroUsize>,

    #[envconfig(from = "STREAMER_LOG_FORMAT", default = "text")]
    pub log_format: LogFormat,

    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3303")]
    pub port: u16,

    #[envconfig(from = "STREAMER_METRICS_ENABLED", default = "true")]
    pub metrics_enabled: bool,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The read block time, `None` meaning forever.
    pub fn block(&self) -> Option<time::Duration> {
        Some(self.block.0).filter(|block| !block.is_zero())
    }

    /// Session settings from this configuration, with command line overrides applied on top.
    pub fn session_options(
        &self,
        consumer: Option<ConsumerId>,
        concurrency: Option<NonZeroUsize>,
        ack_order: Option<AckOrder>,
    ) -> SessionOptions {
        SessionOptions {
            consumer,
            concurrency: concurrency
                .or(self.concurrency)
                .unwrap_or_else(default_concurrency),
            fetch_count: self.fetch_count,
            block: self.block(),
            idle_backoff: self.idle_backoff.0,
            shutdown_timeout: self.shutdown_timeout.0,
            ack_order: ack_order.unwrap_or(self.ack_order),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[error("{0} is not a valid log format, expected 'text' or 'json'")]
pub struct ParseLogFormatError(String);

impl FromStr for LogFormat {
    type Err = ParseLogFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_ref() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            invalid => Err(ParseLogFormatError(invalid.to_owned())),
        }
    }
}
