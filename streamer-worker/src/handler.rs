use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

use async_trait::async_trait;
use streamer_common::Payload;
use tracing::info;

/// Something that processes the payload of one entry.
///
/// Handlers run concurrently on several workers, and a failure ends the whole session.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, payload: &Payload) -> anyhow::Result<()>;
}

/// Adapts a plain function into a `Handler`. The function runs on the worker task itself, so it
/// should not block for long.
pub struct FnHandler<F>(F);

pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: Fn(&Payload) -> anyhow::Result<()> + Send + Sync,
{
    FnHandler(f)
}

#[async_trait]
impl<F> Handler for FnHandler<F>
where
    F: Fn(&Payload) -> anyhow::Result<()> + Send + Sync,
{
    async fn handle(&self, payload: &Payload) -> anyhow::Result<()> {
        (self.0)(payload)
    }
}

/// Logs every payload it receives.
pub struct LogHandler;

#[async_trait]
impl Handler for LogHandler {
    async fn handle(&self, payload: &Payload) -> anyhow::Result<()> {
        info!(%payload, "received entry");
        Ok(())
    }
}

/// Writes every payload to stdout, one per line.
pub struct StdoutHandler;

#[async_trait]
impl Handler for StdoutHandler {
    async fn handle(&self, payload: &Payload) -> anyhow::Result<()> {
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{payload}")?;
        Ok(())
    }
}

/// Accepts and drops every payload. Useful to drain a stream.
pub struct DiscardHandler;

#[async_trait]
impl Handler for DiscardHandler {
    async fn handle(&self, _payload: &Payload) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Handlers that can be selected by name, e.g. from the command line.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the handlers that ship with the worker: `log`, `stdout` and `discard`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("log", Arc::new(LogHandler));
        registry.register("stdout", Arc::new(StdoutHandler));
        registry.register("discard", Arc::new(DiscardHandler));
        registry
    }

    /// Register `handler` under `name`, replacing any handler already using it.
    pub fn register(&mut self, name: &str, handler: Arc<dyn Handler>) {
        self.handlers.insert(name.to_owned(), handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
