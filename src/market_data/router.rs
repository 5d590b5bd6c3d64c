// Router resolves instruments and runs one listener per instrument
use std::sync::Arc;

use ahash::AHashMap;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::config::ListenerConfig;
use crate::dispatch::ExecutorHandle;
use crate::error::{FeedError, FeedResult};
use crate::market_data::adapters::Transport;
use crate::market_data::events::IncrementalRefresh;
use crate::market_data::instrument::Instrument;
use crate::market_data::listener::{InstrumentListener, ListenerHandle};
use crate::market_data::supervisor::Backoff;

pub struct FeedRouter<T> {
    transport: Arc<T>,
    executor: ExecutorHandle,
    config: ListenerConfig,
    listeners: JoinSet<(String, FeedResult<()>)>,
    handles: AHashMap<String, ListenerHandle>,
}

impl<T: Transport> FeedRouter<T> {
    pub fn new(transport: Arc<T>, executor: ExecutorHandle, config: ListenerConfig) -> Self {
        Self { transport, executor, config, listeners: JoinSet::new(), handles: AHashMap::new() }
    }

    /// Catalog lookup, retried with backoff for as long as the catalog budget is exhausted.
    pub async fn resolve(&self, symbol: &str) -> FeedResult<Instrument> {
        let mut backoff = Backoff::new(self.config.backoff);
        loop {
            match self.executor.instrument(symbol).await {
                Err(e) if e.is_rate_limited() => {
                    let delay = backoff.next_delay();
                    warn!(instrument = symbol, ?delay, "Catalog rate limited, retrying");
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    /// Start a listener per symbol, all publishing into `upstream`. Symbols that cannot be
    /// resolved are returned with their error; the rest keep running.
    pub async fn start(
        &mut self,
        symbols: &[String],
        upstream: mpsc::Sender<IncrementalRefresh>,
    ) -> Vec<(String, FeedError)> {
        let mut failed = Vec::new();
        for symbol in symbols {
            if self.handles.contains_key(symbol) {
                continue;
            }
            match self.resolve(symbol).await {
                Ok(instrument) => self.launch(instrument, upstream.clone()),
                Err(e) => {
                    error!(instrument = %symbol, error = %e, "Instrument lookup failed, not starting listener");
                    failed.push((symbol.clone(), e));
                }
            }
        }
        failed
    }

    pub fn launch(&mut self, instrument: Instrument, upstream: mpsc::Sender<IncrementalRefresh>) {
        let symbol = instrument.symbol.clone();
        let (listener, handle) =
            InstrumentListener::new(instrument, Arc::clone(&self.transport), self.config.clone(), upstream);
        let listener = listener.with_executor(self.executor.clone());
        let name = symbol.clone();
        self.listeners.spawn(async move { (name, listener.run().await) });
        info!(instrument = %symbol, "Listener launched");
        self.handles.insert(symbol, handle);
    }

    pub fn handle(&self, symbol: &str) -> Option<&ListenerHandle> {
        self.handles.get(symbol)
    }

    pub fn running(&self) -> usize {
        self.listeners.len()
    }

    /// Wait for the next listener to exit. A failure only ever concerns that instrument.
    pub async fn join_next(&mut self) -> Option<(String, FeedResult<()>)> {
        loop {
            match self.listeners.join_next().await? {
                Ok((symbol, result)) => {
                    if let Err(e) = &result {
                        error!(instrument = %symbol, error = %e, "Listener exited with error");
                    }
                    self.handles.remove(&symbol);
                    return Some((symbol, result));
                }
                Err(e) => error!(error = %e, "Listener task panicked"),
            }
        }
    }

    pub async fn shutdown(&mut self) {
        for handle in self.handles.values() {
            handle.stop();
        }
        while self.join_next().await.is_some() {}
    }
}
