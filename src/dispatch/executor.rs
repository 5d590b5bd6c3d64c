use std::sync::Arc;

use ahash::AHashMap;
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::{DispatchPool, QueryClass};
use crate::engine::types::BookSnapshot;
use crate::error::{FeedError, FeedResult};
use crate::market_data::adapters::VenueQuery;
use crate::market_data::events::{MarketDataRequest, MarketDataResponse, RejectionReason, SequenceCounter};
use crate::market_data::instrument::Instrument;

/// Budget weight charged per query class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct QueryWeights {
    pub order_book: u64,
    pub catalog: u64,
}

impl Default for QueryWeights {
    fn default() -> Self {
        Self { order_book: 2, catalog: 20 }
    }
}

impl QueryWeights {
    fn of(&self, class: QueryClass) -> u64 {
        match class {
            QueryClass::OrderBook => self.order_book,
            QueryClass::Catalog => self.catalog,
        }
    }
}

pub enum ExecutorMessage {
    MarketData { request: MarketDataRequest, reply: oneshot::Sender<MarketDataResponse> },
    Instrument { symbol: String, reply: oneshot::Sender<FeedResult<Instrument>> },
    // Posted back by the I/O task once a pool request completes
    SnapshotDone { symbol: String, result: FeedResult<BookSnapshot>, reply: oneshot::Sender<MarketDataResponse> },
    InstrumentDone { symbol: String, result: FeedResult<Instrument>, reply: oneshot::Sender<FeedResult<Instrument>> },
}

/// Cloneable front door of a running `MarketDataExecutor`.
#[derive(Clone)]
pub struct ExecutorHandle {
    tx: mpsc::UnboundedSender<ExecutorMessage>,
}

impl ExecutorHandle {
    pub async fn market_data(&self, request: MarketDataRequest) -> MarketDataResponse {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(ExecutorMessage::MarketData { request, reply }).is_err() {
            return MarketDataResponse::rejected(RejectionReason::Transport("executor stopped".into()));
        }
        rx.await
            .unwrap_or_else(|_| MarketDataResponse::rejected(RejectionReason::Transport("executor stopped".into())))
    }

    /// Issue `request` without waiting; the response is wrapped and posted into `inbox`.
    pub fn market_data_into<M, F>(&self, request: MarketDataRequest, inbox: mpsc::Sender<M>, wrap: F)
    where
        M: Send + 'static,
        F: FnOnce(MarketDataResponse) -> M + Send + 'static,
    {
        let handle = self.clone();
        tokio::spawn(async move {
            let response = handle.market_data(request).await;
            // a closed inbox means the requester was torn down
            let _ = inbox.send(wrap(response)).await;
        });
    }

    pub async fn instrument(&self, symbol: &str) -> FeedResult<Instrument> {
        let (reply, rx) = oneshot::channel();
        let stopped = || FeedError::Catalog("executor stopped".into());
        self.tx
            .send(ExecutorMessage::Instrument { symbol: symbol.to_string(), reply })
            .map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())?
    }
}

/// Sequential actor serving snapshot queries and catalog lookups through the dispatch pool.
///
/// It never awaits I/O itself. Each admitted query runs in its own task and reports back
/// through the actor's inbox, so one slow venue call never stalls other requests.
pub struct MarketDataExecutor<Q> {
    pool: Arc<DispatchPool<Q>>,
    weights: QueryWeights,
    inbox: mpsc::UnboundedReceiver<ExecutorMessage>,
    loopback: mpsc::WeakUnboundedSender<ExecutorMessage>,
    catalog: AHashMap<String, Instrument>,
    sequences: AHashMap<String, SequenceCounter>,
}

impl<Q: VenueQuery> MarketDataExecutor<Q> {
    pub fn new(pool: Arc<DispatchPool<Q>>, weights: QueryWeights) -> (Self, ExecutorHandle) {
        let (tx, inbox) = mpsc::unbounded_channel();
        let executor = Self {
            pool,
            weights,
            inbox,
            loopback: tx.downgrade(),
            catalog: AHashMap::new(),
            sequences: AHashMap::new(),
        };
        (executor, ExecutorHandle { tx })
    }

    pub fn spawn(pool: Arc<DispatchPool<Q>>, weights: QueryWeights) -> ExecutorHandle {
        let (executor, handle) = Self::new(pool, weights);
        tokio::spawn(executor.run());
        handle
    }

    /// Runs until every handle and in-flight request is gone.
    pub async fn run(mut self) {
        info!(workers = self.pool.workers().len(), "Market data executor started");
        while let Some(msg) = self.inbox.recv().await {
            self.handle(msg);
        }
        debug!("Market data executor stopped");
    }

    fn handle(&mut self, msg: ExecutorMessage) {
        match msg {
            ExecutorMessage::MarketData { request, reply } => self.on_market_data(request, reply),
            ExecutorMessage::Instrument { symbol, reply } => self.on_instrument(symbol, reply),
            ExecutorMessage::SnapshotDone { symbol, result, reply } => {
                let response = match result {
                    Ok(snapshot) => {
                        let seq = self.sequences.entry(symbol).or_default().next();
                        MarketDataResponse::accepted(snapshot, seq)
                    }
                    Err(e) => {
                        warn!(instrument = %symbol, error = %e, "Snapshot query failed");
                        MarketDataResponse::rejected(RejectionReason::from(&e))
                    }
                };
                let _ = reply.send(response);
            }
            ExecutorMessage::InstrumentDone { symbol, result, reply } => {
                if let Ok(instrument) = &result {
                    self.catalog.insert(symbol, instrument.clone());
                }
                let _ = reply.send(result);
            }
        }
    }

    fn on_market_data(&mut self, request: MarketDataRequest, reply: oneshot::Sender<MarketDataResponse>) {
        if request.subscribe {
            let _ = reply.send(MarketDataResponse::rejected(RejectionReason::SubscriptionUnsupported));
            return;
        }
        let level = request.aggregation_level;
        if !self.pool.workers().iter().any(|w| w.egress().supports(level)) {
            let _ = reply.send(MarketDataResponse::rejected(RejectionReason::UnsupportedAggregation));
            return;
        }
        let Some(loopback) = self.loopback.upgrade() else { return };

        let symbol = request.instrument;
        let query_symbol = symbol.clone();
        let weight = self.weights.of(QueryClass::OrderBook);
        let pending = self.pool.dispatch(QueryClass::OrderBook, weight, move |egress| async move {
            egress.order_book(&query_symbol, level).await
        });
        match pending {
            Ok(pending) => {
                debug!(
                    instrument = %symbol,
                    request_id = pending.id,
                    worker = pending.worker,
                    "Snapshot query dispatched"
                );
                tokio::spawn(async move {
                    let result = pending.wait().await;
                    let _ = loopback.send(ExecutorMessage::SnapshotDone { symbol, result, reply });
                });
            }
            Err(e) => {
                debug!(instrument = %symbol, error = %e, "Snapshot query rejected");
                let _ = reply.send(MarketDataResponse::rejected(RejectionReason::RateLimited));
            }
        }
    }

    fn on_instrument(&mut self, symbol: String, reply: oneshot::Sender<FeedResult<Instrument>>) {
        if let Some(known) = self.catalog.get(&symbol) {
            let _ = reply.send(Ok(known.clone()));
            return;
        }
        let Some(loopback) = self.loopback.upgrade() else { return };

        let query_symbol = symbol.clone();
        let weight = self.weights.of(QueryClass::Catalog);
        let pending = self.pool.dispatch(QueryClass::Catalog, weight, move |egress| async move {
            egress.instrument(&query_symbol).await
        });
        match pending {
            Ok(pending) => {
                tokio::spawn(async move {
                    let result = pending.wait().await;
                    let _ = loopback.send(ExecutorMessage::InstrumentDone { symbol, result, reply });
                });
            }
            Err(e) => {
                let _ = reply.send(Err(e.into()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{RateLimit, RateLimiter, Worker};
    use crate::engine::types::{BookType, RawLevel};
    use crate::market_data::normaliser::Normaliser;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Duration;

    #[derive(Default)]
    struct FakeVenue {
        catalog_calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl VenueQuery for FakeVenue {
        async fn order_book(&self, symbol: &str, _level: BookType) -> FeedResult<BookSnapshot> {
            if symbol == "SLOW" {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            Ok(BookSnapshot::L2 { bids: vec![RawLevel::new(10.0, 5.0)], asks: vec![RawLevel::new(10.01, 3.0)] })
        }

        async fn instrument(&self, symbol: &str) -> FeedResult<Instrument> {
            self.catalog_calls.fetch_add(1, Ordering::Relaxed);
            match symbol {
                "ETH" => Ok(Instrument::new("ETH", Normaliser::new(100, 1), BookType::L2)),
                other => Err(FeedError::UnknownInstrument { symbol: other.to_string() }),
            }
        }
    }

    fn limiter(capacity: u64) -> RateLimiter {
        RateLimiter::new(RateLimit::new(capacity, Duration::from_secs(60)))
    }

    fn executor(book_capacity: u64) -> (ExecutorHandle, Arc<DispatchPool<FakeVenue>>) {
        let worker = Worker::new(0, FakeVenue::default(), limiter(book_capacity), limiter(1_000));
        let pool = Arc::new(DispatchPool::from_workers(vec![worker], Duration::from_secs(5)));
        (MarketDataExecutor::spawn(Arc::clone(&pool), QueryWeights::default()), pool)
    }

    #[tokio::test]
    async fn test_snapshot_query_accepted_with_sequence() {
        let (handle, _pool) = executor(100);
        let first = handle.market_data(MarketDataRequest::snapshot("ETH", BookType::L2)).await;
        let second = handle.market_data(MarketDataRequest::snapshot("ETH", BookType::L2)).await;
        assert!(first.success);
        assert!(first.snapshot.is_some());
        assert_eq!((first.sequence_number, second.sequence_number), (1, 2));
    }

    #[tokio::test]
    async fn test_exhausted_budget_is_typed_rejection() {
        // weight 2 per query against capacity 2: the second query finds the worker limited
        let (handle, _pool) = executor(2);
        assert!(handle.market_data(MarketDataRequest::snapshot("ETH", BookType::L2)).await.success);
        let rejected = handle.market_data(MarketDataRequest::snapshot("ETH", BookType::L2)).await;
        assert!(!rejected.success);
        assert_eq!(rejected.rejection_reason, Some(RejectionReason::RateLimited));
    }

    #[tokio::test]
    async fn test_unsupported_requests_rejected() {
        let (handle, _pool) = executor(100);
        let l3 = handle.market_data(MarketDataRequest::snapshot("ETH", BookType::L3)).await;
        assert_eq!(l3.rejection_reason, Some(RejectionReason::UnsupportedAggregation));

        let mut sub = MarketDataRequest::snapshot("ETH", BookType::L2);
        sub.subscribe = true;
        let sub = handle.market_data(sub).await;
        assert_eq!(sub.rejection_reason, Some(RejectionReason::SubscriptionUnsupported));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_rejection_does_not_block_other_queries() {
        let (handle, _pool) = executor(100);
        let slow = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.market_data(MarketDataRequest::snapshot("SLOW", BookType::L2)).await })
        };
        let fast = handle.market_data(MarketDataRequest::snapshot("ETH", BookType::L2)).await;
        assert!(fast.success);
        let slow = slow.await.unwrap();
        assert_eq!(slow.rejection_reason, Some(RejectionReason::Timeout));
    }

    #[tokio::test]
    async fn test_catalog_lookup_is_cached() {
        let (handle, pool) = executor(100);
        let eth = handle.instrument("ETH").await.unwrap();
        assert_eq!(eth.normaliser, Normaliser::new(100, 1));
        handle.instrument("ETH").await.unwrap();
        assert_eq!(pool.workers()[0].egress().catalog_calls.load(Ordering::Relaxed), 1);

        let err = handle.instrument("NOPE").await.unwrap_err();
        assert_eq!(err, FeedError::UnknownInstrument { symbol: "NOPE".into() });
    }

    #[tokio::test]
    async fn test_market_data_into_posts_wrapped_reply() {
        let (handle, _pool) = executor(100);
        let (tx, mut rx) = mpsc::channel(4);
        handle.market_data_into(MarketDataRequest::snapshot("ETH", BookType::L2), tx, |resp| (42u64, resp));
        let (tag, response) = rx.recv().await.unwrap();
        assert_eq!(tag, 42);
        assert!(response.success);
    }
}
