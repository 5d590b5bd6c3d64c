use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hdrhistogram::Histogram;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use serde::Deserialize;
use tokio::sync::oneshot;
use tokio::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use super::rate_limit::{RateLimit, RateLimiter};
use super::QueryClass;
use crate::error::{DispatchError, FeedError, FeedResult};
use crate::telemetry;

/// Per-class budgets given to every worker built by `DispatchPool::new`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WorkerLimits {
    pub order_book: RateLimit,
    pub catalog: RateLimit,
}

impl Default for WorkerLimits {
    fn default() -> Self {
        let per_minute = RateLimit::new(1200, Duration::from_secs(60));
        Self { order_book: per_minute, catalog: per_minute }
    }
}

/// One egress path with its own independent budget per query class.
pub struct Worker<E> {
    id: usize,
    egress: Arc<E>,
    order_book: RateLimiter,
    catalog: RateLimiter,
    latency: Mutex<Option<Histogram<u64>>>, // micros
}

impl<E> Worker<E> {
    pub fn new(id: usize, egress: E, order_book: RateLimiter, catalog: RateLimiter) -> Self {
        Self {
            id,
            egress: Arc::new(egress),
            order_book,
            catalog,
            latency: Mutex::new(Histogram::new(3).ok()),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn egress(&self) -> &Arc<E> {
        &self.egress
    }

    pub fn limiter(&self, class: QueryClass) -> &RateLimiter {
        match class {
            QueryClass::OrderBook => &self.order_book,
            QueryClass::Catalog => &self.catalog,
        }
    }

    fn record_latency(&self, elapsed: Duration) {
        if let Some(hist) = self.latency.lock().as_mut() {
            hist.saturating_record(elapsed.as_micros().min(u64::MAX as u128) as u64);
        }
    }

    /// (count, p50, p99) of completed request latency in microseconds.
    pub fn latency_summary(&self) -> Option<(u64, u64, u64)> {
        let guard = self.latency.lock();
        let hist = guard.as_ref()?;
        Some((hist.len(), hist.value_at_quantile(0.5), hist.value_at_quantile(0.99)))
    }
}

/// A response that will arrive on its own; dropping it abandons the request.
#[derive(Debug)]
pub struct PendingRequest<R> {
    pub id: u64,
    pub worker: usize,
    rx: oneshot::Receiver<FeedResult<R>>,
}

impl<R> PendingRequest<R> {
    pub async fn wait(self) -> FeedResult<R> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(DispatchError::Cancelled { request_id: self.id }.into()),
        }
    }
}

/// Workers shared by every executor. Safe to use from many tasks at once: the only shared
/// mutable state is inside the limiters.
pub struct DispatchPool<E> {
    workers: Vec<Arc<Worker<E>>>,
    timeout: Duration,
    next_request: AtomicU64,
}

impl<E: Send + Sync + 'static> DispatchPool<E> {
    pub fn new(egress: impl IntoIterator<Item = E>, limits: WorkerLimits, timeout: Duration) -> Self {
        let workers = egress
            .into_iter()
            .enumerate()
            .map(|(id, e)| Worker::new(id, e, RateLimiter::new(limits.order_book), RateLimiter::new(limits.catalog)))
            .collect();
        Self::from_workers(workers, timeout)
    }

    pub fn from_workers(workers: Vec<Worker<E>>, timeout: Duration) -> Self {
        debug!(workers = workers.len(), ?timeout, "Dispatch pool ready");
        Self { workers: workers.into_iter().map(Arc::new).collect(), timeout, next_request: AtomicU64::new(1) }
    }

    pub fn workers(&self) -> &[Arc<Worker<E>>] {
        &self.workers
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// First worker, in random order, whose budget for `class` is still open.
    pub fn acquire(&self, class: QueryClass) -> Option<Arc<Worker<E>>> {
        let mut order = (0..self.workers.len()).collect::<Vec<_>>();
        order.shuffle(&mut rand::thread_rng());
        order
            .into_iter()
            .map(|i| &self.workers[i])
            .find(|w| !w.limiter(class).is_rate_limited())
            .cloned()
    }

    /// Commit `weight` on an available worker and run `call` against its egress in the
    /// background, bounded by the pool timeout.
    pub fn dispatch<F, Fut, R>(
        &self,
        class: QueryClass,
        weight: u64,
        call: F,
    ) -> Result<PendingRequest<R>, DispatchError>
    where
        F: FnOnce(Arc<E>) -> Fut,
        Fut: Future<Output = FeedResult<R>> + Send + 'static,
        R: Send + 'static,
    {
        let Some(worker) = self.acquire(class) else {
            warn!(class = class.as_str(), "All workers rate limited");
            metrics::counter!(telemetry::DISPATCH_REJECTIONS, "class" => class.as_str()).increment(1);
            return Err(DispatchError::RateLimited { class });
        };
        worker.limiter(class).request(weight);

        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let timeout = self.timeout;
        let (tx, rx) = oneshot::channel();
        let fut = call(Arc::clone(&worker.egress));
        let worker_id = worker.id;
        trace!(request_id, worker = worker_id, class = class.as_str(), weight, "Dispatching request");

        tokio::spawn(async move {
            let started = Instant::now();
            let result = match tokio::time::timeout(timeout, fut).await {
                Ok(result) => result,
                Err(_) => Err(FeedError::Timeout { request_id, timeout }),
            };
            worker.record_latency(started.elapsed());
            if tx.send(result).is_err() {
                trace!(request_id, "Requester gone, response dropped");
            }
        });

        Ok(PendingRequest { id: request_id, worker: worker_id, rx })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn open() -> RateLimiter {
        RateLimiter::new(RateLimit::new(1_000, Duration::from_secs(60)))
    }

    fn closed() -> RateLimiter {
        RateLimiter::new(RateLimit::new(0, Duration::from_secs(60)))
    }

    fn pool(limiters: Vec<(RateLimiter, RateLimiter)>) -> DispatchPool<&'static str> {
        let workers = limiters
            .into_iter()
            .enumerate()
            .map(|(id, (book, catalog))| Worker::new(id, "egress", book, catalog))
            .collect();
        DispatchPool::from_workers(workers, Duration::from_secs(1))
    }

    #[test]
    fn test_all_limited_returns_none() {
        let pool = pool(vec![(closed(), open()), (closed(), open())]);
        assert!(pool.acquire(QueryClass::OrderBook).is_none());
        // classes have independent budgets
        assert!(pool.acquire(QueryClass::Catalog).is_some());
    }

    #[test]
    fn test_single_free_worker_always_chosen() {
        let pool = pool(vec![(closed(), open()), (closed(), open()), (open(), open()), (closed(), open())]);
        for _ in 0..100 {
            assert_eq!(pool.acquire(QueryClass::OrderBook).map(|w| w.id()), Some(2));
        }
    }

    #[test]
    fn test_randomized_order_spreads_load() {
        let pool = pool(vec![(open(), open()), (open(), open()), (open(), open())]);
        let seen = (0..200).filter_map(|_| pool.acquire(QueryClass::OrderBook).map(|w| w.id())).collect::<HashSet<_>>();
        assert_eq!(seen.len(), 3);
    }

    #[tokio::test]
    async fn test_dispatch_commits_weight_and_replies() {
        let pool = pool(vec![(open(), open())]);
        let pending = pool
            .dispatch(QueryClass::Catalog, 20, |egress| async move { Ok(egress.len()) })
            .unwrap();
        assert_eq!(pending.worker, 0);
        assert_eq!(pending.wait().await, Ok(6));
        assert_eq!(pool.workers()[0].limiter(QueryClass::Catalog).consumed(), 20);
        assert_eq!(pool.workers()[0].limiter(QueryClass::OrderBook).consumed(), 0);
    }

    #[tokio::test]
    async fn test_dispatch_rate_limited_is_typed() {
        let pool = pool(vec![(closed(), open())]);
        let err = pool
            .dispatch(QueryClass::OrderBook, 1, |_| async { Ok(()) })
            .unwrap_err();
        assert_eq!(err, DispatchError::RateLimited { class: QueryClass::OrderBook });
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_call_times_out() {
        let pool = pool(vec![(open(), open())]);
        let pending = pool
            .dispatch(QueryClass::OrderBook, 1, |_| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .unwrap();
        let id = pending.id;
        let err = pending.wait().await.unwrap_err();
        assert_eq!(err, FeedError::Timeout { request_id: id, timeout: Duration::from_secs(1) });
    }

    #[tokio::test]
    async fn test_request_ids_are_unique_and_abandon_is_silent() {
        let pool = pool(vec![(open(), open())]);
        let a = pool.dispatch(QueryClass::OrderBook, 1, |_| async { Ok(1) }).unwrap();
        let b = pool.dispatch(QueryClass::OrderBook, 1, |_| async { Ok(2) }).unwrap();
        assert_ne!(a.id, b.id);
        drop(a);
        assert_eq!(b.wait().await, Ok(2));
        tokio::task::yield_now().await;
        assert!(pool.workers()[0].latency_summary().is_some());
    }
}
