use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, instrument, trace, warn};

use crate::config::{ListenerConfig, SnapshotSource};
use crate::dispatch::ExecutorHandle;
use crate::engine::aggregator::{AggregateTrade, TradeAggregator, TradePrint};
use crate::engine::book::OrderBook;
use crate::engine::types::{BookError, BookSnapshot, BookType, DiffEntry, LevelDelta, Side};
use crate::error::{FeedError, FeedResult};
use crate::market_data::adapters::{Channel, Frame, RawTrade, Resolution, Transport};
use crate::market_data::events::{
    IncrementalRefresh, MarketDataRequest, MarketDataResponse, RejectionReason, SequenceCounter,
};
use crate::market_data::instrument::Instrument;
use crate::market_data::supervisor::{Backoff, ConnectionSupervisor};
use crate::telemetry;

// Longest a stopping listener waits for the consumer to take its last trades.
const FINAL_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Disconnected,
    Subscribing,
    Syncing,
    Live,
    Resyncing,
    Stopped,
}

impl ListenerState {
    fn gauge(self) -> f64 {
        match self {
            ListenerState::Disconnected => 0.0,
            ListenerState::Subscribing => 1.0,
            ListenerState::Syncing => 2.0,
            ListenerState::Live => 3.0,
            ListenerState::Resyncing => 4.0,
            ListenerState::Stopped => 5.0,
        }
    }
}

/// Everything delivered into a listener's inbox, processed one at a time.
#[derive(Debug)]
pub enum ListenerMessage {
    Frame { epoch: u64, frame: Frame },
    TransportClosed { epoch: u64, reason: FeedError },
    HeartbeatCheck { epoch: u64 },
    HealthCheck { epoch: u64 },
    FlushTrades { epoch: u64 },
    /// `charged` retries count against the handshake budget; deferred ones do not.
    RetrySync { epoch: u64, charged: bool },
    SnapshotReply { request_id: u64, response: MarketDataResponse },
    Query { request: MarketDataRequest, reply: oneshot::Sender<MarketDataResponse> },
}

impl ListenerMessage {
    fn epoch(&self) -> Option<u64> {
        match self {
            ListenerMessage::Frame { epoch, .. }
            | ListenerMessage::TransportClosed { epoch, .. }
            | ListenerMessage::HeartbeatCheck { epoch }
            | ListenerMessage::HealthCheck { epoch }
            | ListenerMessage::FlushTrades { epoch }
            | ListenerMessage::RetrySync { epoch, .. } => Some(*epoch),
            ListenerMessage::SnapshotReply { .. } | ListenerMessage::Query { .. } => None,
        }
    }
}

/// Control handle for a running listener. The listener stops once `stop` is called or the
/// last handle is dropped.
#[derive(Clone)]
pub struct ListenerHandle {
    inbox: mpsc::Sender<ListenerMessage>,
    shutdown: Arc<watch::Sender<bool>>,
    state: watch::Receiver<ListenerState>,
}

impl ListenerHandle {
    /// Snapshot of the book as published so far, tagged with the last published sequence.
    pub async fn query(&self, request: MarketDataRequest) -> MarketDataResponse {
        let (reply, rx) = oneshot::channel();
        let gone = || MarketDataResponse::rejected(RejectionReason::Transport("listener stopped".into()));
        if self.inbox.send(ListenerMessage::Query { request, reply }).await.is_err() {
            return gone();
        }
        rx.await.unwrap_or_else(|_| gone())
    }

    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn state(&self) -> ListenerState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ListenerState> {
        self.state.clone()
    }
}

#[derive(Debug, Default)]
struct FrameOutcome {
    deltas: Vec<LevelDelta>,
    trades: Vec<AggregateTrade>,
    flush_at: Option<Instant>,
}

/// Book, trade and sequence state for one instrument. Holds no I/O.
///
/// `published` mirrors exactly what consumers have been sent, so a rebuilt book is always
/// announced as the difference from that view rather than as a clear and reload.
#[derive(Debug)]
struct FeedState {
    symbol: String,
    book: OrderBook,
    coarse: Option<OrderBook>,
    coarse_depth: Option<usize>,
    published: OrderBook,
    aggregator: TradeAggregator,
    sequence: SequenceCounter,
    buffered: Vec<Frame>,
    snapshot_update_id: Option<u64>,
    last_emit: Instant,
}

impl FeedState {
    fn new(instrument: &Instrument, config: &ListenerConfig) -> Self {
        let norm = instrument.normaliser;
        Self {
            symbol: instrument.symbol.clone(),
            book: OrderBook::new(instrument.book_type, norm),
            coarse: None,
            coarse_depth: config.coarse_depth,
            published: OrderBook::new(BookType::L2, norm),
            aggregator: TradeAggregator::new(config.trade_flush),
            sequence: SequenceCounter::default(),
            buffered: Vec::new(),
            snapshot_update_id: None,
            last_emit: Instant::now(),
        }
    }

    // Drops working state only; the published mirror and sequence survive a resync
    fn reset(&mut self) {
        self.book.clear();
        self.coarse = None;
        self.buffered.clear();
        self.snapshot_update_id = None;
    }

    fn merged(&self) -> bool {
        self.coarse_depth.is_some()
    }

    fn sync(&mut self, snapshot: &BookSnapshot, resolution: Resolution, last_update_id: Option<u64>) -> FeedResult<()> {
        match resolution {
            Resolution::Fine => {
                self.book.sync(snapshot)?;
                self.snapshot_update_id = last_update_id;
            }
            Resolution::Coarse => {
                let coarse = self
                    .coarse
                    .get_or_insert_with(|| OrderBook::new(BookType::L2, self.book.normaliser()));
                coarse.sync(snapshot)?;
            }
        }
        Ok(())
    }

    /// Bring the published mirror in line with the current book.
    fn republish(&mut self) -> Vec<LevelDelta> {
        let view = match (self.coarse_depth, &self.coarse) {
            (Some(depth), Some(coarse)) => self.book.merged_view(coarse, depth),
            (Some(depth), None) => self.book.merged_view(&OrderBook::new(BookType::L2, self.book.normaliser()), depth),
            (None, _) => self.book.clone(),
        };
        let deltas = self.published.diff(&view, usize::MAX);
        self.published.apply_deltas(&deltas);
        deltas
    }

    fn is_stale_update(&self, frame: &Frame) -> bool {
        matches!((frame.update_id(), self.snapshot_update_id), (Some(id), Some(snap)) if id <= snap)
    }

    fn apply_frame(&mut self, frame: Frame, now: Instant) -> FeedResult<FrameOutcome> {
        let mut outcome = FrameOutcome::default();
        if self.is_stale_update(&frame) {
            trace!(instrument = %self.symbol, update_id = ?frame.update_id(), "Skipping update older than snapshot");
            return Ok(outcome);
        }
        let entries = match frame {
            Frame::LevelUpdate { bids, asks, .. } => bids
                .into_iter()
                .map(|l| DiffEntry::Level { side: Side::BUY, price: l.price, quantity: l.quantity })
                .chain(
                    asks.into_iter()
                        .map(|l| DiffEntry::Level { side: Side::SELL, price: l.price, quantity: l.quantity }),
                )
                .collect::<Vec<_>>(),
            Frame::OrderAdd { order, .. } => vec![DiffEntry::Add {
                order_id: order.order_id,
                side: order.side,
                price: order.price,
                quantity: order.quantity,
            }],
            Frame::OrderChange { order_id, price, quantity, .. } => {
                vec![DiffEntry::Change { order_id, price, quantity }]
            }
            Frame::OrderDelete { order_id, .. } => vec![DiffEntry::Delete { order_id }],
            Frame::Snapshot { snapshot, resolution, last_update_id } => {
                self.sync(&snapshot, resolution, last_update_id)?;
                outcome.deltas = self.republish();
                return Ok(outcome);
            }
            Frame::Trade(raw) => {
                let print = self.trade_print(raw);
                let ingest = self.aggregator.ingest(print, now);
                outcome.trades = ingest.emitted;
                outcome.flush_at = ingest.opened;
                return Ok(outcome);
            }
            Frame::Error(msg) => return Err(FeedError::Venue(msg)),
            Frame::Pong => return Ok(outcome),
        };

        let touched = self.book.apply_diff(&entries)?;
        if self.book.crossed() {
            let (bid, ask) = match (self.book.best_bid(), self.book.best_ask()) {
                (Some((bid, _)), Some((ask, _))) => (bid, ask),
                _ => (0, 0),
            };
            return Err(FeedError::Crossed { bid, ask });
        }
        outcome.deltas = if self.merged() {
            self.republish()
        } else {
            self.published.apply_deltas(&touched);
            touched
        };
        Ok(outcome)
    }

    fn trade_print(&self, raw: RawTrade) -> TradePrint {
        let norm = self.book.normaliser();
        TradePrint {
            id: raw.id,
            price: norm.price_to_ticks(raw.price),
            quantity: norm.size_to_lots(raw.quantity),
            side: raw.side,
            timestamp_ms: raw.timestamp_ms,
            aggregate_key: raw.aggregate_key,
        }
    }

    /// Wrap a payload into the next refresh. Nothing to say means no event.
    fn refresh(
        &mut self,
        deltas: Vec<LevelDelta>,
        trades: Vec<AggregateTrade>,
        now: Instant,
    ) -> Option<IncrementalRefresh> {
        if deltas.is_empty() && trades.is_empty() {
            return None;
        }
        self.last_emit = now;
        Some(IncrementalRefresh {
            instrument: self.symbol.clone(),
            sequence_number: self.sequence.next(),
            level_deltas: (!deltas.is_empty()).then_some(deltas),
            trades: (!trades.is_empty()).then_some(trades),
        })
    }

    fn heartbeat(&mut self, now: Instant) -> IncrementalRefresh {
        self.last_emit = now;
        IncrementalRefresh::heartbeat(self.symbol.clone(), self.sequence.next())
    }

    fn query(&self, request: &MarketDataRequest, live: bool) -> MarketDataResponse {
        if request.subscribe {
            return MarketDataResponse::rejected(RejectionReason::SubscriptionUnsupported);
        }
        if request.instrument != self.symbol {
            return MarketDataResponse::rejected(RejectionReason::UnknownInstrument);
        }
        if !live {
            return MarketDataResponse::rejected(RejectionReason::NotReady);
        }
        let seq = self.sequence.current();
        match request.aggregation_level {
            BookType::L2 => MarketDataResponse::accepted(self.published.level_snapshot(), seq),
            BookType::L3 if self.book.book_type() == BookType::L3 && !self.merged() => {
                MarketDataResponse::accepted(self.book.snapshot(), seq)
            }
            BookType::L3 => MarketDataResponse::rejected(RejectionReason::UnsupportedAggregation),
        }
    }
}

enum Flow {
    Running,
    Stopped,
}

/// Per-instrument orchestrator.
///
/// Owns the book, the trade aggregator and the sequence counter for one instrument and
/// drives the connection state machine. All of it runs inside one task reading one inbox,
/// so none of that state is ever shared.
pub struct InstrumentListener<T> {
    instrument: Instrument,
    config: ListenerConfig,
    supervisor: ConnectionSupervisor<T>,
    executor: Option<ExecutorHandle>,
    inbox: mpsc::Receiver<ListenerMessage>,
    shutdown: watch::Receiver<bool>,
    state_tx: watch::Sender<ListenerState>,
    upstream: mpsc::Sender<IncrementalRefresh>,
    state: ListenerState,
    feed: FeedState,
    backoff: Backoff,
    failures: u32,
    sync_attempts: u32,
    sync_started: Instant,
    pending_snapshot: Option<u64>,
    next_request_id: u64,
    last_inbound: Instant,
}

impl<T: Transport> InstrumentListener<T> {
    pub fn new(
        instrument: Instrument,
        transport: Arc<T>,
        config: ListenerConfig,
        upstream: mpsc::Sender<IncrementalRefresh>,
    ) -> (Self, ListenerHandle) {
        let (inbox_tx, inbox) = mpsc::channel(config.event_buffer.max(16));
        let (shutdown_tx, shutdown) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(ListenerState::Disconnected);
        let supervisor = ConnectionSupervisor::new(
            transport,
            instrument.clone(),
            inbox_tx.clone(),
            config.heartbeat_check,
            config.health_check,
        );
        let listener = Self {
            feed: FeedState::new(&instrument, &config),
            backoff: Backoff::new(config.backoff),
            instrument,
            supervisor,
            executor: None,
            inbox,
            shutdown,
            state_tx,
            upstream,
            state: ListenerState::Disconnected,
            failures: 0,
            sync_attempts: 0,
            sync_started: Instant::now(),
            pending_snapshot: None,
            next_request_id: 0,
            last_inbound: Instant::now(),
            config,
        };
        let handle = ListenerHandle { inbox: inbox_tx, shutdown: Arc::new(shutdown_tx), state: state_rx };
        (listener, handle)
    }

    /// Executor used for pulled snapshots. Without one the listener waits for pushed snapshots.
    pub fn with_executor(mut self, executor: ExecutorHandle) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn spawn(self) -> JoinHandle<FeedResult<()>> {
        tokio::spawn(self.run())
    }

    /// Run until stopped or until an initialization failure.
    #[instrument(name = "listener", skip_all, fields(instrument = %self.instrument.symbol))]
    pub async fn run(mut self) -> FeedResult<()> {
        info!("Listener starting");
        let result = self.drive().await;
        self.finish(&result).await;
        result
    }

    async fn drive(&mut self) -> FeedResult<()> {
        if let Flow::Stopped = self.establish().await? {
            return Ok(());
        }
        loop {
            let msg = tokio::select! {
                biased;
                _ = self.shutdown.changed() => return Ok(()),
                msg = self.inbox.recv() => match msg {
                    Some(msg) => msg,
                    None => return Ok(()),
                },
            };
            if let Err(e) = self.handle(msg).await {
                if e.is_fatal() {
                    return Err(e);
                }
                if let Flow::Stopped = self.resync(e).await? {
                    return Ok(());
                }
            }
        }
    }

    async fn finish(&mut self, result: &FeedResult<()>) {
        let trades = self.feed.aggregator.drain_all();
        if let Some(event) = self.feed.refresh(Vec::new(), trades, Instant::now()) {
            let seq = event.sequence_number;
            match tokio::time::timeout(FINAL_FLUSH_TIMEOUT, self.publish(event)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(seq, error = %e, "Final trade flush not delivered"),
                Err(_) => warn!(seq, timeout = ?FINAL_FLUSH_TIMEOUT, "Final trade flush timed out"),
            }
        }
        self.supervisor.teardown().await;
        self.set_state(ListenerState::Stopped);
        match result {
            Ok(()) => info!("Listener stopped"),
            Err(e) => warn!(error = %e, "Listener failed"),
        }
    }

    fn set_state(&mut self, state: ListenerState) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "Listener state change");
            self.state = state;
            self.state_tx.send_replace(state);
            metrics::gauge!(telemetry::LISTENER_STATE, "instrument" => self.instrument.symbol.clone())
                .set(state.gauge());
        }
    }

    fn channels(&self) -> Vec<Channel> {
        let mut channels = vec![Channel::OrderBook, Channel::Trades];
        if self.config.coarse_depth.is_some() {
            channels.push(Channel::CoarseBook);
        }
        channels
    }

    fn pulls_snapshots(&self) -> bool {
        self.config.snapshot_source == SnapshotSource::Pulled && self.executor.is_some()
    }

    /// Connect, subscribe and start syncing, retrying with backoff until it works, a fatal
    /// error occurs or a stop is requested.
    async fn establish(&mut self) -> FeedResult<Flow> {
        loop {
            if self.failures > 0 {
                let delay = self.backoff.next_delay();
                debug!(failures = self.failures, ?delay, "Backing off before reconnect");
                if !self.pause(delay).await {
                    return Ok(Flow::Stopped);
                }
            }
            match self.try_establish().await {
                Ok(()) => return Ok(Flow::Running),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(error = %e, failures = self.failures, "Connection attempt failed");
                    self.failures += 1;
                    self.supervisor.teardown().await;
                    self.set_state(ListenerState::Disconnected);
                }
            }
        }
    }

    async fn try_establish(&mut self) -> FeedResult<()> {
        self.set_state(ListenerState::Subscribing);
        let epoch = self.supervisor.connect().await?;
        self.last_inbound = Instant::now();
        let channels = self.channels();
        self.supervisor.subscribe(&channels).await?;
        debug!(epoch, ?channels, "Subscribed");

        self.set_state(ListenerState::Syncing);
        self.feed.reset();
        self.pending_snapshot = None;
        self.attempt_snapshot(true)
    }

    // One handshake attempt. The counter only resets once the book goes live. Uncharged
    // attempts re-request a snapshot the venue deferred and leave the counter alone.
    fn attempt_snapshot(&mut self, charged: bool) -> FeedResult<()> {
        if charged {
            self.sync_attempts += 1;
            if self.sync_attempts > self.config.max_sync_attempts {
                return Err(FeedError::HandshakeExhausted { attempts: self.config.max_sync_attempts });
            }
            self.sync_started = Instant::now();
        }
        if !self.pulls_snapshots() {
            return Ok(());
        }
        let Some(executor) = &self.executor else { return Ok(()) };
        self.next_request_id += 1;
        let request_id = self.next_request_id;
        self.pending_snapshot = Some(request_id);
        trace!(request_id, attempt = self.sync_attempts, "Requesting snapshot");
        executor.market_data_into(
            MarketDataRequest::snapshot(self.instrument.symbol.clone(), self.instrument.book_type),
            self.supervisor.inbox().clone(),
            move |response| ListenerMessage::SnapshotReply { request_id, response },
        );
        Ok(())
    }

    /// Sleep unless a stop arrives first. False means stop.
    async fn pause(&mut self, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = self.shutdown.changed() => false,
        }
    }

    async fn resync(&mut self, reason: FeedError) -> FeedResult<Flow> {
        warn!(reason = %reason, state = ?self.state, "Resyncing");
        let instrument = self.instrument.symbol.clone();
        metrics::counter!(telemetry::RESYNCS, "instrument" => instrument, "reason" => reason.label()).increment(1);
        self.set_state(ListenerState::Resyncing);

        let trades = self.feed.aggregator.drain_all();
        self.emit(Vec::new(), trades).await?;
        self.supervisor.teardown().await;
        self.feed.reset();
        self.pending_snapshot = None;
        self.failures += 1;
        self.establish().await
    }

    async fn handle(&mut self, msg: ListenerMessage) -> FeedResult<()> {
        if let Some(epoch) = msg.epoch() {
            if epoch != self.supervisor.epoch() {
                trace!(epoch, current = self.supervisor.epoch(), "Dropping message from old connection");
                return Ok(());
            }
        }
        match msg {
            ListenerMessage::Frame { frame, .. } => self.on_frame(frame).await,
            ListenerMessage::TransportClosed { reason, .. } => Err(reason),
            ListenerMessage::HeartbeatCheck { .. } => self.on_heartbeat_check().await,
            ListenerMessage::HealthCheck { .. } => self.on_health_check().await,
            ListenerMessage::FlushTrades { .. } => {
                let trades = self.feed.aggregator.flush_due(Instant::now());
                self.emit(Vec::new(), trades).await
            }
            ListenerMessage::RetrySync { charged, .. } => {
                if self.state == ListenerState::Syncing && self.pending_snapshot.is_none() {
                    self.attempt_snapshot(charged)?;
                }
                Ok(())
            }
            ListenerMessage::SnapshotReply { request_id, response } => {
                self.on_snapshot_reply(request_id, response).await
            }
            ListenerMessage::Query { request, reply } => {
                let _ = reply.send(self.feed.query(&request, self.state == ListenerState::Live));
                Ok(())
            }
        }
    }

    async fn on_frame(&mut self, frame: Frame) -> FeedResult<()> {
        self.last_inbound = Instant::now();
        match self.state {
            ListenerState::Live => self.apply_and_emit(frame).await,
            ListenerState::Syncing => self.on_syncing_frame(frame).await,
            _ => Ok(()),
        }
    }

    async fn on_syncing_frame(&mut self, frame: Frame) -> FeedResult<()> {
        match frame {
            Frame::Snapshot { snapshot, resolution: Resolution::Fine, last_update_id } if !self.pulls_snapshots() => {
                self.go_live(&snapshot, last_update_id).await
            }
            Frame::Snapshot { snapshot, resolution: Resolution::Coarse, .. } => {
                self.feed.sync(&snapshot, Resolution::Coarse, None)
            }
            Frame::Error(msg) => Err(FeedError::Venue(msg)),
            Frame::Pong => Ok(()),
            // replayed in order once the pulled snapshot lands
            other if self.pulls_snapshots() => {
                self.feed.buffered.push(other);
                Ok(())
            }
            // trades do not depend on the book
            trade @ Frame::Trade(_) => self.apply_and_emit(trade).await,
            // pushed snapshots come down the same stream, so anything before one is older
            other => {
                trace!(kind = other.kind(), "Dropping book frame received before snapshot");
                Ok(())
            }
        }
    }

    async fn on_snapshot_reply(&mut self, request_id: u64, response: MarketDataResponse) -> FeedResult<()> {
        if self.state != ListenerState::Syncing || self.pending_snapshot != Some(request_id) {
            trace!(request_id, "Ignoring stale snapshot reply");
            return Ok(());
        }
        self.pending_snapshot = None;
        match (response.snapshot, response.rejection_reason) {
            (Some(snapshot), _) if response.success => match self.go_live(&snapshot, None).await {
                Err(FeedError::Book(BookError::CrossedSnapshot { bid, ask })) => {
                    debug!(bid, ask, "Pulled snapshot crossed, fetching again");
                    self.schedule_retry(true);
                    Ok(())
                }
                other => other,
            },
            (_, Some(RejectionReason::RateLimited | RejectionReason::NotReady)) => {
                // budget or readiness limits are not handshake failures
                debug!(request_id, attempt = self.sync_attempts, "Snapshot request deferred, retrying");
                self.schedule_retry(false);
                Ok(())
            }
            (_, Some(RejectionReason::Timeout)) => {
                Err(FeedError::Timeout { request_id, timeout: self.config.snapshot_timeout })
            }
            (_, Some(RejectionReason::UnknownInstrument)) => {
                Err(FeedError::UnknownInstrument { symbol: self.instrument.symbol.clone() })
            }
            (_, Some(RejectionReason::UnsupportedAggregation | RejectionReason::SubscriptionUnsupported)) => {
                Err(FeedError::Catalog(format!("venue cannot serve {:?} snapshots", self.instrument.book_type)))
            }
            (_, Some(RejectionReason::Transport(msg))) => Err(FeedError::Transport(msg)),
            (_, None) => Err(FeedError::Malformed("snapshot response without payload".into())),
        }
    }

    fn schedule_retry(&mut self, charged: bool) {
        let epoch = self.supervisor.epoch();
        self.supervisor.schedule(self.config.sync_retry, ListenerMessage::RetrySync { epoch, charged });
    }

    async fn go_live(&mut self, snapshot: &BookSnapshot, last_update_id: Option<u64>) -> FeedResult<()> {
        self.feed.sync(snapshot, Resolution::Fine, last_update_id)?;
        let deltas = self.feed.republish();
        self.set_state(ListenerState::Live);
        self.sync_attempts = 0;
        self.failures = 0;
        self.backoff.reset();
        info!(
            bid = ?self.feed.book.best_bid(),
            ask = ?self.feed.book.best_ask(),
            buffered = self.feed.buffered.len(),
            "Book live"
        );
        self.emit(deltas, Vec::new()).await?;

        let buffered = std::mem::take(&mut self.feed.buffered);
        for frame in buffered {
            self.apply_and_emit(frame).await?;
        }
        Ok(())
    }

    async fn apply_and_emit(&mut self, frame: Frame) -> FeedResult<()> {
        let outcome = self.feed.apply_frame(frame, Instant::now())?;
        if let Some(deadline) = outcome.flush_at {
            let epoch = self.supervisor.epoch();
            self.supervisor.schedule_at(deadline, ListenerMessage::FlushTrades { epoch });
        }
        self.emit(outcome.deltas, outcome.trades).await
    }

    async fn emit(&mut self, deltas: Vec<LevelDelta>, trades: Vec<AggregateTrade>) -> FeedResult<()> {
        if let Some(event) = self.feed.refresh(deltas, trades, Instant::now()) {
            self.publish(event).await?;
        }
        Ok(())
    }

    async fn publish(&mut self, event: IncrementalRefresh) -> FeedResult<()> {
        trace!(seq = event.sequence_number, heartbeat = event.is_heartbeat(), "Publishing refresh");
        metrics::counter!(telemetry::EVENTS, "instrument" => self.instrument.symbol.clone()).increment(1);
        self.upstream.send(event).await.map_err(|_| FeedError::ConsumerClosed)
    }

    async fn on_heartbeat_check(&mut self) -> FeedResult<()> {
        let now = Instant::now();
        let silent = now.duration_since(self.last_inbound);
        match self.state {
            ListenerState::Live => {
                if silent >= self.config.stale_feed {
                    return Err(FeedError::StaleFeed(silent));
                }
                if now.duration_since(self.feed.last_emit) >= self.config.heartbeat_idle {
                    let hb = self.feed.heartbeat(now);
                    self.publish(hb).await?;
                }
                Ok(())
            }
            ListenerState::Syncing if !self.pulls_snapshots() => {
                let waited = now.duration_since(self.sync_started);
                if waited >= self.config.snapshot_timeout {
                    return Err(FeedError::SnapshotTimeout(waited));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn on_health_check(&mut self) -> FeedResult<()> {
        let status = self.supervisor.status();
        if !status.is_open() {
            return Err(FeedError::Disconnected(format!("session status {status:?}")));
        }
        if self.supervisor.outbound_idle() >= self.config.keepalive_after {
            self.supervisor.keepalive().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::RawLevel;
    use crate::market_data::normaliser::Normaliser;

    fn feed() -> FeedState {
        let instrument = Instrument::new("TEST", Normaliser::new(100, 1), BookType::L2);
        FeedState::new(&instrument, &ListenerConfig::default())
    }

    fn l2(bids: &[(f64, f64)], asks: &[(f64, f64)]) -> BookSnapshot {
        BookSnapshot::L2 {
            bids: bids.iter().map(|(p, q)| RawLevel::new(*p, *q)).collect(),
            asks: asks.iter().map(|(p, q)| RawLevel::new(*p, *q)).collect(),
        }
    }

    fn update(bids: &[(f64, f64)], asks: &[(f64, f64)], update_id: Option<u64>) -> Frame {
        Frame::LevelUpdate {
            bids: bids.iter().map(|(p, q)| RawLevel::new(*p, *q)).collect(),
            asks: asks.iter().map(|(p, q)| RawLevel::new(*p, *q)).collect(),
            update_id,
        }
    }

    #[test]
    fn test_resync_publishes_only_real_changes() {
        let mut feed = feed();
        feed.sync(&l2(&[(10.00, 5.0), (9.99, 1.0)], &[(10.01, 3.0)]), Resolution::Fine, None).unwrap();
        assert_eq!(feed.republish().len(), 3);

        feed.reset();
        feed.sync(&l2(&[(10.00, 5.0)], &[(10.01, 4.0)]), Resolution::Fine, None).unwrap();
        let deltas = feed.republish();
        assert_eq!(deltas, vec![LevelDelta::new(Side::BUY, 999, 0), LevelDelta::new(Side::SELL, 1001, 4)]);
    }

    #[test]
    fn test_updates_older_than_snapshot_are_skipped() {
        let mut feed = feed();
        feed.sync(&l2(&[(10.00, 5.0)], &[(10.01, 3.0)]), Resolution::Fine, Some(50)).unwrap();
        let now = Instant::now();
        let skipped = feed.apply_frame(update(&[(9.98, 1.0)], &[], Some(50)), now).unwrap();
        assert!(skipped.deltas.is_empty());
        let applied = feed.apply_frame(update(&[(9.98, 1.0)], &[], Some(51)), now).unwrap();
        assert_eq!(applied.deltas, vec![LevelDelta::new(Side::BUY, 998, 1)]);
    }

    #[test]
    fn test_crossing_batch_is_an_error() {
        let mut feed = feed();
        feed.sync(&l2(&[(10.00, 5.0)], &[(10.01, 3.0)]), Resolution::Fine, None).unwrap();
        let err = feed.apply_frame(update(&[(10.05, 1.0)], &[], None), Instant::now()).unwrap_err();
        assert_eq!(err, FeedError::Crossed { bid: 1005, ask: 1001 });
    }

    #[test]
    fn test_merged_publishing_uses_coarse_beyond_fine() {
        let instrument = Instrument::new("TEST", Normaliser::new(100, 1), BookType::L2);
        let config = ListenerConfig { coarse_depth: Some(3), ..ListenerConfig::default() };
        let mut feed = FeedState::new(&instrument, &config);
        feed.sync(&l2(&[(9.00, 50.0), (8.00, 60.0)], &[(11.00, 70.0)]), Resolution::Coarse, None).unwrap();
        feed.sync(&l2(&[(10.00, 5.0)], &[(10.01, 3.0)]), Resolution::Fine, None).unwrap();
        feed.republish();
        assert_eq!(feed.published.top(Side::BUY, 10), vec![(1000, 5), (900, 50), (800, 60)]);
        assert_eq!(feed.published.top(Side::SELL, 10), vec![(1001, 3), (1100, 70)]);

        // a fine level beyond the old worst suppresses the coarse row it now covers
        let out = feed.apply_frame(update(&[(8.50, 1.0)], &[], None), Instant::now()).unwrap();
        assert!(out.deltas.contains(&LevelDelta::new(Side::BUY, 900, 0)));
        assert_eq!(feed.published.top(Side::BUY, 10), vec![(1000, 5), (850, 1), (800, 60)]);
    }

    #[test]
    fn test_refresh_sequence_and_heartbeat() {
        let mut feed = feed();
        let now = Instant::now();
        assert!(feed.refresh(Vec::new(), Vec::new(), now).is_none());
        let first = feed.refresh(vec![LevelDelta::new(Side::BUY, 1, 1)], Vec::new(), now).unwrap();
        let hb = feed.heartbeat(now);
        assert_eq!(first.sequence_number, 1);
        assert!(first.trades.is_none());
        assert_eq!(hb.sequence_number, 2);
        assert!(hb.is_heartbeat());
    }

    #[test]
    fn test_query_answers_from_published_view() {
        let mut feed = feed();
        let request = MarketDataRequest::snapshot("TEST", BookType::L2);
        assert_eq!(feed.query(&request, false).rejection_reason, Some(RejectionReason::NotReady));

        feed.sync(&l2(&[(10.00, 5.0)], &[(10.01, 3.0)]), Resolution::Fine, None).unwrap();
        let deltas = feed.republish();
        feed.refresh(deltas, Vec::new(), Instant::now());
        let response = feed.query(&request, true);
        assert!(response.success);
        assert_eq!(response.sequence_number, 1);
        assert_eq!(response.snapshot, Some(l2(&[(10.00, 5.0)], &[(10.01, 3.0)])));

        let other = MarketDataRequest::snapshot("OTHER", BookType::L2);
        assert_eq!(feed.query(&other, true).rejection_reason, Some(RejectionReason::UnknownInstrument));
        let l3 = MarketDataRequest::snapshot("TEST", BookType::L3);
        assert_eq!(feed.query(&l3, true).rejection_reason, Some(RejectionReason::UnsupportedAggregation));
    }
}
