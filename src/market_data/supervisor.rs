use std::sync::Arc;

use futures::StreamExt;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};
use tracing::{debug, trace};

use crate::config::BackoffConfig;
use crate::error::{FeedError, FeedResult};
use crate::market_data::adapters::{Channel, Session, SessionStatus, Transport};
use crate::market_data::instrument::Instrument;
use crate::market_data::listener::ListenerMessage;

/// Exponential reconnect delay with jitter.
///
/// Each delay is drawn uniformly from `[cap / 2, cap]`, where `cap` starts at `initial` and
/// is multiplied after every draw up to `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    cap: Duration,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { cap: config.initial, config }
    }

    pub fn next_delay(&mut self) -> Duration {
        let cap = self.cap;
        self.cap = cap.mul_f64(self.config.multiplier).min(self.config.max);
        let half = cap / 2;
        let jitter_ms = rand::thread_rng().gen_range(0..=half.as_millis() as u64);
        half + Duration::from_millis(jitter_ms)
    }

    pub fn reset(&mut self) {
        self.cap = self.config.initial;
    }
}

/// Owns the transport session and the background tasks feeding the listener inbox.
///
/// Every connection gets a new epoch. Everything the supervisor posts is tagged with it so
/// the listener can drop messages from a connection it already tore down.
pub struct ConnectionSupervisor<T> {
    transport: Arc<T>,
    instrument: Instrument,
    inbox: mpsc::Sender<ListenerMessage>,
    session: Option<Box<dyn Session>>,
    tasks: JoinSet<()>,
    timers: JoinSet<()>,
    epoch: u64,
    last_outbound: Instant,
    heartbeat_check: Duration,
    health_check: Duration,
}

impl<T: Transport> ConnectionSupervisor<T> {
    pub fn new(
        transport: Arc<T>,
        instrument: Instrument,
        inbox: mpsc::Sender<ListenerMessage>,
        heartbeat_check: Duration,
        health_check: Duration,
    ) -> Self {
        Self {
            transport,
            instrument,
            inbox,
            session: None,
            tasks: JoinSet::new(),
            timers: JoinSet::new(),
            epoch: 0,
            last_outbound: Instant::now(),
            heartbeat_check,
            health_check,
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn inbox(&self) -> &mpsc::Sender<ListenerMessage> {
        &self.inbox
    }

    /// Open a fresh connection, replacing any previous one, and start the reader and ticker.
    pub async fn connect(&mut self) -> FeedResult<u64> {
        self.teardown().await;
        self.epoch += 1;
        let epoch = self.epoch;

        let (session, mut frames) = self.transport.connect(&self.instrument).await?;
        self.session = Some(session);
        self.last_outbound = Instant::now();
        debug!(instrument = %self.instrument.symbol, epoch, "Transport connected");

        let inbox = self.inbox.clone();
        self.tasks.spawn(async move {
            let reason = loop {
                match frames.next().await {
                    Some(Ok(frame)) => {
                        if inbox.send(ListenerMessage::Frame { epoch, frame }).await.is_err() {
                            return;
                        }
                    }
                    Some(Err(e)) => break e,
                    None => break FeedError::Disconnected("frame stream ended".into()),
                }
            };
            let _ = inbox.send(ListenerMessage::TransportClosed { epoch, reason }).await;
        });

        let inbox = self.inbox.clone();
        let (hb_period, health_period) = (self.heartbeat_check, self.health_check);
        self.tasks.spawn(async move {
            let start = Instant::now();
            let mut heartbeat = interval_at(start + hb_period, hb_period);
            let mut health = interval_at(start + health_period, health_period);
            heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
            health.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                let msg = tokio::select! {
                    _ = heartbeat.tick() => ListenerMessage::HeartbeatCheck { epoch },
                    _ = health.tick() => ListenerMessage::HealthCheck { epoch },
                };
                if inbox.send(msg).await.is_err() {
                    break;
                }
            }
        });

        Ok(epoch)
    }

    pub async fn subscribe(&mut self, channels: &[Channel]) -> FeedResult<()> {
        let session = self.session.as_mut().ok_or_else(not_connected)?;
        session.subscribe(&self.instrument, channels).await?;
        self.last_outbound = Instant::now();
        Ok(())
    }

    pub async fn keepalive(&mut self) -> FeedResult<()> {
        let session = self.session.as_mut().ok_or_else(not_connected)?;
        session.ping().await?;
        self.last_outbound = Instant::now();
        trace!(instrument = %self.instrument.symbol, "Keepalive sent");
        Ok(())
    }

    pub fn outbound_idle(&self) -> Duration {
        self.last_outbound.elapsed()
    }

    pub fn status(&self) -> SessionStatus {
        self.session.as_ref().map_or(SessionStatus::Closed, |s| s.status())
    }

    /// Post `msg` into the inbox after `delay`. Torn down with the connection.
    pub fn schedule(&mut self, delay: Duration, msg: ListenerMessage) {
        self.schedule_at(Instant::now() + delay, msg);
    }

    pub fn schedule_at(&mut self, deadline: Instant, msg: ListenerMessage) {
        // reap finished timers
        while self.timers.try_join_next().is_some() {}
        let inbox = self.inbox.clone();
        self.timers.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let _ = inbox.send(msg).await;
        });
    }

    /// Stop the reader, ticker and timers, then close the session.
    pub async fn teardown(&mut self) {
        self.tasks.shutdown().await;
        self.timers.shutdown().await;
        if let Some(mut session) = self.session.take() {
            session.disconnect().await;
            debug!(instrument = %self.instrument.symbol, epoch = self.epoch, "Transport torn down");
        }
    }
}

fn not_connected() -> FeedError {
    FeedError::Disconnected("no open session".into())
}
