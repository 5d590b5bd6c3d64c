// In-process transport: frames are pushed by a `ChannelFeed` handle instead of a socket.
use std::sync::Arc;

use futures::channel::mpsc;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::watch;

use super::{Channel, Frame, FrameStream, Session, SessionStatus, Transport};
use crate::error::{FeedError, FeedResult};
use crate::market_data::instrument::Instrument;

#[derive(Default)]
struct Shared {
    connection: u64,
    sender: Option<mpsc::UnboundedSender<FeedResult<Frame>>>,
    status: Option<SessionStatus>,
    subscriptions: Vec<Vec<Channel>>,
    pings: u64,
    refuse_connects: u32,
    reply_pong: bool,
}

pub struct ChannelTransport {
    shared: Arc<Mutex<Shared>>,
    connections: watch::Sender<u64>,
}

/// Test/replay controller for a `ChannelTransport`.
#[derive(Clone)]
pub struct ChannelFeed {
    shared: Arc<Mutex<Shared>>,
    connections: watch::Receiver<u64>,
}

pub fn channel_transport() -> (ChannelTransport, ChannelFeed) {
    let shared = Arc::new(Mutex::new(Shared { reply_pong: true, ..Shared::default() }));
    let (tx, rx) = watch::channel(0);
    (
        ChannelTransport { shared: Arc::clone(&shared), connections: tx },
        ChannelFeed { shared, connections: rx },
    )
}

#[async_trait::async_trait]
impl Transport for ChannelTransport {
    async fn connect(&self, _instrument: &Instrument) -> FeedResult<(Box<dyn Session>, FrameStream)> {
        let (tx, rx) = mpsc::unbounded();
        let connection = {
            let mut shared = self.shared.lock();
            if shared.refuse_connects > 0 {
                shared.refuse_connects -= 1;
                return Err(FeedError::Transport("connection refused".into()));
            }
            shared.connection += 1;
            shared.sender = Some(tx);
            shared.status = Some(SessionStatus::Open);
            shared.connection
        };
        self.connections.send_replace(connection);
        let session = ChannelSession { shared: Arc::clone(&self.shared), connection };
        Ok((Box::new(session), rx.boxed()))
    }
}

struct ChannelSession {
    shared: Arc<Mutex<Shared>>,
    connection: u64,
}

impl ChannelSession {
    fn with_current<R>(&self, f: impl FnOnce(&mut Shared) -> R) -> Option<R> {
        let mut shared = self.shared.lock();
        (shared.connection == self.connection).then(|| f(&mut shared))
    }
}

#[async_trait::async_trait]
impl Session for ChannelSession {
    async fn subscribe(&mut self, _instrument: &Instrument, channels: &[Channel]) -> FeedResult<()> {
        self.with_current(|s| s.subscriptions.push(channels.to_vec()))
            .ok_or_else(|| FeedError::Disconnected("stale session".into()))
    }

    async fn ping(&mut self) -> FeedResult<()> {
        self.with_current(|s| {
            s.pings += 1;
            if s.reply_pong {
                if let Some(tx) = &s.sender {
                    let _ = tx.unbounded_send(Ok(Frame::Pong));
                }
            }
        })
        .ok_or_else(|| FeedError::Disconnected("stale session".into()))
    }

    fn status(&self) -> SessionStatus {
        self.with_current(|s| s.status.clone().unwrap_or(SessionStatus::Closed))
            .unwrap_or(SessionStatus::Closed)
    }

    async fn disconnect(&mut self) {
        self.with_current(|s| {
            s.sender = None;
            s.status = Some(SessionStatus::Closed);
        });
    }
}

impl ChannelFeed {
    /// Number of successful connects so far.
    pub fn connections(&self) -> u64 {
        *self.connections.borrow()
    }

    /// Wait until `n` connections have been opened.
    pub async fn wait_for_connection(&self, n: u64) {
        let mut rx = self.connections.clone();
        // the transport outlives every caller in practice; a closed channel just returns
        let _ = rx.wait_for(|c| *c >= n).await;
    }

    /// Deliver a frame on the current connection. False when none is open.
    pub fn push(&self, frame: Frame) -> bool {
        let shared = self.shared.lock();
        shared.sender.as_ref().is_some_and(|tx| tx.unbounded_send(Ok(frame)).is_ok())
    }

    /// Fail the current connection's read side with `err`.
    pub fn fail(&self, err: FeedError) {
        let mut shared = self.shared.lock();
        if let Some(tx) = shared.sender.take() {
            let _ = tx.unbounded_send(Err(err));
        }
    }

    /// End the current frame stream without an error.
    pub fn close(&self) {
        self.shared.lock().sender = None;
    }

    pub fn set_status(&self, status: SessionStatus) {
        self.shared.lock().status = Some(status);
    }

    pub fn refuse_connects(&self, n: u32) {
        self.shared.lock().refuse_connects = n;
    }

    pub fn reply_pong(&self, enabled: bool) {
        self.shared.lock().reply_pong = enabled;
    }

    pub fn pings(&self) -> u64 {
        self.shared.lock().pings
    }

    pub fn subscriptions(&self) -> Vec<Vec<Channel>> {
        self.shared.lock().subscriptions.clone()
    }
}
