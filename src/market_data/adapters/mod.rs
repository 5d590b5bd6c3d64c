// Shared traits + frame type for venue adapters
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::engine::types::{BookSnapshot, BookType, RawLevel, RawOrder, Side};
use crate::error::FeedResult;
use crate::market_data::instrument::Instrument;

/// Depth resolution of a pushed snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Resolution {
    Fine,   // full-precision levels, authoritative near the touch
    Coarse, // rounded/aggregated depth, used only beyond the fine feed's range
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTrade {
    pub id: String,
    pub price: f64,
    pub quantity: f64,
    pub side: Side, // taker side
    pub timestamp_ms: u64,
    pub aggregate_key: Option<String>,
}

/// Typed inbound frame, already decoded by the venue layer.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Snapshot { snapshot: BookSnapshot, resolution: Resolution, last_update_id: Option<u64> },
    LevelUpdate { bids: Vec<RawLevel>, asks: Vec<RawLevel>, update_id: Option<u64> },
    OrderAdd { order: RawOrder, update_id: Option<u64> },
    OrderChange { order_id: String, price: f64, quantity: f64, update_id: Option<u64> },
    OrderDelete { order_id: String, update_id: Option<u64> },
    Trade(RawTrade),
    Error(String),
    Pong,
}

impl Frame {
    /// Venue sequence id for book frames that carry one.
    pub fn update_id(&self) -> Option<u64> {
        match self {
            Frame::LevelUpdate { update_id, .. }
            | Frame::OrderAdd { update_id, .. }
            | Frame::OrderChange { update_id, .. }
            | Frame::OrderDelete { update_id, .. } => *update_id,
            Frame::Snapshot { last_update_id, .. } => *last_update_id,
            Frame::Trade(_) | Frame::Error(_) | Frame::Pong => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Snapshot { .. } => "snapshot",
            Frame::LevelUpdate { .. } => "level_update",
            Frame::OrderAdd { .. } => "order_add",
            Frame::OrderChange { .. } => "order_change",
            Frame::OrderDelete { .. } => "order_delete",
            Frame::Trade(_) => "trade",
            Frame::Error(_) => "error",
            Frame::Pong => "pong",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    OrderBook,
    CoarseBook,
    Trades,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    Open,
    Error(String),
    Closed,
}

impl SessionStatus {
    pub fn is_open(&self) -> bool {
        matches!(self, SessionStatus::Open)
    }
}

pub type FrameStream = BoxStream<'static, FeedResult<Frame>>;

/// Write half of an open connection. Reading happens through the paired `FrameStream`.
#[async_trait::async_trait]
pub trait Session: Send {
    // Returns once the venue accepted the subscription
    async fn subscribe(&mut self, instrument: &Instrument, channels: &[Channel]) -> FeedResult<()>;
    async fn ping(&mut self) -> FeedResult<()>;
    fn status(&self) -> SessionStatus;
    async fn disconnect(&mut self);
}

#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn connect(&self, instrument: &Instrument) -> FeedResult<(Box<dyn Session>, FrameStream)>;
}

/// Pull-style egress used by the dispatch pool workers.
#[async_trait::async_trait]
pub trait VenueQuery: Send + Sync + 'static {
    async fn order_book(&self, symbol: &str, level: BookType) -> FeedResult<BookSnapshot>;
    async fn instrument(&self, symbol: &str) -> FeedResult<Instrument>;

    fn supports(&self, level: BookType) -> bool {
        level == BookType::L2
    }
}

pub mod channel;
// Make the Hyperliquid adapter visible
pub mod hyperliquid;
pub mod hyperliquid_types;
