// Normalized events published downstream and the pull request/response pair
use serde::{Deserialize, Serialize};

use crate::engine::aggregator::AggregateTrade;
use crate::engine::types::{BookSnapshot, BookType, LevelDelta};
use crate::error::FeedError;

/// One published change. A refresh with neither payload is a heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncrementalRefresh {
    pub instrument: String,
    pub sequence_number: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level_deltas: Option<Vec<LevelDelta>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trades: Option<Vec<AggregateTrade>>,
}

impl IncrementalRefresh {
    pub fn heartbeat(instrument: impl Into<String>, sequence_number: u64) -> Self {
        Self { instrument: instrument.into(), sequence_number, level_deltas: None, trades: None }
    }

    pub fn is_heartbeat(&self) -> bool {
        self.level_deltas.is_none() && self.trades.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketDataRequest {
    pub instrument: String,
    pub aggregation_level: BookType,
    #[serde(default)]
    pub subscribe: bool,
}

impl MarketDataRequest {
    pub fn snapshot(instrument: impl Into<String>, aggregation_level: BookType) -> Self {
        Self { instrument: instrument.into(), aggregation_level, subscribe: false }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum RejectionReason {
    RateLimited,
    Timeout,
    Transport(String),
    NotReady,
    UnsupportedAggregation,
    SubscriptionUnsupported,
    UnknownInstrument,
}

impl From<&FeedError> for RejectionReason {
    fn from(err: &FeedError) -> Self {
        match err {
            e if e.is_rate_limited() => RejectionReason::RateLimited,
            FeedError::Timeout { .. } => RejectionReason::Timeout,
            FeedError::UnknownInstrument { .. } => RejectionReason::UnknownInstrument,
            other => RejectionReason::Transport(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketDataResponse {
    pub success: bool,
    pub snapshot: Option<BookSnapshot>,
    pub sequence_number: u64,
    pub rejection_reason: Option<RejectionReason>,
}

impl MarketDataResponse {
    pub fn accepted(snapshot: BookSnapshot, sequence_number: u64) -> Self {
        Self { success: true, snapshot: Some(snapshot), sequence_number, rejection_reason: None }
    }

    pub fn rejected(reason: RejectionReason) -> Self {
        Self { success: false, snapshot: None, sequence_number: 0, rejection_reason: Some(reason) }
    }
}

/// Per-instrument event counter. Each `next` is exactly one more than the last.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SequenceCounter(u64);

impl SequenceCounter {
    pub fn next(&mut self) -> u64 {
        self.0 += 1;
        self.0
    }

    pub fn current(&self) -> u64 {
        self.0
    }
}
