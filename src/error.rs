use std::time::Duration;

use thiserror::Error;

use crate::dispatch::QueryClass;
use crate::engine::types::BookError;

pub type FeedResult<T> = Result<T, FeedError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    // Retryable: every worker has spent its budget for this class
    #[error("all workers rate limited for {class:?} queries")]
    RateLimited { class: QueryClass },

    #[error("request {request_id} was dropped before completing")]
    Cancelled { request_id: u64 },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FeedError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("transport disconnected: {0}")]
    Disconnected(String),

    #[error("venue reported an error: {0}")]
    Venue(String),

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error(transparent)]
    Book(#[from] BookError),

    #[error("book crossed after batch: bid {bid} >= ask {ask}")]
    Crossed { bid: i64, ask: i64 },

    #[error("request {request_id} timed out after {timeout:?}")]
    Timeout { request_id: u64, timeout: Duration },

    #[error("no snapshot received within {0:?}")]
    SnapshotTimeout(Duration),

    #[error("no inbound traffic for {0:?}")]
    StaleFeed(Duration),

    #[error("snapshot handshake failed after {attempts} attempts")]
    HandshakeExhausted { attempts: u32 },

    #[error("unknown instrument {symbol}")]
    UnknownInstrument { symbol: String },

    #[error("catalog lookup failed: {0}")]
    Catalog(String),

    #[error("downstream consumer closed")]
    ConsumerClosed,

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

impl FeedError {
    /// Errors that end the listener instead of triggering a resync.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FeedError::HandshakeExhausted { .. }
                | FeedError::UnknownInstrument { .. }
                | FeedError::Catalog(_)
                | FeedError::ConsumerClosed
        )
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, FeedError::Dispatch(DispatchError::RateLimited { .. }))
    }

    pub(crate) fn label(&self) -> &'static str {
        match self {
            FeedError::Transport(_) => "transport",
            FeedError::Disconnected(_) => "disconnected",
            FeedError::Venue(_) => "venue",
            FeedError::Malformed(_) => "malformed",
            FeedError::Book(_) => "book",
            FeedError::Crossed { .. } => "crossed",
            FeedError::Timeout { .. } => "timeout",
            FeedError::SnapshotTimeout(_) => "snapshot_timeout",
            FeedError::StaleFeed(_) => "stale_feed",
            FeedError::HandshakeExhausted { .. } => "handshake_exhausted",
            FeedError::UnknownInstrument { .. } => "unknown_instrument",
            FeedError::Catalog(_) => "catalog",
            FeedError::ConsumerClosed => "consumer_closed",
            FeedError::Dispatch(_) => "dispatch",
        }
    }
}

impl From<reqwest::Error> for FeedError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            FeedError::Malformed(err.to_string())
        } else {
            FeedError::Transport(err.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for FeedError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => FeedError::Disconnected(err.to_string()),
            other => FeedError::Transport(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for FeedError {
    fn from(err: serde_json::Error) -> Self {
        FeedError::Malformed(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(FeedError::HandshakeExhausted { attempts: 100 }.is_fatal());
        assert!(FeedError::ConsumerClosed.is_fatal());
        assert!(!FeedError::Crossed { bid: 2, ask: 1 }.is_fatal());
        assert!(!FeedError::Transport("reset".into()).is_fatal());

        let limited = FeedError::from(DispatchError::RateLimited { class: QueryClass::OrderBook });
        assert!(limited.is_rate_limited());
        assert!(!limited.is_fatal());
    }

    #[test]
    fn test_book_error_is_wrapped() {
        let err: FeedError = BookError::UnknownOrder("x".into()).into();
        assert_eq!(err.label(), "book");
        assert_eq!(err.to_string(), "unknown order id x");
    }
}
