// Rate-limited request dispatch shared by every instrument
pub mod rate_limit;
pub mod pool;
pub mod executor;

pub use executor::{ExecutorHandle, MarketDataExecutor, QueryWeights};
pub use pool::{DispatchPool, PendingRequest, Worker, WorkerLimits};
pub use rate_limit::{RateLimit, RateLimiter};

use serde::{Deserialize, Serialize};

/// Query families a venue budgets independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryClass {
    OrderBook,
    Catalog,
}

impl QueryClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryClass::OrderBook => "order_book",
            QueryClass::Catalog => "catalog",
        }
    }
}
