// Market data module entrypoint
pub mod adapters;    // venue transports + REST egress (Hyperliquid, in-process channel)
pub mod normaliser;  // converts venue floats -> ticks/lots
pub mod instrument;  // catalog entry
pub mod events;      // published refreshes + snapshot request/response
pub mod supervisor;  // connection, reader and timer tasks
pub mod listener;    // per-instrument state machine
pub mod router;      // runs one listener per instrument

pub use events::{IncrementalRefresh, MarketDataRequest, MarketDataResponse, RejectionReason};
pub use instrument::Instrument;
pub use listener::{InstrumentListener, ListenerHandle, ListenerState};
pub use router::FeedRouter;
