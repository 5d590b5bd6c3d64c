pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod market_data;
pub mod telemetry;
