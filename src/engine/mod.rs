pub mod types;
pub use types::*;
pub mod book;
pub mod aggregator;
