use serde::{Deserialize, Serialize};

use crate::engine::types::BookType;
use crate::market_data::normaliser::Normaliser;

/// Catalog entry for one tradable instrument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instrument {
    pub symbol: String,       // name published downstream, e.g. "ETH"
    pub venue_symbol: String, // name the venue expects on the wire
    pub normaliser: Normaliser,
    pub book_type: BookType,
}

impl Instrument {
    pub fn new(symbol: impl Into<String>, normaliser: Normaliser, book_type: BookType) -> Self {
        let symbol = symbol.into();
        Self { venue_symbol: symbol.clone(), symbol, normaliser, book_type }
    }

    pub fn with_venue_symbol(mut self, venue_symbol: impl Into<String>) -> Self {
        self.venue_symbol = venue_symbol.into();
        self
    }
}
