use serde::{Deserialize, Serialize};

pub type OrderId = String;

/// Book side. `BUY` is the bid side, `SELL` the ask side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Side {
    BUY,
    SELL
}

/// Level-by-level (L2) or order-by-order (L3) book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookType {
    L2,
    L3,
}

// Price level as decoded from the venue, still in venue units
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RawLevel {
    pub price: f64,
    pub quantity: f64,
}

impl RawLevel {
    pub fn new(price: f64, quantity: f64) -> Self {
        Self { price, quantity }
    }
}

// Single resting order as decoded from an order-by-order venue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawOrder {
    pub order_id: OrderId,
    pub side: Side,
    pub price: f64,
    pub quantity: f64,
}

/// Full point-in-time book state in venue units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BookSnapshot {
    L2 { bids: Vec<RawLevel>, asks: Vec<RawLevel> },
    L3 { orders: Vec<RawOrder> },
}

impl BookSnapshot {
    pub fn book_type(&self) -> BookType {
        match self {
            BookSnapshot::L2 { .. } => BookType::L2,
            BookSnapshot::L3 { .. } => BookType::L3,
        }
    }
}

/// One entry of an incremental diff batch.
#[derive(Debug, Clone, PartialEq)]
pub enum DiffEntry {
    // L2: absolute quantity at a price level, zero removes it
    Level { side: Side, price: f64, quantity: f64 },
    // L3 order-by-order mutations
    Add { order_id: OrderId, side: Side, price: f64, quantity: f64 },
    Change { order_id: OrderId, price: f64, quantity: f64 },
    Delete { order_id: OrderId },
}

impl DiffEntry {
    fn label(&self) -> &'static str {
        match self {
            DiffEntry::Level { .. } => "level",
            DiffEntry::Add { .. } => "add",
            DiffEntry::Change { .. } => "change",
            DiffEntry::Delete { .. } => "delete",
        }
    }

    pub(crate) fn book_type(&self) -> BookType {
        match self {
            DiffEntry::Level { .. } => BookType::L2,
            _ => BookType::L3,
        }
    }
}

/// New absolute quantity at a price level after a mutation, in ticks and lots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LevelDelta {
    pub price: i64,
    pub quantity: u64,
    pub side: Side,
}

impl LevelDelta {
    pub fn new(side: Side, price: i64, quantity: u64) -> Self {
        Self { price, quantity, side }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BookError {
    #[error("snapshot is crossed: best bid {bid} >= best ask {ask}")]
    CrossedSnapshot { bid: i64, ask: i64 },

    #[error("unknown order id {0}")]
    UnknownOrder(OrderId),

    #[error("duplicate order id {0}")]
    DuplicateOrder(OrderId),

    #[error("{entry} entry is not valid on an {book:?} book")]
    WrongBookType { book: BookType, entry: &'static str },
}

impl BookError {
    pub(crate) fn wrong_entry(book: BookType, entry: &DiffEntry) -> Self {
        BookError::WrongBookType { book, entry: entry.label() }
    }
}
