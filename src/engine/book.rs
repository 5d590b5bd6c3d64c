use std::cmp::Ordering;
use std::collections::BTreeMap;

use ahash::{AHashMap, AHashSet};
use itertools::{Either, EitherOrBoth, Itertools};
use tracing::{debug, instrument, trace};

use crate::engine::types::{
    BookError, BookSnapshot, BookType, DiffEntry, LevelDelta, OrderId, RawLevel, RawOrder, Side,
};
use crate::market_data::normaliser::Normaliser;

// Resting order tracked by an L3 book
#[derive(Debug, Clone, PartialEq, Eq)]
struct Resting {
    side: Side,
    price: i64,
    quantity: u64,
}

/// In-memory book for one instrument, keyed by integer ticks.
///
/// L2 books hold only the aggregated `bids`/`asks` level maps. L3 books additionally track
/// every resting order and derive the level maps from them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBook {
    book_type: BookType,
    normaliser: Normaliser,
    pub bids: BTreeMap<i64, u64>, // highest price = best bid
    pub asks: BTreeMap<i64, u64>, // lowest price  = best ask
    orders: AHashMap<OrderId, Resting>,
}

impl OrderBook {
    pub fn new(book_type: BookType, normaliser: Normaliser) -> Self {
        Self {
            book_type,
            normaliser,
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            orders: AHashMap::new(),
        }
    }

    pub fn book_type(&self) -> BookType {
        self.book_type
    }

    pub fn normaliser(&self) -> Normaliser {
        self.normaliser
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }

    pub fn order_count(&self) -> usize {
        self.orders.len()
    }

    pub fn clear(&mut self) {
        self.bids.clear();
        self.asks.clear();
        self.orders.clear();
    }

    /// Replace the whole book from a snapshot.
    ///
    /// A crossed snapshot leaves the book empty and returns `CrossedSnapshot`; the caller is
    /// expected to discard it and fetch a new one.
    #[instrument(level = "debug", skip(self, snapshot))]
    pub fn sync(&mut self, snapshot: &BookSnapshot) -> Result<(), BookError> {
        self.clear();
        let norm = self.normaliser;
        match (self.book_type, snapshot) {
            (BookType::L2, BookSnapshot::L2 { bids, asks }) => {
                for level in bids {
                    self.set_level(Side::BUY, norm.price_to_ticks(level.price), norm.size_to_lots(level.quantity));
                }
                for level in asks {
                    self.set_level(Side::SELL, norm.price_to_ticks(level.price), norm.size_to_lots(level.quantity));
                }
            }
            (BookType::L3, BookSnapshot::L3 { orders }) => {
                for order in orders {
                    if let Err(e) = self.add_order(order.order_id.clone(), order.side, order.price, order.quantity) {
                        self.clear();
                        return Err(e);
                    }
                }
            }
            (book, _) => {
                return Err(BookError::WrongBookType { book, entry: "snapshot" });
            }
        }

        if let (Some((bid, _)), Some((ask, _))) = (self.best_bid(), self.best_ask()) {
            if bid >= ask {
                self.clear();
                return Err(BookError::CrossedSnapshot { bid, ask });
            }
        }
        debug!(
            bid_levels = self.bids.len(),
            ask_levels = self.asks.len(),
            orders = self.orders.len(),
            "Book synced from snapshot"
        );
        Ok(())
    }

    /// Apply one diff batch and return the final value of every touched level.
    ///
    /// Each `(side, price)` appears at most once in the result, in first-touch order. The book
    /// may be crossed while the batch is applied; callers check `crossed()` afterwards. An
    /// error aborts the batch midway, leaving the book unfit for further use.
    #[instrument(level = "trace", skip(self, entries), fields(entries = entries.len()))]
    pub fn apply_diff(&mut self, entries: &[DiffEntry]) -> Result<Vec<LevelDelta>, BookError> {
        let mut touched: Vec<(Side, i64)> = Vec::with_capacity(entries.len());
        let mut seen: AHashSet<(Side, i64)> = AHashSet::with_capacity(entries.len());
        let mut touch = |side: Side, price: i64| {
            if seen.insert((side, price)) {
                touched.push((side, price));
            }
        };

        for entry in entries {
            if entry.book_type() != self.book_type {
                return Err(BookError::wrong_entry(self.book_type, entry));
            }
            match entry {
                DiffEntry::Level { side, price, quantity } => {
                    let key = self.normaliser.price_to_ticks(*price);
                    let lots = self.normaliser.size_to_lots(*quantity);
                    self.set_level(*side, key, lots);
                    touch(*side, key);
                }
                DiffEntry::Add { order_id, side, price, quantity } => {
                    let key = self.add_order(order_id.clone(), *side, *price, *quantity)?;
                    touch(*side, key);
                }
                DiffEntry::Change { order_id, price, quantity } => {
                    let (side, old_key, new_key) = self.change_order(order_id, *price, *quantity)?;
                    touch(side, old_key);
                    touch(side, new_key);
                }
                DiffEntry::Delete { order_id } => {
                    let (side, key) = self.delete_order(order_id)?;
                    touch(side, key);
                }
            }
        }

        let deltas = touched
            .into_iter()
            .map(|(side, price)| LevelDelta::new(side, price, self.level(side, price)))
            .collect::<Vec<_>>();
        trace!(deltas = deltas.len(), "Diff batch applied");
        Ok(deltas)
    }

    /// Apply already-quantized level deltas. Only the level maps are touched.
    pub fn apply_deltas(&mut self, deltas: &[LevelDelta]) {
        for delta in deltas {
            self.set_level(delta.side, delta.price, delta.quantity);
        }
    }

    fn add_order(&mut self, order_id: OrderId, side: Side, price: f64, quantity: f64) -> Result<i64, BookError> {
        if self.orders.contains_key(&order_id) {
            return Err(BookError::DuplicateOrder(order_id));
        }
        let key = self.normaliser.price_to_ticks(price);
        let lots = self.normaliser.size_to_lots(quantity);
        // sub-lot orders stay tracked so a later change or delete still finds them
        self.adjust_level(side, key, lots as i128);
        self.orders.insert(order_id, Resting { side, price: key, quantity: lots });
        Ok(key)
    }

    // Returns (side, old key, new key). The old level keeps whatever other orders still rest there.
    fn change_order(&mut self, order_id: &str, price: f64, quantity: f64) -> Result<(Side, i64, i64), BookError> {
        let new_key = self.normaliser.price_to_ticks(price);
        let new_lots = self.normaliser.size_to_lots(quantity);
        let resting = self
            .orders
            .get(order_id)
            .cloned()
            .ok_or_else(|| BookError::UnknownOrder(order_id.to_string()))?;

        self.adjust_level(resting.side, resting.price, -(resting.quantity as i128));
        self.adjust_level(resting.side, new_key, new_lots as i128);
        if let Some(order) = self.orders.get_mut(order_id) {
            order.price = new_key;
            order.quantity = new_lots;
        }
        Ok((resting.side, resting.price, new_key))
    }

    fn delete_order(&mut self, order_id: &str) -> Result<(Side, i64), BookError> {
        let resting = self
            .orders
            .remove(order_id)
            .ok_or_else(|| BookError::UnknownOrder(order_id.to_string()))?;
        self.adjust_level(resting.side, resting.price, -(resting.quantity as i128));
        Ok((resting.side, resting.price))
    }

    fn levels_mut(&mut self, side: Side) -> &mut BTreeMap<i64, u64> {
        match side {
            Side::BUY => &mut self.bids,
            Side::SELL => &mut self.asks,
        }
    }

    fn levels(&self, side: Side) -> &BTreeMap<i64, u64> {
        match side {
            Side::BUY => &self.bids,
            Side::SELL => &self.asks,
        }
    }

    // Zero means absent, never stored
    fn set_level(&mut self, side: Side, price: i64, quantity: u64) {
        let levels = self.levels_mut(side);
        if quantity == 0 {
            levels.remove(&price);
        } else {
            levels.insert(price, quantity);
        }
    }

    fn adjust_level(&mut self, side: Side, price: i64, change: i128) {
        let current = self.level(side, price) as i128;
        let updated = (current + change).clamp(0, u64::MAX as i128) as u64;
        self.set_level(side, price, updated);
    }

    /// Aggregate quantity resting at a price, zero when absent.
    pub fn level(&self, side: Side, price: i64) -> u64 {
        self.levels(side).get(&price).copied().unwrap_or(0)
    }

    pub fn best_bid(&self) -> Option<(i64, u64)> {
        self.bids.iter().next_back().map(|(p, q)| (*p, *q))
    }

    pub fn best_ask(&self) -> Option<(i64, u64)> {
        self.asks.iter().next().map(|(p, q)| (*p, *q))
    }

    pub fn spread(&self) -> Option<i64> {
        let (bid, _) = self.best_bid()?;
        let (ask, _) = self.best_ask()?;
        Some(ask - bid)
    }

    pub fn crossed(&self) -> bool {
        matches!((self.best_bid(), self.best_ask()), (Some((bid, _)), Some((ask, _))) if bid >= ask)
    }

    /// Levels of one side, best price first.
    pub fn iter_side(&self, side: Side) -> impl Iterator<Item = (i64, u64)> + '_ {
        match side {
            Side::BUY => Either::Left(self.bids.iter().rev().map(|(p, q)| (*p, *q))),
            Side::SELL => Either::Right(self.asks.iter().map(|(p, q)| (*p, *q))),
        }
    }

    pub fn top(&self, side: Side, depth: usize) -> Vec<(i64, u64)> {
        self.iter_side(side).take(depth).collect()
    }

    /// Level changes that make the top `depth` rows of both sides of `self` equal those of
    /// `other` once applied.
    ///
    /// Rows of `self` worse than the last visible row of `other` are left alone when `other`
    /// fills the window. When `other` has fewer than `depth` rows on a side, that side is
    /// complete and every extra row of `self` is removed.
    pub fn diff(&self, other: &OrderBook, depth: usize) -> Vec<LevelDelta> {
        let mut deltas = Vec::new();
        if depth == 0 {
            return deltas;
        }
        for side in [Side::BUY, Side::SELL] {
            self.diff_side(other, side, depth, &mut deltas);
        }
        deltas
    }

    fn diff_side(&self, other: &OrderBook, side: Side, depth: usize, deltas: &mut Vec<LevelDelta>) {
        let target = other.top(side, depth);
        let window_full = target.len() == depth;
        let worst = target.last().map(|(p, _)| *p);

        let current = self.iter_side(side).take_while(|(price, _)| match (window_full, worst) {
            (true, Some(worst)) => priority(side, *price, worst) != Ordering::Greater,
            _ => true,
        });

        for pair in current.merge_join_by(target.iter().copied(), |(a, _), (b, _)| priority(side, *a, *b)) {
            match pair {
                EitherOrBoth::Left((price, _)) => deltas.push(LevelDelta::new(side, price, 0)),
                EitherOrBoth::Right((price, quantity)) => deltas.push(LevelDelta::new(side, price, quantity)),
                EitherOrBoth::Both((price, have), (_, want)) => {
                    if have != want {
                        deltas.push(LevelDelta::new(side, price, want));
                    }
                }
            }
        }
    }

    /// Compose this fine-grained book with a coarse/aggregated one.
    ///
    /// The fine side is authoritative down to its worst price; coarse rows are taken only
    /// beyond it. The result holds at most `depth` rows per side.
    pub fn merged_view(&self, coarse: &OrderBook, depth: usize) -> OrderBook {
        let mut merged = OrderBook::new(BookType::L2, self.normaliser);
        for side in [Side::BUY, Side::SELL] {
            let fine_worst = self.iter_side(side).last().map(|(p, _)| p);
            let beyond = coarse.iter_side(side).filter(move |(price, _)| match fine_worst {
                Some(worst) => priority(side, *price, worst) == Ordering::Greater,
                None => true,
            });
            let rows = self.iter_side(side).chain(beyond).take(depth).collect::<Vec<_>>();
            for (price, quantity) in rows {
                merged.set_level(side, price, quantity);
            }
        }
        merged
    }

    /// Aggregated levels in venue units, best price first.
    pub fn level_snapshot(&self) -> BookSnapshot {
        let to_raw = |(price, quantity): (i64, u64)| {
            RawLevel::new(self.normaliser.ticks_to_price(price), self.normaliser.lots_to_size(quantity))
        };
        BookSnapshot::L2 {
            bids: self.iter_side(Side::BUY).map(to_raw).collect(),
            asks: self.iter_side(Side::SELL).map(to_raw).collect(),
        }
    }

    /// Snapshot in the book's own resolution, in venue units.
    pub fn snapshot(&self) -> BookSnapshot {
        match self.book_type {
            BookType::L2 => self.level_snapshot(),
            BookType::L3 => {
                let mut orders = self
                    .orders
                    .iter()
                    .filter(|(_, resting)| resting.quantity > 0)
                    .map(|(id, resting)| RawOrder {
                        order_id: id.clone(),
                        side: resting.side,
                        price: self.normaliser.ticks_to_price(resting.price),
                        quantity: self.normaliser.lots_to_size(resting.quantity),
                    })
                    .collect::<Vec<_>>();
                orders.sort_by(|a, b| {
                    a.side
                        .cmp(&b.side)
                        .then(a.price.total_cmp(&b.price))
                        .then_with(|| a.order_id.cmp(&b.order_id))
                });
                BookSnapshot::L3 { orders }
            }
        }
    }
}

// Less = `a` is the better price for `side`
fn priority(side: Side, a: i64, b: i64) -> Ordering {
    match side {
        Side::BUY => b.cmp(&a),
        Side::SELL => a.cmp(&b),
    }
}
