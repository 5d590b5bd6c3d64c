use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tokio::time::{Duration, Instant};
use tracing::trace;

use crate::engine::types::Side;

pub const DEFAULT_FLUSH_DELAY: Duration = Duration::from_millis(20);

/// A single raw trade print, already quantized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradePrint {
    pub id: String,
    pub price: i64,
    pub quantity: u64,
    pub side: Side,
    pub timestamp_ms: u64,
    // Venue correlation key (e.g. taker order id); None means each print stands alone
    pub aggregate_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeChild {
    pub price: i64,
    pub quantity: u64,
    pub id: String,
}

/// Prints sharing one aggregation key, published as one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateTrade {
    pub aggregate_id: u64,
    pub side: Side,
    pub timestamp_ms: u64,
    pub children: SmallVec<[TradeChild; 4]>,
}

impl AggregateTrade {
    pub fn quantity(&self) -> u64 {
        self.children.iter().map(|c| c.quantity).sum()
    }
}

#[derive(Debug)]
struct Pending {
    key: Option<String>,
    trade: AggregateTrade,
    deadline: Instant,
    open: bool,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct IngestOutcome {
    pub emitted: Vec<AggregateTrade>,
    // Set when the print opened a new aggregate whose flush must be scheduled
    pub opened: Option<Instant>,
}

/// Groups raw prints into aggregates and releases them strictly in creation order.
///
/// An aggregate stays open while prints with its key keep arriving before its deadline.
/// A print with another key closes it. Closed aggregates leave the queue from the front
/// only, so an aggregate is never released ahead of an older one that is still pending.
#[derive(Debug)]
pub struct TradeAggregator {
    delay: Duration,
    queue: VecDeque<Pending>,
    next_id: u64,
    last_timestamp_ms: Option<u64>,
}

impl Default for TradeAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_FLUSH_DELAY)
    }
}

impl TradeAggregator {
    pub fn new(delay: Duration) -> Self {
        Self { delay, queue: VecDeque::new(), next_id: 1, last_timestamp_ms: None }
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn ingest(&mut self, print: TradePrint, now: Instant) -> IngestOutcome {
        let mut outcome = IngestOutcome::default();
        let child = TradeChild { price: print.price, quantity: print.quantity, id: print.id };

        let extends = match (self.queue.back(), &print.aggregate_key) {
            (Some(back), Some(key)) => back.open && back.key.as_deref() == Some(key.as_str()) && now < back.deadline,
            _ => false,
        };

        if extends {
            if let Some(back) = self.queue.back_mut() {
                back.trade.children.push(child);
            }
        } else {
            if let Some(back) = self.queue.back_mut() {
                back.open = false;
            }
            let timestamp_ms = self.next_timestamp(print.timestamp_ms);
            let aggregate_id = self.next_id;
            self.next_id += 1;

            let mut children = SmallVec::new();
            children.push(child);
            let keyed = print.aggregate_key.is_some();
            let deadline = now + self.delay;
            self.queue.push_back(Pending {
                key: print.aggregate_key,
                trade: AggregateTrade { aggregate_id, side: print.side, timestamp_ms, children },
                deadline,
                open: keyed,
            });
            if keyed {
                outcome.opened = Some(deadline);
            }
            trace!(aggregate_id, keyed, "Opened aggregate");
        }

        self.drain_front(now, &mut outcome.emitted);
        outcome
    }

    /// Release every aggregate at the front of the queue that is closed or past its deadline.
    pub fn flush_due(&mut self, now: Instant) -> Vec<AggregateTrade> {
        let mut emitted = Vec::new();
        self.drain_front(now, &mut emitted);
        emitted
    }

    /// Release everything, in order, regardless of deadlines.
    pub fn drain_all(&mut self) -> Vec<AggregateTrade> {
        self.queue.drain(..).map(|p| p.trade).collect()
    }

    fn drain_front(&mut self, now: Instant, out: &mut Vec<AggregateTrade>) {
        while let Some(front) = self.queue.front() {
            if front.open && front.deadline > now {
                break;
            }
            if let Some(done) = self.queue.pop_front() {
                out.push(done.trade);
            }
        }
    }

    fn next_timestamp(&mut self, natural: u64) -> u64 {
        let ts = match self.last_timestamp_ms {
            Some(last) if natural <= last => last + 1,
            _ => natural,
        };
        self.last_timestamp_ms = Some(ts);
        ts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn print(id: &str, key: Option<&str>, ts: u64) -> TradePrint {
        TradePrint {
            id: id.to_string(),
            price: 1000,
            quantity: 1,
            side: Side::BUY,
            timestamp_ms: ts,
            aggregate_key: key.map(str::to_string),
        }
    }

    fn child_ids(trade: &AggregateTrade) -> Vec<&str> {
        trade.children.iter().map(|c| c.id.as_str()).collect()
    }

    #[test]
    fn test_key_interruption_closes_aggregate() {
        let mut agg = TradeAggregator::default();
        let t0 = Instant::now();
        let mut emitted = Vec::new();

        emitted.extend(agg.ingest(print("a", Some("k1"), 100), t0).emitted);
        emitted.extend(agg.ingest(print("b", Some("k1"), 101), t0 + Duration::from_millis(1)).emitted);
        emitted.extend(agg.ingest(print("c", Some("k2"), 102), t0 + Duration::from_millis(2)).emitted);
        emitted.extend(agg.ingest(print("d", Some("k1"), 103), t0 + Duration::from_millis(3)).emitted);

        assert_eq!(emitted.len(), 2);
        assert_eq!(child_ids(&emitted[0]), vec!["a", "b"]);
        assert_eq!(child_ids(&emitted[1]), vec!["c"]);
        assert_eq!(emitted[0].timestamp_ms, 100);
        assert_eq!(emitted[1].timestamp_ms, 102);

        // the late k1 print is a third, still pending aggregate
        assert_eq!(agg.pending(), 1);
        let rest = agg.flush_due(t0 + Duration::from_millis(30));
        assert_eq!(child_ids(&rest[0]), vec!["d"]);
        assert!(rest[0].aggregate_id > emitted[1].aggregate_id);
    }

    #[test]
    fn test_deadline_is_fixed_from_creation() {
        let mut agg = TradeAggregator::new(Duration::from_millis(20));
        let t0 = Instant::now();
        let opened = agg.ingest(print("a", Some("k"), 1), t0).opened;
        assert_eq!(opened, Some(t0 + Duration::from_millis(20)));

        agg.ingest(print("b", Some("k"), 2), t0 + Duration::from_millis(15));
        assert!(agg.flush_due(t0 + Duration::from_millis(19)).is_empty());
        let out = agg.flush_due(t0 + Duration::from_millis(20));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].quantity(), 2);
    }

    #[test]
    fn test_same_key_after_deadline_opens_new_aggregate() {
        let mut agg = TradeAggregator::new(Duration::from_millis(20));
        let t0 = Instant::now();
        agg.ingest(print("a", Some("k"), 1), t0);
        let outcome = agg.ingest(print("b", Some("k"), 2), t0 + Duration::from_millis(25));
        assert_eq!(outcome.emitted.len(), 1);
        assert_eq!(child_ids(&outcome.emitted[0]), vec!["a"]);
        assert!(outcome.opened.is_some());
    }

    #[test]
    fn test_keyless_prints_flush_immediately() {
        let mut agg = TradeAggregator::default();
        let t0 = Instant::now();
        let first = agg.ingest(print("a", None, 5), t0);
        assert_eq!(first.emitted.len(), 1);
        assert_eq!(first.opened, None);
        let second = agg.ingest(print("b", None, 5), t0);
        assert_eq!(second.emitted.len(), 1);
        assert_eq!(agg.pending(), 0);
    }

    #[test]
    fn test_keyless_print_waits_behind_open_aggregate() {
        let mut agg = TradeAggregator::default();
        let t0 = Instant::now();
        agg.ingest(print("a", Some("k"), 1), t0);
        // "a" is closed by the keyless print and both leave in order
        let outcome = agg.ingest(print("b", None, 2), t0);
        assert_eq!(outcome.emitted.iter().map(|t| t.children[0].id.as_str()).collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn test_timestamps_bumped_strictly_increasing() {
        let mut agg = TradeAggregator::default();
        let t0 = Instant::now();
        let mut out = Vec::new();
        out.extend(agg.ingest(print("a", None, 100), t0).emitted);
        out.extend(agg.ingest(print("b", None, 100), t0).emitted);
        out.extend(agg.ingest(print("c", None, 90), t0).emitted);
        out.extend(agg.ingest(print("d", None, 200), t0).emitted);
        let ts = out.iter().map(|t| t.timestamp_ms).collect::<Vec<_>>();
        assert_eq!(ts, vec![100, 101, 102, 200]);
    }

    #[test]
    fn test_drain_all_releases_open_aggregates() {
        let mut agg = TradeAggregator::new(Duration::from_millis(20));
        let t0 = Instant::now();
        agg.ingest(print("a", Some("k1"), 1), t0);
        let opened = agg.ingest(print("b", Some("k2"), 2), t0 + Duration::from_millis(5));
        // k1 was closed and released; k2 remains
        assert_eq!(opened.opened, Some(t0 + Duration::from_millis(25)));
        assert_eq!(agg.pending(), 1);
        let drained = agg.drain_all();
        assert_eq!(drained.len(), 1);
        assert_eq!(agg.pending(), 0);
        assert!(agg.flush_due(t0 + Duration::from_secs(1)).is_empty());
    }
}
