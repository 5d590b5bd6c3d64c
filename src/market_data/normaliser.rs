// Convert venue floats into internal integer ticks/lots.
// Every book key goes through here so equality and ordering never depend on raw floats.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Normaliser {
    pub tick_precision: u64, // ticks per price unit, e.g. 100 => 0.01 increments
    pub lot_precision: u64,  // lots per size unit, e.g. 10^szDecimals
}

impl Normaliser {
    pub fn new(tick_precision: u64, lot_precision: u64) -> Self {
        Self {
            tick_precision: tick_precision.max(1),
            lot_precision: lot_precision.max(1),
        }
    }

    /// Scales from decimal places, e.g. `(2, 4)` quotes prices in 0.01 and sizes in 0.0001.
    pub fn from_decimals(price_decimals: u32, size_decimals: u32) -> Self {
        Self::new(10u64.saturating_pow(price_decimals), 10u64.saturating_pow(size_decimals))
    }

    /// Scales from the venue's minimum price increment and round lot.
    pub fn from_increments(min_price_increment: f64, round_lot: f64) -> Self {
        Self::new(inverse_scale(min_price_increment), inverse_scale(round_lot))
    }

    pub fn min_price_increment(&self) -> f64 {
        1.0 / self.tick_precision as f64
    }

    pub fn round_lot(&self) -> f64 {
        1.0 / self.lot_precision as f64
    }

    pub fn price_to_ticks(&self, price: f64) -> i64 {
        (price * self.tick_precision as f64).round() as i64
    }

    /// Snaps a size to the nearest whole lot. Negative or non-finite sizes become zero.
    pub fn size_to_lots(&self, size: f64) -> u64 {
        if !size.is_finite() || size <= 0.0 {
            return 0;
        }
        (size * self.lot_precision as f64).round() as u64
    }

    pub fn ticks_to_price(&self, ticks: i64) -> f64 {
        ticks as f64 / self.tick_precision as f64
    }

    pub fn lots_to_size(&self, lots: u64) -> f64 {
        lots as f64 / self.lot_precision as f64
    }
}

fn inverse_scale(increment: f64) -> u64 {
    if !increment.is_finite() || increment <= 0.0 {
        return 1;
    }
    (1.0 / increment).round().max(1.0) as u64
}
