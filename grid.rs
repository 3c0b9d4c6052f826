use std::collections::BTreeMap;

use crate::types::{EngineError, Schedule, HOURS};

/// Identifier the external grid uses for itself in trades and billing.
pub const EXTERNAL_GRID_ID: &str = "MainGrid";

/// Full weeks of price history assumed to precede the simulated week. The
/// weekly-seasonal price forecaster needs at least two seasons of data.
const LEAD_WEEKS: usize = 2;

/// Day-ahead zonal electricity prices (€/MWh), hourly, one week
/// (2024-12-23 .. 2024-12-29).
/// Source: mercatoelettrico.org, MGP zonal price results.
pub const DEFAULT_PRICES: [[f64; HOURS]; 7] = [
    [
        51.12, 30.54, 10.19, 7.33, 6.00, 51.03, 99.99, 128.60, 141.19, 122.80, 112.07, 103.61,
        100.00, 101.40, 108.02, 114.85, 123.00, 128.56, 124.87, 127.77, 119.10, 109.28, 105.82,
        105.49,
    ],
    [
        86.03, 82.84, 81.89, 78.00, 78.78, 80.60, 108.86, 155.00, 170.00, 157.37, 120.00, 118.16,
        117.49, 115.38, 117.98, 139.65, 161.00, 172.75, 173.66, 171.81, 157.71, 141.31, 127.36,
        109.90,
    ],
    [
        116.03, 105.98, 85.07, 80.81, 75.99, 80.81, 107.85, 121.00, 119.00, 99.24, 93.56, 92.55,
        94.41, 91.01, 85.08, 97.90, 123.50, 150.00, 158.22, 160.00, 150.99, 138.96, 126.96,
        110.80,
    ],
    [
        114.39, 105.30, 96.10, 95.67, 90.87, 95.10, 99.00, 115.82, 119.44, 118.23, 113.25, 106.01,
        107.71, 103.90, 109.64, 120.75, 126.53, 149.98, 155.71, 160.30, 155.28, 146.83, 132.43,
        118.27,
    ],
    [
        118.61, 113.00, 106.16, 101.76, 99.58, 106.20, 121.00, 140.00, 157.23, 144.06, 123.46,
        119.06, 118.30, 120.10, 124.40, 144.06, 152.00, 168.21, 168.21, 167.62, 160.59, 149.65,
        135.00, 122.11,
    ],
    [
        126.40, 116.63, 110.15, 105.92, 102.93, 105.58, 120.10, 127.50, 128.09, 128.30, 122.83,
        113.40, 108.97, 110.01, 114.09, 130.77, 147.50, 159.77, 165.00, 166.62, 160.59, 149.61,
        132.98, 129.16,
    ],
    [
        137.74, 129.43, 127.56, 126.07, 125.82, 127.45, 137.74, 156.11, 147.00, 137.74, 124.30,
        119.78, 123.01, 120.10, 120.89, 138.97, 167.00, 178.42, 176.83, 178.88, 178.89, 170.09,
        158.62, 138.00,
    ],
];

// ─── External grid ────────────────────────────────────────────────────────────

/// The infinite-supply fallback market. Prices come from a weekday×hour
/// table; every allocation is billed to the requesting consumer.
pub struct ExternalGrid {
    name: String,
    prices: Vec<[f64; HOURS]>,
    bill: BTreeMap<String, f64>,
}

impl ExternalGrid {
    pub fn new(prices: Vec<[f64; HOURS]>) -> Self {
        Self {
            name: EXTERNAL_GRID_ID.to_string(),
            prices,
            bill: BTreeMap::new(),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of weekdays covered by the price table.
    #[inline]
    pub fn days(&self) -> usize {
        self.prices.len()
    }

    fn check(&self, s: Schedule) -> Result<(), EngineError> {
        if s.weekday >= self.prices.len() || s.hour >= HOURS {
            return Err(EngineError::ScheduleOutOfRange { weekday: s.weekday, hour: s.hour });
        }
        Ok(())
    }

    /// Tariff for the given slot.
    pub fn price(&self, s: Schedule) -> Result<f64, EngineError> {
        self.check(s)?;
        Ok(self.prices[s.weekday][s.hour])
    }

    /// The grid never runs out.
    #[inline]
    pub fn supply(&self) -> f64 {
        f64::MAX
    }

    /// Deliver `amount` to `consumer` at the slot tariff, accumulating the
    /// cost on the consumer's bill. Returns the delivered amount.
    pub fn allocate(
        &mut self,
        consumer: &str,
        amount: f64,
        s: Schedule,
    ) -> Result<f64, EngineError> {
        let price = self.price(s)?;
        *self.bill.entry(consumer.to_string()).or_insert(0.0) += amount * price;
        Ok(amount)
    }

    /// Hourly prices up to and including the given slot: `LEAD_WEEKS` full
    /// copies of the weekly table, the full days before `s.weekday`, then
    /// the current day through `s.hour`. The last element equals `price(s)`.
    pub fn history(&self, s: Schedule) -> Result<Vec<f64>, EngineError> {
        self.check(s)?;
        let mut out =
            Vec::with_capacity((LEAD_WEEKS * self.prices.len() + s.weekday) * HOURS + s.hour + 1);
        for _ in 0..LEAD_WEEKS {
            for day in &self.prices {
                out.extend_from_slice(day);
            }
        }
        for day in &self.prices[..s.weekday] {
            out.extend_from_slice(day);
        }
        out.extend_from_slice(&self.prices[s.weekday][..=s.hour]);
        Ok(out)
    }

    /// Cumulative cost per consumer.
    pub fn bill(&self) -> &BTreeMap<String, f64> {
        &self.bill
    }

    pub fn bill_of(&self, consumer: &str) -> f64 {
        self.bill.get(consumer).copied().unwrap_or(0.0)
    }
}

impl Default for ExternalGrid {
    fn default() -> Self {
        Self::new(DEFAULT_PRICES.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn price_reads_table() {
        let grid = ExternalGrid::default();
        let s = Schedule::new(0, 6).unwrap();
        assert_eq!(grid.price(s).unwrap(), 99.99);
    }

    #[test]
    fn price_rejects_unknown_weekday() {
        let grid = ExternalGrid::default();
        let s = Schedule { weekday: 7, hour: 0 };
        assert!(matches!(grid.price(s), Err(EngineError::ScheduleOutOfRange { .. })));
    }

    #[test]
    fn allocate_accumulates_bill() {
        let mut grid = ExternalGrid::default();
        let s = Schedule::new(1, 0).unwrap();
        let delivered = grid.allocate("user-1", 2.0, s).unwrap();
        assert_eq!(delivered, 2.0);
        grid.allocate("user-1", 1.0, s).unwrap();
        assert!((grid.bill_of("user-1") - 3.0 * 86.03).abs() < 1e-9);
        assert_eq!(grid.bill_of("user-2"), 0.0);
    }

    #[test]
    fn history_ends_at_current_slot() {
        let grid = ExternalGrid::default();
        let s = Schedule::new(2, 5).unwrap();
        let history = grid.history(s).unwrap();
        assert_eq!(history.len(), (2 * 7 + 2) * HOURS + 6);
        assert_eq!(*history.last().unwrap(), grid.price(s).unwrap());
        // Prefix of the current day sits at the tail.
        let tail = &history[history.len() - 6..];
        assert_eq!(tail, &DEFAULT_PRICES[2][..6]);
    }
}
