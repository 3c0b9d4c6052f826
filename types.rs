use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Maximum number of auction rounds per slot. The terminal round is the
/// settlement phase: crossed offers still clear at the supply price.
pub const MAX_ROUND: usize = 5;

/// Hours per trading day.
pub const HOURS: usize = 24;

// ─── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum EngineError {
    /// A slot outside the external grid's price table. Fatal: the simulation
    /// cannot price anything for this slot.
    #[error("schedule out of range: weekday {weekday}, hour {hour}")]
    ScheduleOutOfRange { weekday: usize, hour: usize },

    /// A trade referenced a device id missing from the registry. The trade
    /// is dropped and the slot continues.
    #[error("unknown device `{0}`")]
    UnknownDevice(String),
}

// ─── Schedule ─────────────────────────────────────────────────────────────────

/// A (weekday, hour) time bucket — the auction's unit of work.
///
/// Ordering is lexicographic: all of weekday w precedes weekday w+1.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Schedule {
    pub weekday: usize,
    pub hour: usize,
}

impl Schedule {
    /// Hour must be in [0, 24). The weekday bound depends on the grid's price
    /// table and is checked there.
    pub fn new(weekday: usize, hour: usize) -> Result<Self, EngineError> {
        if hour >= HOURS {
            return Err(EngineError::ScheduleOutOfRange { weekday, hour });
        }
        Ok(Self { weekday, hour })
    }

    /// True unless this is the origin slot (0, 0).
    #[inline]
    pub fn has_pre(self) -> bool {
        self.weekday > 0 || self.hour > 0
    }

    /// The immediately preceding slot: hour decrements, borrowing a weekday
    /// at hour 0. None at the origin.
    pub fn pre(self) -> Option<Schedule> {
        if self.hour > 0 {
            Some(Schedule { weekday: self.weekday, hour: self.hour - 1 })
        } else if self.weekday > 0 {
            Some(Schedule { weekday: self.weekday - 1, hour: HOURS - 1 })
        } else {
            None
        }
    }

    /// Key used by the market memory and participant caches.
    #[inline]
    pub fn key(self) -> (usize, usize) {
        (self.weekday, self.hour)
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.weekday, self.hour)
    }
}

// ─── Trades ───────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeMode {
    /// Intra-participant trade, consumed by distribution but never entering
    /// the market order book.
    SelfUse,
    /// Cleared on the internal market.
    Market,
    /// Residual demand sourced from the external grid during finalization.
    FromExternal,
    /// Residual supply parked in the storage system during finalization.
    ToEss,
}

impl TradeMode {
    pub fn as_str(self) -> &'static str {
        match self {
            TradeMode::SelfUse => "self_use",
            TradeMode::Market => "market",
            TradeMode::FromExternal => "from_external",
            TradeMode::ToEss => "to_ess",
        }
    }
}

/// An immutable traded (or offered) quantity of energy.
///
/// Supply-only offers leave the consumer identifiers empty; demand-only
/// offers leave the supplier identifiers empty. Matching fills both sides.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Trade {
    pub amount: f64,
    pub price: f64,
    pub supplier_id: String,
    pub supplier_device_id: String,
    pub consumer_id: String,
    pub consumer_device_id: String,
    pub mode: TradeMode,
}

impl Trade {
    /// A market supply offer: supplier side only.
    pub fn supply_offer(user_id: &str, device_id: &str, amount: f64, price: f64) -> Self {
        Trade {
            amount,
            price,
            supplier_id: user_id.to_string(),
            supplier_device_id: device_id.to_string(),
            consumer_id: String::new(),
            consumer_device_id: String::new(),
            mode: TradeMode::Market,
        }
    }

    /// A market demand offer: consumer side only.
    pub fn demand_offer(user_id: &str, device_id: &str, amount: f64, price: f64) -> Self {
        Trade {
            amount,
            price,
            supplier_id: String::new(),
            supplier_device_id: String::new(),
            consumer_id: user_id.to_string(),
            consumer_device_id: device_id.to_string(),
            mode: TradeMode::Market,
        }
    }

    /// Copy of this trade with a different amount. Used to shrink partially
    /// filled offers during matching.
    pub fn with_amount(&self, amount: f64) -> Self {
        Trade { amount, ..self.clone() }
    }
}

// ─── Market information ───────────────────────────────────────────────────────

/// Per-(weekday, hour) market record: one instance per slot, created lazily
/// at first observation, mutated only by the market memory.
///
/// `prices[k]`, `amount[k]`, `supply_demand_ratio[k]` describe round k+1.
/// `external_price_day` spans the whole weekday: the prefix up to and
/// including the slot's hour is historical, the suffix is forecast.
#[derive(Clone, Debug)]
pub struct MarketInformation {
    pub prices: [f64; MAX_ROUND],
    pub amount: [f64; MAX_ROUND],
    pub supply_demand_ratio: [f64; MAX_ROUND],
    pub external_price_hour: f64,
    pub external_price_day: [f64; HOURS],
    pub trade_list: Vec<Trade>,
    /// Current round, 1-based.
    pub round_number: usize,
    /// True iff this is the terminal (settlement) round.
    pub last: bool,
}

impl MarketInformation {
    pub fn new() -> Self {
        MarketInformation {
            prices: [0.0; MAX_ROUND],
            amount: [0.0; MAX_ROUND],
            supply_demand_ratio: [1.0; MAX_ROUND],
            external_price_hour: 0.0,
            external_price_day: [0.0; HOURS],
            trade_list: Vec::new(),
            round_number: 1,
            last: false,
        }
    }

    /// Total volume cleared across all rounds of the slot.
    pub fn cleared_volume(&self) -> f64 {
        self.amount.iter().sum()
    }

    /// Volume-weighted average clearing price across rounds, 0 if nothing
    /// cleared.
    pub fn average_price(&self) -> f64 {
        let volume = self.cleared_volume();
        if volume > 0.0 {
            self.prices
                .iter()
                .zip(self.amount.iter())
                .map(|(p, a)| p * a)
                .sum::<f64>()
                / volume
        } else {
            0.0
        }
    }
}

impl Default for MarketInformation {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Configuration ────────────────────────────────────────────────────────────

/// Tunables for one simulated market. `MAX_ROUND` is compile-time and not
/// configurable here.
#[derive(Clone, Debug)]
pub struct MarketConfig {
    /// Storage system capacity (energy units).
    pub ess_capacity: f64,
    /// Fraction of capacity the storage starts with, in [0, 1].
    pub ess_initial_fill: f64,
    /// Price of internally sourced storage energy relative to the external
    /// grid price during finalization.
    pub ess_price_ratio: f64,
    /// Sensitivity of the offer-pricing policy to the participant's own
    /// supply/demand imbalance.
    pub bidding_factor: f64,
    /// Seasonal period (hours) of the external price forecaster.
    pub seasonal_period: usize,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            ess_capacity: 100_000.0,
            ess_initial_fill: 0.5,
            ess_price_ratio: 0.9,
            bidding_factor: 0.1,
            seasonal_period: HOURS * 7,
        }
    }
}
