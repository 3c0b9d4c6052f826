use std::ops::BitOr;

use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, LogNormal, Normal};

use crate::types::{MarketConfig, Schedule, HOURS};

/// Device id of the microgrid's shared storage system.
pub const ESS_ID: &str = "ESS";

// ─── Capability flags ─────────────────────────────────────────────────────────

/// How a device schedules its demand.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceMode {
    /// Demand must be satisfied in the current slot.
    Immediate,
    /// Constant background demand, present every slot.
    Persist,
    /// Demand is deferred to the cheapest forecast hour of the remaining day.
    Shiftable,
}

/// Bitset of the energy roles a device can play.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EnergyMode(u8);

impl EnergyMode {
    pub const PRODUCER: EnergyMode = EnergyMode(0b01);
    pub const CONSUMER: EnergyMode = EnergyMode(0b10);

    #[inline]
    pub fn contains(self, other: EnergyMode) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn is_producer(self) -> bool {
        self.contains(EnergyMode::PRODUCER)
    }

    #[inline]
    pub fn is_consumer(self) -> bool {
        self.contains(EnergyMode::CONSUMER)
    }
}

impl BitOr for EnergyMode {
    type Output = EnergyMode;

    fn bitor(self, rhs: EnergyMode) -> EnergyMode {
        EnergyMode(self.0 | rhs.0)
    }
}

// ─── Device capability set ────────────────────────────────────────────────────

/// A registered microgrid device. Producers report `supply` and honor
/// `discharge`; consumers report `demand` and honor `charge`; storage does
/// both.
pub trait Device {
    fn id(&self) -> &str;

    /// Energy available from this device at the slot.
    fn supply(&self, s: Schedule) -> f64 {
        let _ = s;
        0.0
    }

    /// Energy requested by this device at the slot.
    fn demand(&self, s: Schedule) -> f64 {
        let _ = s;
        0.0
    }

    /// Accept delivered energy.
    fn charge(&mut self, s: Schedule, amount: f64) {
        let _ = (s, amount);
    }

    /// Release up to `amount`; returns what was actually released.
    fn discharge(&mut self, s: Schedule, amount: f64) -> f64 {
        let _ = (s, amount);
        0.0
    }

    fn mode(&self) -> DeviceMode;

    fn energy_mode(&self) -> EnergyMode;
}

// ─── Storage ──────────────────────────────────────────────────────────────────

/// Bounded-capacity reservoir. Charge saturates at capacity, discharge never
/// underflows; both are atomic within a slot.
pub struct Ess {
    id: String,
    capacity: f64,
    energy: f64,
}

impl Ess {
    pub fn new(config: &MarketConfig) -> Self {
        Self {
            id: ESS_ID.to_string(),
            capacity: config.ess_capacity,
            energy: config.ess_capacity * config.ess_initial_fill,
        }
    }

    #[inline]
    pub fn energy(&self) -> f64 {
        self.energy
    }

    #[inline]
    pub fn capacity(&self) -> f64 {
        self.capacity
    }
}

impl Device for Ess {
    fn id(&self) -> &str {
        &self.id
    }

    fn supply(&self, _s: Schedule) -> f64 {
        self.energy
    }

    fn charge(&mut self, _s: Schedule, amount: f64) {
        self.energy = (self.energy + amount).min(self.capacity);
    }

    fn discharge(&mut self, _s: Schedule, amount: f64) -> f64 {
        let released = amount.min(self.energy);
        self.energy -= released;
        released
    }

    fn mode(&self) -> DeviceMode {
        DeviceMode::Persist
    }

    fn energy_mode(&self) -> EnergyMode {
        EnergyMode::PRODUCER | EnergyMode::CONSUMER
    }
}

// ─── Demo fleet ───────────────────────────────────────────────────────────────

/// Photovoltaic producer with a fixed weekly output profile sampled at
/// construction time.
pub struct SolarArray {
    id: String,
    profile: Box<[[f64; HOURS]; 7]>,
}

impl SolarArray {
    /// Sample a weekly profile: a daylight bell curve around 13:00 scaled by
    /// `peak`, with per-day cloudiness and per-hour noise.
    pub fn sample(id: &str, peak: f64, rng: &mut ChaCha8Rng) -> Self {
        let noise = Normal::new(1.0, 0.08).expect("valid normal parameters");
        let mut profile = Box::new([[0.0; HOURS]; 7]);
        for day in profile.iter_mut() {
            let cloudiness = rng.gen_range(0.4f64..=1.0);
            for (hour, out) in day.iter_mut().enumerate() {
                if !(6..=18).contains(&hour) {
                    continue;
                }
                let x = (hour as f64 - 13.0) / 3.5;
                let bell = (-0.5 * x * x).exp();
                *out = (peak * cloudiness * bell * noise.sample(rng)).max(0.0);
            }
        }
        Self { id: id.to_string(), profile }
    }
}

impl Device for SolarArray {
    fn id(&self) -> &str {
        &self.id
    }

    fn supply(&self, s: Schedule) -> f64 {
        self.profile[s.weekday % 7][s.hour]
    }

    fn discharge(&mut self, s: Schedule, amount: f64) -> f64 {
        amount.min(self.supply(s))
    }

    fn mode(&self) -> DeviceMode {
        DeviceMode::Immediate
    }

    fn energy_mode(&self) -> EnergyMode {
        EnergyMode::PRODUCER
    }
}

/// Household base load: morning and evening peaks over a nightly floor,
/// log-normal sized per device.
pub struct BaseLoad {
    id: String,
    profile: Box<[[f64; HOURS]; 7]>,
}

impl BaseLoad {
    pub fn sample(id: &str, mean: f64, rng: &mut ChaCha8Rng) -> Self {
        // E[X] = mean with σ_ln = 0.3 → μ = ln(mean) - σ²/2
        let sigma_ln = 0.3f64;
        let size = LogNormal::new(mean.ln() - 0.5 * sigma_ln * sigma_ln, sigma_ln)
            .expect("valid log-normal parameters");
        let base = size.sample(rng);
        let jitter = Normal::new(1.0, 0.05).expect("valid normal parameters");
        let mut profile = Box::new([[0.0; HOURS]; 7]);
        for day in profile.iter_mut() {
            for (hour, load) in day.iter_mut().enumerate() {
                let shape = match hour {
                    7..=9 => 1.6,
                    17..=21 => 2.0,
                    0..=5 => 0.5,
                    _ => 1.0,
                };
                *load = (base * shape * jitter.sample(rng)).max(0.0);
            }
        }
        Self { id: id.to_string(), profile }
    }
}

impl Device for BaseLoad {
    fn id(&self) -> &str {
        &self.id
    }

    fn demand(&self, s: Schedule) -> f64 {
        self.profile[s.weekday % 7][s.hour]
    }

    fn mode(&self) -> DeviceMode {
        DeviceMode::Immediate
    }

    fn energy_mode(&self) -> EnergyMode {
        EnergyMode::CONSUMER
    }
}

/// Always-on refrigeration-style draw.
pub struct ColdStorage {
    id: String,
    draw: f64,
}

impl ColdStorage {
    pub fn new(id: &str, draw: f64) -> Self {
        Self { id: id.to_string(), draw }
    }
}

impl Device for ColdStorage {
    fn id(&self) -> &str {
        &self.id
    }

    fn demand(&self, _s: Schedule) -> f64 {
        self.draw
    }

    fn mode(&self) -> DeviceMode {
        DeviceMode::Persist
    }

    fn energy_mode(&self) -> EnergyMode {
        EnergyMode::CONSUMER
    }
}

/// Deferrable load (an overnight vehicle charger): needs `daily_need` units
/// some time each day and is happy to wait for the cheapest remaining hour.
pub struct EvCharger {
    id: String,
    daily_need: f64,
    remaining: f64,
    day: usize,
}

impl EvCharger {
    pub fn new(id: &str, daily_need: f64) -> Self {
        Self {
            id: id.to_string(),
            daily_need,
            remaining: daily_need,
            day: usize::MAX,
        }
    }
}

impl Device for EvCharger {
    fn id(&self) -> &str {
        &self.id
    }

    fn demand(&self, s: Schedule) -> f64 {
        if s.weekday == self.day {
            self.remaining
        } else {
            self.daily_need
        }
    }

    fn charge(&mut self, s: Schedule, amount: f64) {
        if s.weekday != self.day {
            self.day = s.weekday;
            self.remaining = self.daily_need;
        }
        self.remaining = (self.remaining - amount).max(0.0);
    }

    fn mode(&self) -> DeviceMode {
        DeviceMode::Shiftable
    }

    fn energy_mode(&self) -> EnergyMode {
        EnergyMode::CONSUMER
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn config(capacity: f64, fill: f64) -> MarketConfig {
        MarketConfig { ess_capacity: capacity, ess_initial_fill: fill, ..MarketConfig::default() }
    }

    #[test]
    fn ess_charge_saturates() {
        let mut ess = Ess::new(&config(10.0, 0.5));
        let s = Schedule::new(0, 0).unwrap();
        ess.charge(s, 100.0);
        assert_eq!(ess.energy(), 10.0);
    }

    #[test]
    fn ess_discharge_never_underflows() {
        let mut ess = Ess::new(&config(10.0, 0.3));
        let s = Schedule::new(0, 0).unwrap();
        assert_eq!(ess.discharge(s, 100.0), 3.0);
        assert_eq!(ess.energy(), 0.0);
        assert_eq!(ess.discharge(s, 1.0), 0.0);
    }

    #[test]
    fn ess_is_persistent_storage() {
        let ess = Ess::new(&config(10.0, 0.5));
        assert_eq!(ess.mode(), DeviceMode::Persist);
        assert!(ess.energy_mode().is_producer());
        assert!(ess.energy_mode().is_consumer());
    }

    #[test]
    fn solar_is_dark_at_night() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let pv = SolarArray::sample("pv", 50.0, &mut rng);
        assert_eq!(pv.supply(Schedule::new(0, 2).unwrap()), 0.0);
        assert!(pv.supply(Schedule::new(0, 13).unwrap()) > 0.0);
    }

    #[test]
    fn ev_charger_need_resets_daily() {
        let mut ev = EvCharger::new("ev", 8.0);
        let mon = Schedule::new(0, 3).unwrap();
        assert_eq!(ev.demand(mon), 8.0);
        ev.charge(mon, 5.0);
        assert_eq!(ev.demand(mon), 3.0);
        ev.charge(mon, 3.0);
        assert_eq!(ev.demand(mon), 0.0);
        let tue = Schedule::new(1, 0).unwrap();
        assert_eq!(ev.demand(tue), 8.0);
    }
}
