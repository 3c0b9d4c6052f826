//! Simulation drivers: build a microgrid scenario, run a full week of slots
//! in time order, and aggregate repeated runs across seeds.

use std::collections::BTreeMap;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::Serialize;

use crate::device::{BaseLoad, ColdStorage, Device, EvCharger, SolarArray};
use crate::engine::TradingPlatform;
use crate::grid::ExternalGrid;
use crate::types::{EngineError, MarketConfig, Schedule, TradeMode, HOURS};

// ─── Results ──────────────────────────────────────────────────────────────────

/// One settled slot, summarized.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SlotSummary {
    pub weekday: usize,
    pub hour: usize,
    pub external_price: f64,
    pub cleared_volume: f64,
    pub average_price: f64,
    pub trades: usize,
}

/// Delivered volume grouped by trade mode.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ModeVolumes {
    pub self_use: f64,
    pub market: f64,
    pub from_external: f64,
    pub to_ess: f64,
}

impl ModeVolumes {
    fn add(&mut self, mode: TradeMode, amount: f64) {
        match mode {
            TradeMode::SelfUse => self.self_use += amount,
            TradeMode::Market => self.market += amount,
            TradeMode::FromExternal => self.from_external += amount,
            TradeMode::ToEss => self.to_ess += amount,
        }
    }
}

/// Outcome of one full simulated week.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SimResult {
    pub seed: u64,
    pub slots: Vec<SlotSummary>,
    pub volumes: ModeVolumes,
    /// Cumulative external-grid cost per consumer id.
    pub bills: BTreeMap<String, f64>,
    pub final_ess_energy: f64,
}

impl SimResult {
    pub fn total_market_volume(&self) -> f64 {
        self.slots.iter().map(|s| s.cleared_volume).sum()
    }

    pub fn total_external_bill(&self) -> f64 {
        self.bills.values().sum()
    }

    /// Volume-weighted clearing price over the whole week.
    pub fn overall_average_price(&self) -> f64 {
        let volume: f64 = self.slots.iter().map(|s| s.cleared_volume).sum();
        if volume > 0.0 {
            self.slots.iter().map(|s| s.average_price * s.cleared_volume).sum::<f64>() / volume
        } else {
            0.0
        }
    }
}

// ─── Scenario construction ────────────────────────────────────────────────────

/// Build a platform with `users` participants and a seeded random device
/// fleet: every user gets a base load, and solar arrays, vehicle chargers
/// and cold stores are dealt out round-robin so the market has both long and
/// short participants.
pub fn build_platform(config: &MarketConfig, users: usize, seed: u64) -> TradingPlatform {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut platform = TradingPlatform::new("microgrid", config.clone(), ExternalGrid::default());

    for user in 0..users {
        let user_id = format!("user-{user}");
        let mut devices: Vec<Box<dyn Device>> = Vec::new();

        let base = rng.gen_range(4.0f64..=12.0);
        devices.push(Box::new(BaseLoad::sample(&format!("{user_id}/load"), base, &mut rng)));

        if user % 3 != 2 {
            let peak = rng.gen_range(20.0f64..=60.0);
            devices.push(Box::new(SolarArray::sample(&format!("{user_id}/pv"), peak, &mut rng)));
        }
        if user % 3 == 1 {
            let need = rng.gen_range(6.0f64..=16.0);
            devices.push(Box::new(EvCharger::new(&format!("{user_id}/ev"), need)));
        }
        if user % 3 == 2 {
            let draw = rng.gen_range(2.0f64..=6.0);
            devices.push(Box::new(ColdStorage::new(&format!("{user_id}/cold"), draw)));
        }

        let participant = platform.register_user(&user_id, devices);
        participant.set_price_ranges((25.0, 99.0), (1.0, 75.0));
    }
    platform
}

/// Run one full week (every slot of the grid's price table, in time order)
/// and summarize.
pub fn run_simulation(
    config: &MarketConfig,
    users: usize,
    seed: u64,
) -> Result<SimResult, EngineError> {
    let mut platform = build_platform(config, users, seed);
    let days = platform.grid().days();

    let mut slots = Vec::with_capacity(days * HOURS);
    let mut last_slot = Schedule::new(0, 0)?;
    for weekday in 0..days {
        for hour in 0..HOURS {
            let s = Schedule::new(weekday, hour)?;
            platform.handle(s)?;
            last_slot = s;

            if let Some(info) = platform.information(s) {
                slots.push(SlotSummary {
                    weekday,
                    hour,
                    external_price: info.external_price_hour,
                    cleared_volume: info.cleared_volume(),
                    average_price: info.average_price(),
                    trades: info.trade_list.len(),
                });
            }
        }
    }

    let mut volumes = ModeVolumes::default();
    for record in platform.microgrid().flow_records() {
        volumes.add(record.trade.mode, record.trade.amount);
    }

    Ok(SimResult {
        seed,
        slots,
        volumes,
        bills: platform.grid().bill().clone(),
        final_ess_energy: platform.microgrid().ess_energy(last_slot),
    })
}

// ─── Parallel multi-seed runner ───────────────────────────────────────────────

/// Aggregate statistics over repeated runs with consecutive seeds.
#[derive(Clone, Debug, Serialize)]
pub struct AggregatedStats {
    pub simulations: usize,
    pub mean_market_volume: f64,
    pub std_market_volume: f64,
    pub mean_average_price: f64,
    pub mean_self_use_volume: f64,
    pub mean_external_volume: f64,
    pub mean_to_ess_volume: f64,
    pub mean_external_bill: f64,
}

/// Run `simulations` independent weeks in parallel (seeds `seed_start..`)
/// and aggregate. Slots within each week stay strictly sequential; only
/// whole simulations parallelize.
pub fn run_parallel(
    config: &MarketConfig,
    users: usize,
    simulations: usize,
    seed_start: u64,
) -> Result<AggregatedStats, EngineError> {
    let results: Vec<SimResult> = (0..simulations)
        .into_par_iter()
        .map(|i| run_simulation(config, users, seed_start + i as u64))
        .collect::<Result<_, _>>()?;
    Ok(aggregate_results(&results))
}

fn aggregate_results(results: &[SimResult]) -> AggregatedStats {
    let n = results.len().max(1) as f64;

    let volumes: Vec<f64> = results.iter().map(|r| r.total_market_volume()).collect();
    let mean_volume = volumes.iter().sum::<f64>() / n;
    let var = volumes.iter().map(|v| (v - mean_volume) * (v - mean_volume)).sum::<f64>() / n;

    AggregatedStats {
        simulations: results.len(),
        mean_market_volume: mean_volume,
        std_market_volume: var.sqrt(),
        mean_average_price: results.iter().map(|r| r.overall_average_price()).sum::<f64>() / n,
        mean_self_use_volume: results.iter().map(|r| r.volumes.self_use).sum::<f64>() / n,
        mean_external_volume: results.iter().map(|r| r.volumes.from_external).sum::<f64>() / n,
        mean_to_ess_volume: results.iter().map(|r| r.volumes.to_ess).sum::<f64>() / n,
        mean_external_bill: results.iter().map(|r| r.total_external_bill()).sum::<f64>() / n,
    }
}
