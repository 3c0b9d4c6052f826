//! Per-slot auction orchestration.
//!
//! Each slot runs up to `MAX_ROUND` rounds of notify → collect → match →
//! distribute → record, then a finalization stage that parks unmatched
//! supply in storage and fills unmatched demand from storage and the
//! external grid.

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use crate::device::Device;
use crate::distribution::Microgrid;
use crate::grid::ExternalGrid;
use crate::memory::MarketMemory;
use crate::participant::Participant;
use crate::types::{EngineError, MarketConfig, MarketInformation, Schedule, Trade, TradeMode, MAX_ROUND};

// ─── Matching ─────────────────────────────────────────────────────────────────

/// Match price-sorted books greedily: supply ascending, demand descending.
///
/// Heads cross (ask ≤ bid) → clear the overlap at the midpoint. Heads do not
/// cross → in the settlement round clear at the ask, otherwise stop and wait
/// for the next round's reprice. An ask at or above `cap` (the external grid
/// price) always stops matching. Partially filled offers shrink in place;
/// exhausted offers are removed, so the leftovers are the round's residuals.
pub fn match_trades(
    supply: &mut Vec<Trade>,
    demand: &mut Vec<Trade>,
    last: bool,
    cap: f64,
) -> Vec<Trade> {
    let mut trades = Vec::new();

    while let (Some(ask), Some(bid)) = (supply.first().cloned(), demand.first().cloned()) {
        if ask.price >= cap {
            break;
        }

        let amount = ask.amount.min(bid.amount);
        let price = if ask.price <= bid.price {
            (ask.price + bid.price) / 2.0
        } else if last {
            ask.price
        } else {
            break;
        };

        trades.push(Trade {
            amount,
            price,
            supplier_id: ask.supplier_id.clone(),
            supplier_device_id: ask.supplier_device_id.clone(),
            consumer_id: bid.consumer_id.clone(),
            consumer_device_id: bid.consumer_device_id.clone(),
            mode: TradeMode::Market,
        });

        if ask.amount <= amount {
            supply.remove(0);
        } else {
            supply[0] = ask.with_amount(ask.amount - amount);
        }
        if bid.amount <= amount {
            demand.remove(0);
        } else {
            demand[0] = bid.with_amount(bid.amount - amount);
        }
    }

    trades
}

// ─── Platform ─────────────────────────────────────────────────────────────────

/// The trading platform: participants, the device arena, the external grid,
/// and the market memory, advanced one slot at a time.
pub struct TradingPlatform {
    config: MarketConfig,
    grid: ExternalGrid,
    microgrid: Microgrid,
    memory: MarketMemory,
    participants: BTreeMap<String, Participant>,
}

impl TradingPlatform {
    pub fn new(name: &str, config: MarketConfig, grid: ExternalGrid) -> Self {
        let microgrid = Microgrid::new(name, &config);
        let memory = MarketMemory::with_default_forecasters(config.seasonal_period);
        Self { config, grid, microgrid, memory, participants: BTreeMap::new() }
    }

    /// Register a user together with its devices. The devices move into the
    /// shared arena; the participant keeps only their ids.
    pub fn register_user(
        &mut self,
        user_id: &str,
        devices: Vec<Box<dyn Device>>,
    ) -> &mut Participant {
        let ids: Vec<String> = devices.iter().map(|d| d.id().to_string()).collect();
        for device in devices {
            self.microgrid.register(device);
        }
        self.participants.insert(user_id.to_string(), Participant::new(user_id, ids));
        self.participants.get_mut(user_id).expect("participant inserted above")
    }

    #[inline]
    pub fn grid(&self) -> &ExternalGrid {
        &self.grid
    }

    #[inline]
    pub fn microgrid(&self) -> &Microgrid {
        &self.microgrid
    }

    /// Market record for a slot, if the slot has been observed.
    pub fn information(&self, s: Schedule) -> Option<&MarketInformation> {
        self.memory.information(s)
    }

    /// Run the full auction for one slot.
    pub fn handle(&mut self, s: Schedule) -> Result<(), EngineError> {
        // Fail fast on an unpriceable slot.
        self.grid.price(s)?;

        let mut round = 1;
        let mut last = false;

        let (residual_supply, residual_demand) = loop {
            if round == MAX_ROUND {
                last = true;
            }

            self.notify(s, round, last)?;
            self.memory.adjust(s, round);

            let (mut supply, mut demand) = self.collect_offers(s)?;
            if supply.is_empty() || demand.is_empty() {
                debug!(slot = %s, round, "order book one-sided, closing early");
                break (supply, demand);
            }

            supply.sort_by(|a, b| a.price.total_cmp(&b.price));
            demand.sort_by(|a, b| b.price.total_cmp(&a.price));

            let cap = self.grid.price(s)?;
            let trades = match_trades(&mut supply, &mut demand, last, cap);
            debug!(slot = %s, round, trades = trades.len(), "round matched");
            self.apply_trades(&trades, s)?;
            self.memory.record(s, &trades, &self.grid)?;

            round += 1;
            if last {
                break (supply, demand);
            }
        };

        self.finishing_touches(s, residual_supply, residual_demand)?;

        if let Some(info) = self.memory.information(s) {
            info!(
                slot = %s,
                volume = info.cleared_volume(),
                price = info.average_price(),
                trades = info.trade_list.len(),
                "slot settled"
            );
        }
        Ok(())
    }

    /// Push the slot's market view (stamped with round and settlement flag)
    /// to every participant.
    fn notify(&mut self, s: Schedule, round: usize, last: bool) -> Result<(), EngineError> {
        let view = self.memory.view(s, &self.grid)?;
        view.round_number = round;
        view.last = last;
        let snapshot = view.clone();
        for participant in self.participants.values_mut() {
            participant.on_notify(s, snapshot.clone());
        }
        Ok(())
    }

    /// Gather every participant's offers for the round.
    ///
    /// This step deliberately has two side effects beyond returning the
    /// books: self-use trades are routed through distribution here, and the
    /// observed supply/demand ratio (what was actually sent to market) is
    /// written into the slot record.
    fn collect_offers(&mut self, s: Schedule) -> Result<(Vec<Trade>, Vec<Trade>), EngineError> {
        let mut supply = Vec::new();
        let mut demand = Vec::new();
        let mut self_use = Vec::new();
        let mut total_supply = 0.0;
        let mut total_demand = 0.0;

        for participant in self.participants.values() {
            let offers = participant.offers(s, &self.microgrid, self.config.bidding_factor);
            total_supply += offers.supply.iter().map(|t| t.amount).sum::<f64>();
            total_demand += offers.demand.iter().map(|t| t.amount).sum::<f64>();
            supply.extend(offers.supply);
            demand.extend(offers.demand);
            self_use.extend(offers.self_use);
        }

        self.apply_trades(&self_use, s)?;

        let view = self.memory.view(s, &self.grid)?;
        let index = view.round_number - 1;
        view.supply_demand_ratio[index] = if total_supply > 0.0 && total_demand > 0.0 {
            total_supply / total_demand
        } else {
            0.0
        };

        Ok((supply, demand))
    }

    /// Route trades through the distribution layer. A trade with an unknown
    /// endpoint is dropped; everything else about the slot continues.
    fn apply_trades(&mut self, trades: &[Trade], s: Schedule) -> Result<(), EngineError> {
        for trade in trades {
            match self.microgrid.power_flow(&mut self.grid, trade, s) {
                Ok(_) => {}
                Err(EngineError::UnknownDevice(device)) => {
                    warn!(slot = %s, %device, mode = trade.mode.as_str(), "dropping trade with unknown endpoint");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Close the books for the slot: park residual supply in storage, then
    /// satisfy residual demand from storage (at a discount to the external
    /// tariff) and finally from the external grid.
    fn finishing_touches(
        &mut self,
        s: Schedule,
        supply: Vec<Trade>,
        mut demand: Vec<Trade>,
    ) -> Result<(), EngineError> {
        let to_storage: Vec<Trade> = supply
            .iter()
            .map(|offer| Trade {
                amount: offer.amount,
                price: 0.0,
                supplier_id: offer.supplier_id.clone(),
                supplier_device_id: offer.supplier_device_id.clone(),
                consumer_id: self.microgrid.name().to_string(),
                consumer_device_id: self.microgrid.ess_id().to_string(),
                mode: TradeMode::ToEss,
            })
            .collect();
        self.apply_trades(&to_storage, s)?;
        self.memory.record(s, &to_storage, &self.grid)?;

        let tariff = self.grid.price(s)?;
        // Storage first (after the residual supply above has been absorbed),
        // external grid as the bottomless tail.
        let mut sources = [
            (
                self.microgrid.ess_energy(s),
                tariff * self.config.ess_price_ratio,
                self.microgrid.name().to_string(),
                self.microgrid.ess_id().to_string(),
                TradeMode::Market,
            ),
            (
                self.grid.supply(),
                tariff,
                self.grid.name().to_string(),
                self.grid.name().to_string(),
                TradeMode::FromExternal,
            ),
        ];

        let mut fills = Vec::new();
        let mut index = 0;
        while let Some(bid) = demand.first().cloned() {
            if index == 0 && sources[0].0 <= 0.0 {
                index = 1;
                continue;
            }
            let (available, price, supplier_id, supplier_device_id, mode) = &sources[index];
            let amount = bid.amount.min(*available);
            fills.push(Trade {
                amount,
                price: *price,
                supplier_id: supplier_id.clone(),
                supplier_device_id: supplier_device_id.clone(),
                consumer_id: bid.consumer_id.clone(),
                consumer_device_id: bid.consumer_device_id.clone(),
                mode: *mode,
            });
            sources[index].0 -= amount;
            if bid.amount <= amount {
                demand.remove(0);
            } else {
                demand[0] = bid.with_amount(bid.amount - amount);
            }
        }

        self.apply_trades(&fills, s)?;
        self.memory.record(s, &fills, &self.grid)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ask(amount: f64, price: f64) -> Trade {
        Trade::supply_offer("seller", "pv", amount, price)
    }

    fn bid(amount: f64, price: f64) -> Trade {
        Trade::demand_offer("buyer", "load", amount, price)
    }

    #[test]
    fn crossed_offers_clear_at_midpoint() {
        let mut supply = vec![ask(10.0, 20.0)];
        let mut demand = vec![bid(10.0, 40.0)];
        let trades = match_trades(&mut supply, &mut demand, false, 50.0);
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].amount, 10.0);
        assert_eq!(trades[0].price, 30.0);
        assert_eq!(trades[0].mode, TradeMode::Market);
        assert_eq!(trades[0].supplier_id, "seller");
        assert_eq!(trades[0].consumer_id, "buyer");
        assert!(supply.is_empty());
        assert!(demand.is_empty());
    }

    #[test]
    fn uncrossed_offers_wait_before_settlement() {
        let mut supply = vec![ask(5.0, 35.0)];
        let mut demand = vec![bid(5.0, 30.0)];
        let trades = match_trades(&mut supply, &mut demand, false, 50.0);
        assert!(trades.is_empty());
        assert_eq!(supply.len(), 1);
        assert_eq!(demand.len(), 1);
    }

    #[test]
    fn settlement_round_clears_at_supply_price() {
        let mut supply = vec![ask(5.0, 35.0)];
        let mut demand = vec![bid(5.0, 30.0)];
        let trades = match_trades(&mut supply, &mut demand, true, 50.0);
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].amount, 5.0);
        assert_eq!(trades[0].price, 35.0);
    }

    #[test]
    fn external_price_caps_the_ask() {
        let mut supply = vec![ask(3.0, 60.0)];
        let mut demand = vec![bid(3.0, 80.0)];
        let trades = match_trades(&mut supply, &mut demand, true, 50.0);
        assert!(trades.is_empty());
        assert_eq!(supply.len(), 1);
        assert_eq!(demand.len(), 1);

        // An ask exactly at the cap is refused too.
        let mut supply = vec![ask(3.0, 50.0)];
        let mut demand = vec![bid(3.0, 80.0)];
        assert!(match_trades(&mut supply, &mut demand, true, 50.0).is_empty());
    }

    #[test]
    fn partial_fill_leaves_residual_supply() {
        let mut supply = vec![ask(6.0, 10.0), ask(4.0, 20.0)];
        let mut demand = vec![bid(5.0, 40.0)];
        let trades = match_trades(&mut supply, &mut demand, false, 50.0);
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].amount, 5.0);
        assert_eq!(trades[0].price, 25.0);
        assert!(demand.is_empty());
        assert_eq!(supply.len(), 2);
        assert_eq!(supply[0].amount, 1.0);
        assert_eq!(supply[1].amount, 4.0);
    }

    #[test]
    fn cheapest_ask_meets_highest_bid_first() {
        let mut supply = vec![ask(5.0, 10.0), ask(5.0, 30.0)];
        let mut demand = vec![bid(4.0, 50.0), bid(4.0, 35.0)];
        let trades = match_trades(&mut supply, &mut demand, false, 100.0);
        // 10↔50 for 4, 10↔35 for 1, 30↔35 for 3.
        assert_eq!(trades.len(), 3);
        assert_eq!((trades[0].amount, trades[0].price), (4.0, 30.0));
        assert_eq!((trades[1].amount, trades[1].price), (1.0, 22.5));
        assert_eq!((trades[2].amount, trades[2].price), (3.0, 32.5));
        assert!(demand.is_empty());
        assert_eq!(supply.len(), 1);
        assert_eq!(supply[0].amount, 2.0);
    }
}
