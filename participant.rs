use std::collections::BTreeMap;

use crate::device::DeviceMode;
use crate::distribution::Microgrid;
use crate::policy::quote_prices;
use crate::types::{MarketInformation, Schedule, Trade, TradeMode};

/// One round's worth of offers from a single participant.
#[derive(Clone, Debug, Default)]
pub struct OfferSet {
    pub supply: Vec<Trade>,
    pub demand: Vec<Trade>,
    /// Intra-participant trades, routed straight to distribution and never
    /// entering the order book.
    pub self_use: Vec<Trade>,
}

/// A market participant: owns device ids (the devices live in the microgrid
/// arena), price limits, and the market views pushed to it each round.
pub struct Participant {
    user_id: String,
    device_ids: Vec<String>,
    sell_range: (f64, f64),
    buy_range: (f64, f64),
    market: BTreeMap<(usize, usize), MarketInformation>,
}

impl Participant {
    pub fn new(user_id: &str, device_ids: Vec<String>) -> Self {
        Self {
            user_id: user_id.to_string(),
            device_ids,
            sell_range: (0.0, f64::MAX),
            buy_range: (0.0, f64::MAX),
            market: BTreeMap::new(),
        }
    }

    #[inline]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    #[inline]
    pub fn device_ids(&self) -> &[String] {
        &self.device_ids
    }

    /// Restrict the prices this participant will quote.
    pub fn set_price_ranges(&mut self, sell: (f64, f64), buy: (f64, f64)) {
        self.sell_range = sell;
        self.buy_range = buy;
    }

    /// Cache the market view pushed by the platform at the start of a round.
    pub fn on_notify(&mut self, s: Schedule, view: MarketInformation) {
        self.market.insert(s.key(), view);
    }

    pub fn market_view(&self, s: Schedule) -> Option<&MarketInformation> {
        self.market.get(&s.key())
    }

    /// Produce this round's market supply offers, demand offers, and
    /// self-use trades.
    ///
    /// Self-use netting happens when the quoted ask undercuts the quoted bid
    /// (the participant is better off consuming its own energy), pairing own
    /// supplies with own demands FIFO. Market offers still carry each
    /// device's full raw amount afterwards; netting them against the emitted
    /// self-use trades is a known follow-up.
    pub fn offers(&self, s: Schedule, microgrid: &Microgrid, factor: f64) -> OfferSet {
        let Some(view) = self.market.get(&s.key()) else {
            return OfferSet::default();
        };
        let index = view.round_number - 1;

        let raw_supply = self.raw_supply(s, microgrid);
        let raw_demand = self.raw_demand(s, microgrid, view);

        let self_supply: f64 = raw_supply.iter().map(|(_, a)| a).sum();
        let self_demand: f64 = raw_demand.iter().map(|(_, a)| a).sum();
        let self_ratio = if self_demand > 0.0 { self_supply / self_demand } else { 1.0 };

        let (sell, buy) = quote_prices(
            view.supply_demand_ratio[index],
            view.prices[index],
            self_ratio,
            factor,
        );
        let sell = sell.clamp(self.sell_range.0, self.sell_range.1);
        let buy = buy.clamp(self.buy_range.0, self.buy_range.1);

        let mut set = OfferSet::default();
        if sell < buy {
            set.self_use = self.pair_self_use(&raw_supply, &raw_demand, sell);
        }
        for (device_id, amount) in &raw_supply {
            set.supply.push(Trade::supply_offer(&self.user_id, device_id, *amount, sell));
        }
        for (device_id, amount) in &raw_demand {
            set.demand.push(Trade::demand_offer(&self.user_id, device_id, *amount, buy));
        }
        set
    }

    fn raw_supply(&self, s: Schedule, microgrid: &Microgrid) -> Vec<(String, f64)> {
        self.device_ids
            .iter()
            .filter_map(|id| {
                let device = microgrid.device(id)?;
                let amount = device.supply(s);
                (amount > 0.0).then(|| (id.clone(), amount))
            })
            .collect()
    }

    /// Demanding devices for this slot. IMMEDIATE and PERSIST loads always
    /// participate; a SHIFTABLE load joins only when the current hour is the
    /// cheapest remaining hour of the forecast day (ties to the earliest).
    fn raw_demand(
        &self,
        s: Schedule,
        microgrid: &Microgrid,
        view: &MarketInformation,
    ) -> Vec<(String, f64)> {
        let mut cheapest_hour = s.hour;
        for hour in s.hour + 1..view.external_price_day.len() {
            if view.external_price_day[hour] < view.external_price_day[cheapest_hour] {
                cheapest_hour = hour;
            }
        }

        self.device_ids
            .iter()
            .filter_map(|id| {
                let device = microgrid.device(id)?;
                let amount = device.demand(s);
                if amount <= 0.0 {
                    return None;
                }
                let wanted = match device.mode() {
                    DeviceMode::Immediate | DeviceMode::Persist => true,
                    DeviceMode::Shiftable => cheapest_hour == s.hour,
                };
                wanted.then(|| (id.clone(), amount))
            })
            .collect()
    }

    fn pair_self_use(
        &self,
        raw_supply: &[(String, f64)],
        raw_demand: &[(String, f64)],
        price: f64,
    ) -> Vec<Trade> {
        let mut supply: Vec<(String, f64)> = raw_supply.to_vec();
        let mut demand: Vec<(String, f64)> = raw_demand.to_vec();
        let mut trades = Vec::new();

        while let (Some((src, available)), Some((dst, wanted))) =
            (supply.first().cloned(), demand.first().cloned())
        {
            let amount = available.min(wanted);
            trades.push(Trade {
                amount,
                price,
                supplier_id: self.user_id.clone(),
                supplier_device_id: src,
                consumer_id: self.user_id.clone(),
                consumer_device_id: dst,
                mode: TradeMode::SelfUse,
            });
            if available <= amount {
                supply.remove(0);
            } else {
                supply[0].1 = available - amount;
            }
            if wanted <= amount {
                demand.remove(0);
            } else {
                demand[0].1 = wanted - amount;
            }
        }
        trades
    }
}
