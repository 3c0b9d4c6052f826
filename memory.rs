use std::collections::BTreeMap;

use crate::forecast::{HoltWinters, PriceForecaster, RatioForecaster, RegressionProjector};
use crate::grid::ExternalGrid;
use crate::types::{EngineError, MarketInformation, Schedule, Trade, HOURS};

/// Market-information memory keyed by (weekday, hour).
///
/// Single writer of its records: the platform reads views, the memory
/// creates them by prediction on miss and folds executed trades back in.
pub struct MarketMemory {
    records: BTreeMap<(usize, usize), MarketInformation>,
    price_forecaster: Box<dyn PriceForecaster>,
    ratio_forecaster: Box<dyn RatioForecaster>,
}

impl MarketMemory {
    pub fn new(
        price_forecaster: Box<dyn PriceForecaster>,
        ratio_forecaster: Box<dyn RatioForecaster>,
    ) -> Self {
        Self { records: BTreeMap::new(), price_forecaster, ratio_forecaster }
    }

    /// Default forecasters: seasonal exponential smoothing for prices,
    /// least-squares projection for the round trajectory.
    pub fn with_default_forecasters(seasonal_period: usize) -> Self {
        Self::new(Box::new(HoltWinters::new(seasonal_period)), Box::new(RegressionProjector))
    }

    /// The record for `s`, predicting a fresh one on first observation.
    pub fn view(
        &mut self,
        s: Schedule,
        grid: &ExternalGrid,
    ) -> Result<&mut MarketInformation, EngineError> {
        let key = s.key();
        if !self.records.contains_key(&key) {
            let fresh = self.predict(s, grid)?;
            self.records.insert(key, fresh);
        }
        Ok(self.records.get_mut(&key).expect("record inserted above"))
    }

    /// Read-only access without creating a record.
    pub fn information(&self, s: Schedule) -> Option<&MarketInformation> {
        self.records.get(&s.key())
    }

    /// Construct a prediction for an unobserved slot: round trajectories are
    /// carried forward from the predecessor slot (seeded flat when there is
    /// none), the day price curve is the realized prefix up to `s.hour`
    /// followed by the forecaster's tail.
    fn predict(&self, s: Schedule, grid: &ExternalGrid) -> Result<MarketInformation, EngineError> {
        let mut info = MarketInformation::new();

        if !self.records.is_empty() {
            if let Some(pre) = s.pre() {
                if let Some(pre_record) = self.records.get(&pre.key()) {
                    info.prices = pre_record.prices;
                    info.amount = pre_record.amount;
                    info.supply_demand_ratio = pre_record.supply_demand_ratio;
                }
            }
        }

        info.external_price_hour = grid.price(s)?;

        let history = grid.history(s)?;
        let observed = s.hour + 1;
        let steps = HOURS - observed;
        let forecast = self.price_forecast_or_pad(&history, steps);
        for (slot, value) in history[history.len() - observed..]
            .iter()
            .chain(forecast.iter())
            .enumerate()
        {
            info.external_price_day[slot] = *value;
        }

        Ok(info)
    }

    /// Forecast with the configured model, padding with the last observed
    /// price when the model declines or returns a malformed series.
    fn price_forecast_or_pad(&self, history: &[f64], steps: usize) -> Vec<f64> {
        let last = history.last().copied().unwrap_or(0.0);
        match self.price_forecaster.forecast(history, steps) {
            Some(out) if out.len() == steps && out.iter().all(|v| v.is_finite() && *v >= 0.0) => {
                out
            }
            _ => vec![last; steps],
        }
    }

    /// Project the remaining rounds of the current record from the
    /// predecessor's trajectory. Does nothing in the first round, when no
    /// predecessor record exists, or when the projector declines.
    pub fn adjust(&mut self, s: Schedule, round: usize) {
        if round <= 1 {
            return;
        }
        let Some(pre) = s.pre() else {
            return;
        };
        let Some((pre_ratio, pre_prices)) = self
            .records
            .get(&pre.key())
            .map(|r| (r.supply_demand_ratio, r.prices))
        else {
            return;
        };
        let Some(current) = self.records.get_mut(&s.key()) else {
            return;
        };
        self.ratio_forecaster.project(
            &pre_ratio,
            &pre_prices,
            &mut current.supply_demand_ratio,
            &mut current.prices,
            round,
        );
    }

    /// Fold a round's executed trades into the record at `s`: append to the
    /// trade history and update the round's volume-weighted average price
    /// and volume. In the settlement round, previously recorded volume at
    /// this index is merged before re-averaging. Empty input is a no-op.
    pub fn record(
        &mut self,
        s: Schedule,
        trades: &[Trade],
        grid: &ExternalGrid,
    ) -> Result<(), EngineError> {
        if trades.is_empty() {
            return Ok(());
        }
        let data = self.view(s, grid)?;
        data.trade_list.extend_from_slice(trades);

        let index = data.round_number - 1;
        let (mut value, mut volume) = if data.last {
            (data.prices[index] * data.amount[index], data.amount[index])
        } else {
            (0.0, 0.0)
        };
        for trade in trades {
            value += trade.price * trade.amount;
            volume += trade.amount;
        }
        if volume > 0.0 {
            data.prices[index] = value / volume;
            data.amount[index] = volume;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Trade, TradeMode, MAX_ROUND};

    fn memory() -> MarketMemory {
        MarketMemory::with_default_forecasters(HOURS * 7)
    }

    fn market_trade(amount: f64, price: f64) -> Trade {
        Trade {
            amount,
            price,
            supplier_id: "u1".into(),
            supplier_device_id: "pv".into(),
            consumer_id: "u2".into(),
            consumer_device_id: "load".into(),
            mode: TradeMode::Market,
        }
    }

    #[test]
    fn first_view_is_seeded_flat() {
        let grid = ExternalGrid::default();
        let mut memory = memory();
        let s = Schedule::new(0, 0).unwrap();
        let view = memory.view(s, &grid).unwrap();
        assert_eq!(view.prices, [0.0; MAX_ROUND]);
        assert_eq!(view.amount, [0.0; MAX_ROUND]);
        assert_eq!(view.supply_demand_ratio, [1.0; MAX_ROUND]);
        assert_eq!(view.external_price_hour, grid.price(s).unwrap());
        assert_eq!(view.round_number, 1);
        assert!(!view.last);
    }

    #[test]
    fn view_copies_predecessor_trajectories() {
        let grid = ExternalGrid::default();
        let mut memory = memory();
        let s0 = Schedule::new(0, 0).unwrap();
        {
            let view = memory.view(s0, &grid).unwrap();
            view.prices[0] = 42.0;
            view.amount[0] = 7.0;
            view.supply_demand_ratio[0] = 1.5;
        }
        let s1 = Schedule::new(0, 1).unwrap();
        let view = memory.view(s1, &grid).unwrap();
        assert_eq!(view.prices[0], 42.0);
        assert_eq!(view.amount[0], 7.0);
        assert_eq!(view.supply_demand_ratio[0], 1.5);
        // Deep copy: mutating the new record must not leak backwards.
        view.prices[0] = 0.0;
        assert_eq!(memory.information(s0).unwrap().prices[0], 42.0);
    }

    #[test]
    fn price_day_prefix_is_history_suffix_is_forecast() {
        let grid = ExternalGrid::default();
        let mut memory = memory();
        let s = Schedule::new(0, 5).unwrap();
        let view = memory.view(s, &grid).unwrap();
        // Hours 0..=5 are realized prices of the day.
        for hour in 0..=5 {
            let slot = Schedule::new(0, hour).unwrap();
            assert_eq!(view.external_price_day[hour], grid.price(slot).unwrap());
        }
        // The forecast tail is complete and sane.
        for hour in 6..HOURS {
            assert!(view.external_price_day[hour].is_finite());
            assert!(view.external_price_day[hour] >= 0.0);
        }
    }

    #[test]
    fn record_averages_by_volume() {
        let grid = ExternalGrid::default();
        let mut memory = memory();
        let s = Schedule::new(0, 0).unwrap();
        memory.view(s, &grid).unwrap();
        memory
            .record(s, &[market_trade(10.0, 20.0), market_trade(30.0, 40.0)], &grid)
            .unwrap();
        let info = memory.information(s).unwrap();
        assert_eq!(info.amount[0], 40.0);
        assert!((info.prices[0] - 35.0).abs() < 1e-9);
        assert_eq!(info.trade_list.len(), 2);
    }

    #[test]
    fn record_empty_is_a_noop() {
        let grid = ExternalGrid::default();
        let mut memory = memory();
        let s = Schedule::new(0, 0).unwrap();
        memory.view(s, &grid).unwrap();
        memory.record(s, &[], &grid).unwrap();
        let info = memory.information(s).unwrap();
        assert!(info.trade_list.is_empty());
        assert_eq!(info.amount, [0.0; MAX_ROUND]);
    }

    #[test]
    fn settlement_round_merges_previous_volume() {
        let grid = ExternalGrid::default();
        let mut memory = memory();
        let s = Schedule::new(0, 0).unwrap();
        {
            let view = memory.view(s, &grid).unwrap();
            view.round_number = MAX_ROUND;
            view.last = true;
        }
        memory.record(s, &[market_trade(10.0, 30.0)], &grid).unwrap();
        memory.record(s, &[market_trade(10.0, 50.0)], &grid).unwrap();
        let info = memory.information(s).unwrap();
        let index = MAX_ROUND - 1;
        assert_eq!(info.amount[index], 20.0);
        assert!((info.prices[index] - 40.0).abs() < 1e-9);
        // The trade history only ever grows.
        assert_eq!(info.trade_list.len(), 2);
        assert_eq!(info.trade_list[0].price, 30.0);
    }

    #[test]
    fn adjust_projects_future_rounds_only() {
        let grid = ExternalGrid::default();
        let mut memory = memory();
        let s0 = Schedule::new(0, 0).unwrap();
        {
            let view = memory.view(s0, &grid).unwrap();
            view.supply_demand_ratio = [2.0, 1.0, 0.5, 0.25, 0.125];
            view.prices = [20.0, 10.0, 5.0, 2.5, 1.25];
        }
        let s1 = Schedule::new(0, 1).unwrap();
        {
            let view = memory.view(s1, &grid).unwrap();
            view.supply_demand_ratio = [1.6, 0.8, 0.0, 0.0, 0.0];
            view.prices = [16.0, 8.0, 0.0, 0.0, 0.0];
            view.round_number = 2;
        }
        memory.adjust(s1, 2);
        let info = memory.information(s1).unwrap();
        assert!((info.supply_demand_ratio[2] - 0.4).abs() < 1e-6);
        assert!((info.prices[2] - 4.0).abs() < 1e-5);
        assert_eq!(info.supply_demand_ratio[0], 1.6);

        // First round never adjusts.
        let before = memory.information(s1).unwrap().clone();
        memory.adjust(s1, 1);
        assert_eq!(memory.information(s1).unwrap().supply_demand_ratio, before.supply_demand_ratio);
    }
}
