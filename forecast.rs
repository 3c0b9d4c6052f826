//! Pluggable forecasters feeding the market memory.
//!
//! Two capability seams: an external-price forecaster (hourly price series →
//! n future prices) and a ratio/price projector (previous slot's per-round
//! trajectory → remaining rounds of the current slot). The defaults are
//! additive Holt-Winters smoothing and ordinary least squares; anything
//! honoring the contracts can be swapped in.

use crate::types::HOURS;

// ─── Contracts ────────────────────────────────────────────────────────────────

/// Forecasts `steps` future values from a finite series of past hourly
/// prices. A conforming result has exactly `steps` finite, non-negative
/// entries; `None` signals the forecaster cannot produce one.
pub trait PriceForecaster {
    fn forecast(&self, series: &[f64], steps: usize) -> Option<Vec<f64>>;
}

/// Projects the tail of the current slot's supply/demand-ratio and price
/// trajectories from the previous slot's completed trajectory.
///
/// `round` is the 1-based current round; indices `round..` of `ratio` and
/// `prices` are overwritten in place. Degenerate input (too short, mismatched
/// lengths, no variance to regress on) leaves both untouched.
pub trait RatioForecaster {
    fn project(
        &self,
        pre_ratio: &[f64],
        pre_prices: &[f64],
        ratio: &mut [f64],
        prices: &mut [f64],
        round: usize,
    );
}

// ─── Exponential smoothing ────────────────────────────────────────────────────

/// Additive-trend, additive-seasonal exponential smoothing with fixed
/// smoothing constants.
///
/// Seasonal fitting needs two full periods of data; with less, the model
/// degrades to a shorter daily period, then to plain trend smoothing, then to
/// last-value repetition. Forecasts are clamped at zero.
#[derive(Clone, Debug)]
pub struct HoltWinters {
    pub alpha: f64,
    pub beta: f64,
    pub gamma: f64,
    /// Primary seasonal period in hours (a week by default).
    pub period: usize,
}

impl HoltWinters {
    pub fn new(period: usize) -> Self {
        Self { alpha: 0.35, beta: 0.05, gamma: 0.15, period }
    }

    fn seasonal_forecast(&self, series: &[f64], steps: usize, period: usize) -> Vec<f64> {
        let n = series.len();
        let mean = |xs: &[f64]| xs.iter().sum::<f64>() / xs.len() as f64;

        let first = mean(&series[..period]);
        let second = mean(&series[period..2 * period]);
        let mut level = first;
        let mut trend = (second - first) / period as f64;
        let mut season: Vec<f64> = series[..period].iter().map(|y| y - first).collect();

        for (t, &y) in series.iter().enumerate() {
            let idx = t % period;
            let prev_level = level;
            level = self.alpha * (y - season[idx]) + (1.0 - self.alpha) * (level + trend);
            trend = self.beta * (level - prev_level) + (1.0 - self.beta) * trend;
            season[idx] = self.gamma * (y - level) + (1.0 - self.gamma) * season[idx];
        }

        (0..steps)
            .map(|h| (level + (h + 1) as f64 * trend + season[(n + h) % period]).max(0.0))
            .collect()
    }

    /// Trend-only (Holt) smoothing for series too short for any season.
    fn trend_forecast(&self, series: &[f64], steps: usize) -> Vec<f64> {
        let mut level = series[0];
        let mut trend = series[1] - series[0];
        for &y in &series[1..] {
            let prev_level = level;
            level = self.alpha * y + (1.0 - self.alpha) * (level + trend);
            trend = self.beta * (level - prev_level) + (1.0 - self.beta) * trend;
        }
        (0..steps).map(|h| (level + (h + 1) as f64 * trend).max(0.0)).collect()
    }
}

impl Default for HoltWinters {
    fn default() -> Self {
        Self::new(HOURS * 7)
    }
}

impl PriceForecaster for HoltWinters {
    fn forecast(&self, series: &[f64], steps: usize) -> Option<Vec<f64>> {
        if steps == 0 {
            return Some(Vec::new());
        }
        if series.is_empty() || series.iter().any(|v| !v.is_finite()) {
            return None;
        }

        let out = if self.period >= 2 && series.len() >= 2 * self.period {
            self.seasonal_forecast(series, steps, self.period)
        } else if series.len() >= 2 * HOURS {
            self.seasonal_forecast(series, steps, HOURS)
        } else if series.len() >= 2 {
            self.trend_forecast(series, steps)
        } else {
            vec![series[0].max(0.0); steps]
        };

        out.iter().all(|v| v.is_finite()).then_some(out)
    }
}

// ─── Linear regression ────────────────────────────────────────────────────────

/// Least-squares fit of y = slope·x + intercept. None when there are fewer
/// than two points or x carries no variance.
pub fn fit_line(xs: &[f64], ys: &[f64]) -> Option<(f64, f64)> {
    if xs.len() != ys.len() || xs.len() < 2 {
        return None;
    }
    let n = xs.len() as f64;
    let mean_x = xs.iter().sum::<f64>() / n;
    let mean_y = ys.iter().sum::<f64>() / n;
    let var_x: f64 = xs.iter().map(|x| (x - mean_x) * (x - mean_x)).sum();
    if var_x < 1e-12 {
        return None;
    }
    let cov: f64 = xs.iter().zip(ys).map(|(x, y)| (x - mean_x) * (y - mean_y)).sum();
    let slope = cov / var_x;
    let intercept = mean_y - slope * mean_x;
    (slope.is_finite() && intercept.is_finite()).then_some((slope, intercept))
}

/// Default ratio/price projector: fits ratio[t+1] against ratio[t] and
/// price[t] against ratio[t] on the previous slot, then rolls the current
/// slot's ratio forward autoregressively, pricing each projected ratio.
#[derive(Clone, Copy, Debug, Default)]
pub struct RegressionProjector;

impl RatioForecaster for RegressionProjector {
    fn project(
        &self,
        pre_ratio: &[f64],
        pre_prices: &[f64],
        ratio: &mut [f64],
        prices: &mut [f64],
        round: usize,
    ) {
        let r = ratio.len();
        if round == 0 || round >= r {
            return;
        }
        if pre_ratio.len() != r || pre_prices.len() != r || prices.len() != r || r < 2 {
            return;
        }

        let Some((ratio_slope, ratio_icpt)) = fit_line(&pre_ratio[..r - 1], &pre_ratio[1..])
        else {
            return;
        };
        let Some((price_slope, price_icpt)) = fit_line(&pre_ratio[..r - 1], &pre_prices[..r - 1])
        else {
            return;
        };

        let mut last = ratio[round - 1];
        for t in round..r {
            let next = (ratio_slope * last + ratio_icpt).max(0.0);
            ratio[t] = next;
            prices[t] = (price_slope * next + price_icpt).max(0.0);
            last = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forecast_len_matches_steps() {
        let hw = HoltWinters::default();
        let series: Vec<f64> = (0..400).map(|i| 100.0 + (i % 24) as f64).collect();
        let out = hw.forecast(&series, 7).unwrap();
        assert_eq!(out.len(), 7);
        assert!(out.iter().all(|v| v.is_finite() && *v >= 0.0));
    }

    #[test]
    fn forecast_zero_steps_is_empty() {
        let hw = HoltWinters::default();
        assert_eq!(hw.forecast(&[1.0, 2.0], 0).unwrap(), Vec::<f64>::new());
    }

    #[test]
    fn forecast_tracks_seasonal_pattern() {
        // Pure daily sawtooth, no trend: the next-step forecast should land
        // near the value one day earlier.
        let hw = HoltWinters::new(24);
        let series: Vec<f64> = (0..24 * 10).map(|i| 50.0 + (i % 24) as f64 * 2.0).collect();
        let out = hw.forecast(&series, 24).unwrap();
        assert!((out[0] - 50.0).abs() < 5.0, "day start ≈ 50, got {}", out[0]);
        assert!((out[23] - 96.0).abs() < 5.0, "day end ≈ 96, got {}", out[23]);
    }

    #[test]
    fn short_series_still_forecasts() {
        let hw = HoltWinters::default();
        assert_eq!(hw.forecast(&[42.0], 3).unwrap(), vec![42.0; 3]);
        let out = hw.forecast(&[10.0, 12.0, 14.0], 2).unwrap();
        assert_eq!(out.len(), 2);
        assert!(out[1] >= out[0], "rising trend should continue");
    }

    #[test]
    fn empty_series_declines() {
        assert!(HoltWinters::default().forecast(&[], 3).is_none());
    }

    #[test]
    fn fit_line_recovers_slope() {
        let xs = [1.0, 2.0, 3.0, 4.0];
        let ys = [3.0, 5.0, 7.0, 9.0];
        let (slope, intercept) = fit_line(&xs, &ys).unwrap();
        assert!((slope - 2.0).abs() < 1e-9);
        assert!((intercept - 1.0).abs() < 1e-9);
    }

    #[test]
    fn fit_line_degenerate_x_declines() {
        assert!(fit_line(&[2.0, 2.0, 2.0], &[1.0, 2.0, 3.0]).is_none());
        assert!(fit_line(&[1.0], &[1.0]).is_none());
    }

    #[test]
    fn projector_extends_autoregressively() {
        // Previous slot's ratio decays by ×0.5 each round; prices equal
        // 10×ratio. The projector should learn both relations.
        let pre_ratio = [2.0, 1.0, 0.5, 0.25, 0.125];
        let pre_prices = [20.0, 10.0, 5.0, 2.5, 1.25];
        let mut ratio = [1.6, 0.8, 0.0, 0.0, 0.0];
        let mut prices = [16.0, 8.0, 0.0, 0.0, 0.0];
        RegressionProjector.project(&pre_ratio, &pre_prices, &mut ratio, &mut prices, 2);
        assert!((ratio[2] - 0.4).abs() < 1e-6);
        assert!((ratio[3] - 0.2).abs() < 1e-6);
        assert!((prices[2] - 4.0).abs() < 1e-5);
        // Already-observed rounds are untouched.
        assert_eq!(ratio[0], 1.6);
        assert_eq!(prices[1], 8.0);
    }

    #[test]
    fn projector_ignores_degenerate_input() {
        let pre_ratio = [1.0; 5];
        let pre_prices = [10.0, 11.0, 12.0, 13.0, 14.0];
        let mut ratio = [0.7; 5];
        let mut prices = [9.0; 5];
        RegressionProjector.project(&pre_ratio, &pre_prices, &mut ratio, &mut prices, 2);
        assert_eq!(ratio, [0.7; 5]);
        assert_eq!(prices, [9.0; 5]);
        // Terminal round: nothing left to project.
        RegressionProjector.project(
            &[2.0, 1.0, 0.5, 0.25, 0.125],
            &[20.0, 10.0, 5.0, 2.5, 1.25],
            &mut ratio,
            &mut prices,
            5,
        );
        assert_eq!(ratio, [0.7; 5]);
    }
}
