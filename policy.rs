//! Offer-pricing policy.

/// Quote (sell, buy) prices around the predicted clearing price.
///
/// δ = self_ratio / predicted_ratio (1 when the market ratio is unknown):
///   sell = p · (1 + factor · (1 − δ))
///   buy  = p · (1 − factor · (1 − δ))
///
/// A participant long on supply relative to the market (δ > 1) lowers both
/// its ask and its bid; a short participant raises them.
pub fn quote_prices(
    predicted_ratio: f64,
    predicted_price: f64,
    self_ratio: f64,
    factor: f64,
) -> (f64, f64) {
    let delta = if predicted_ratio > 0.0 { self_ratio / predicted_ratio } else { 1.0 };
    let sell = predicted_price * (1.0 + factor * (1.0 - delta));
    let buy = predicted_price * (1.0 - factor * (1.0 - delta));
    (sell, buy)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balanced_participant_quotes_the_predicted_price() {
        let (sell, buy) = quote_prices(1.0, 100.0, 1.0, 0.1);
        assert_eq!(sell, 100.0);
        assert_eq!(buy, 100.0);
    }

    #[test]
    fn long_participant_undercuts() {
        // δ = 4: plenty of own supply → ask drops below the prediction,
        // bid rises above it.
        let (sell, buy) = quote_prices(0.5, 100.0, 2.0, 0.1);
        assert!((sell - 70.0).abs() < 1e-9);
        assert!((buy - 130.0).abs() < 1e-9);
        assert!(sell < buy);
    }

    #[test]
    fn short_participant_raises_both() {
        // δ = 0.25: scarce own supply → ask above prediction, bid below.
        let (sell, buy) = quote_prices(2.0, 100.0, 0.5, 0.1);
        assert!((sell - 107.5).abs() < 1e-9);
        assert!((buy - 92.5).abs() < 1e-9);
        assert!(sell > buy);
    }

    #[test]
    fn unknown_market_ratio_defaults_to_balance() {
        let (sell, buy) = quote_prices(0.0, 80.0, 5.0, 0.1);
        assert_eq!(sell, 80.0);
        assert_eq!(buy, 80.0);
    }
}
