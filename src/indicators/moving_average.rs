//! Simple and exponential moving averages

use super::{mean, Computed};

/// Mean of the last `period` values
///
/// With fewer values than `period` the mean of everything available is
/// returned as `Degraded`.
pub fn sma(values: &[f64], period: usize) -> Computed<f64> {
    let period = period.max(1);
    if values.is_empty() {
        return Computed::unavailable(period, 0);
    }
    if values.len() < period {
        return Computed::Degraded(mean(values));
    }
    Computed::Ready(mean(&values[values.len() - period..]))
}

/// Rolling EMA seeded with the SMA of the first `period` values
///
/// Element `i` of the result corresponds to `values[period - 1 + i]`. Empty
/// when there are fewer than `period` values.
pub fn ema_series(values: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || values.len() < period {
        return Vec::new();
    }

    let multiplier = 2.0 / (period as f64 + 1.0);
    let mut series = Vec::with_capacity(values.len() - period + 1);
    let mut current = mean(&values[..period]);
    series.push(current);

    for value in &values[period..] {
        current = (value - current) * multiplier + current;
        series.push(current);
    }

    series
}

/// Latest EMA value; degrades to the SMA of all values on short input
pub fn ema(values: &[f64], period: usize) -> Computed<f64> {
    let period = period.max(1);
    if values.is_empty() {
        return Computed::unavailable(period, 0);
    }
    match ema_series(values, period).last() {
        Some(v) => Computed::Ready(*v),
        None => Computed::Degraded(mean(values)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sma_scenario() {
        let prices = [100.0, 102.0, 101.0, 105.0];
        assert_eq!(sma(&prices, 4), Computed::Ready(102.0));
    }

    #[test]
    fn test_sma_degrades_on_short_series() {
        let prices = [100.0, 102.0];
        assert_eq!(sma(&prices, 20), Computed::Degraded(101.0));
        assert!(sma(&[], 20).is_unavailable());
    }

    #[test]
    fn test_ema_seed_and_roll() {
        // seed = mean(1,2,3) = 2, k = 0.5; next = (4-2)*0.5+2 = 3; next = (5-3)*0.5+3 = 4
        let values = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(ema_series(&values, 3), vec![2.0, 3.0, 4.0]);
        assert_eq!(ema(&values, 3), Computed::Ready(4.0));
    }

    #[test]
    fn test_ema_degrades_to_sma() {
        let values = [10.0, 20.0];
        assert_eq!(ema(&values, 5), Computed::Degraded(15.0));
    }
}
