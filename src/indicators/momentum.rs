//! Momentum oscillators: RSI, MACD, Stochastic

use serde::{Deserialize, Serialize};

use super::{ema_series, highest, lowest, mean, Computed, HasSignal, IndicatorThresholds, Signal};
use crate::history::Sample;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RsiOutput {
    pub value: f64,
    pub signal: Signal,
}

impl HasSignal for RsiOutput {
    fn signal(&self) -> Signal {
        self.signal
    }
}

/// Relative Strength Index over the last `period` price changes
///
/// Plain averages of gains and losses. A window with no losses reads 100; a
/// window with no movement at all reads 50.
pub fn rsi(prices: &[f64], period: usize, thresholds: &IndicatorThresholds) -> Computed<RsiOutput> {
    let period = period.max(1);
    if prices.len() < period + 1 {
        return Computed::unavailable(period + 1, prices.len());
    }

    let window = &prices[prices.len() - period - 1..];
    let (gains, losses) = window.windows(2).fold((0.0, 0.0), |(g, l), w| {
        let delta = w[1] - w[0];
        if delta > 0.0 {
            (g + delta, l)
        } else {
            (g, l - delta)
        }
    });

    let avg_gain = gains / period as f64;
    let avg_loss = losses / period as f64;

    let value = if avg_loss == 0.0 {
        if avg_gain == 0.0 {
            50.0
        } else {
            100.0
        }
    } else {
        let rs = avg_gain / avg_loss;
        100.0 - 100.0 / (1.0 + rs)
    };

    let signal = if value < thresholds.rsi_oversold {
        Signal::Buy
    } else if value > thresholds.rsi_overbought {
        Signal::Sell
    } else {
        Signal::Hold
    };

    Computed::Ready(RsiOutput { value, signal })
}

/// Direction of a MACD/signal-line cross on the latest bar
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Crossover {
    Bullish,
    Bearish,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MacdOutput {
    pub macd: f64,
    pub signal_line: f64,
    pub histogram: f64,
    pub crossover: Option<Crossover>,
    pub signal: Signal,
}

impl HasSignal for MacdOutput {
    fn signal(&self) -> Signal {
        self.signal
    }
}

/// MACD with a true EMA signal line
///
/// The MACD line is `EMA(fast) - EMA(slow)` at every bar where both exist;
/// the signal line is the EMA of that series over `smoothing` bars. When the
/// MACD series is still shorter than `smoothing`, the signal line falls back
/// to its plain mean and the result is `Degraded`.
pub fn macd(prices: &[f64], fast: usize, slow: usize, smoothing: usize) -> Computed<MacdOutput> {
    let smoothing = smoothing.max(1);
    let required = slow + smoothing - 1;
    if fast == 0 || fast >= slow || prices.len() < slow {
        return Computed::unavailable(required, prices.len());
    }

    let fast_series = ema_series(prices, fast);
    let slow_series = ema_series(prices, slow);
    let offset = slow - fast;
    let macd_series: Vec<f64> = slow_series
        .iter()
        .enumerate()
        .map(|(i, slow_ema)| fast_series[i + offset] - slow_ema)
        .collect();

    let macd_line = match macd_series.last() {
        Some(v) => *v,
        None => return Computed::unavailable(required, prices.len()),
    };

    let signal_series = ema_series(&macd_series, smoothing);
    let (signal_line, degraded) = match signal_series.last() {
        Some(v) => (*v, false),
        None => (mean(&macd_series), true),
    };
    let histogram = macd_line - signal_line;

    let crossover = if signal_series.len() >= 2 {
        let n = macd_series.len();
        let prev_histogram = macd_series[n - 2] - signal_series[signal_series.len() - 2];
        if prev_histogram <= 0.0 && histogram > 0.0 {
            Some(Crossover::Bullish)
        } else if prev_histogram >= 0.0 && histogram < 0.0 {
            Some(Crossover::Bearish)
        } else {
            None
        }
    } else {
        None
    };

    let signal = if histogram > 0.0 {
        Signal::Buy
    } else if histogram < 0.0 {
        Signal::Sell
    } else {
        Signal::Hold
    };

    let output = MacdOutput {
        macd: macd_line,
        signal_line,
        histogram,
        crossover,
        signal,
    };

    if degraded {
        Computed::Degraded(output)
    } else {
        Computed::Ready(output)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StochasticOutput {
    pub k: f64,
    pub d: f64,
    pub signal: Signal,
}

impl HasSignal for StochasticOutput {
    fn signal(&self) -> Signal {
        self.signal
    }
}

/// %K at the sample ending the window; a flat window reads 50
fn percent_k(window: &[Sample]) -> f64 {
    let (Some(high), Some(low), Some(last)) = (
        highest(window.iter().map(|s| s.high)),
        lowest(window.iter().map(|s| s.low)),
        window.last(),
    ) else {
        return 50.0;
    };
    let range = high - low;
    if range <= 0.0 {
        50.0
    } else {
        (last.price - low) / range * 100.0
    }
}

/// Stochastic oscillator with %D as the SMA of the last `d_period` %K values
pub fn stochastic(
    samples: &[Sample],
    period: usize,
    d_period: usize,
    thresholds: &IndicatorThresholds,
) -> Computed<StochasticOutput> {
    let period = period.max(1);
    let d_period = d_period.max(1);
    if samples.len() < period {
        return Computed::unavailable(period + d_period - 1, samples.len());
    }

    let mut k_values: Vec<f64> = (period - 1..samples.len())
        .rev()
        .take(d_period)
        .map(|end| percent_k(&samples[end + 1 - period..=end]))
        .collect();
    k_values.reverse();

    let k = k_values[k_values.len() - 1];
    let d = mean(&k_values);
    let signal = if k < thresholds.stochastic_oversold {
        Signal::Buy
    } else if k > thresholds.stochastic_overbought {
        Signal::Sell
    } else {
        Signal::Hold
    };

    let output = StochasticOutput { k, d, signal };
    if k_values.len() == d_period {
        Computed::Ready(output)
    } else {
        Computed::Degraded(output)
    }
}
