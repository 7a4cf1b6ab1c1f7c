//! Technical indicator engine
//!
//! Pure functions over a price series (`&[f64]`) or the sample sequence
//! (`&[Sample]`, for indicators that need high/low/volume). Nothing here holds
//! state between calls, so the same slice always produces the same output.
//!
//! Short input never errors. Every function returns a [`Computed`] that says
//! whether the value is real, was computed over a shorter window than asked
//! for, or could not be computed at all.

mod composite;
mod momentum;
mod moving_average;
mod trend;
mod volatility;
mod volume;

pub use composite::{
    oscillator_composite, order_blocks, wyckoff, CompositeOutput, OrderBlock, OrderBlockOutput,
    OscillatorInputs, WyckoffOutput, WyckoffPhase,
};
pub use momentum::{macd, rsi, stochastic, Crossover, MacdOutput, RsiOutput, StochasticOutput};
pub use moving_average::{ema, ema_series, sma};
pub use trend::{
    elder_ray, ichimoku, trend_template, CloudPosition, ElderRayOutput, ElderState,
    IchimokuOutput, TrendCriteria, TrendTemplateOutput,
};
pub use volatility::{
    atr, bollinger, keltner, supertrend, BandPosition, BollingerOutput, ChannelPosition,
    KeltnerOutput, SupertrendOutput, TrendDirection,
};
pub use volume::{order_flow_imbalance, vwap, wave_imbalance, OrderFlowOutput, VwapOutput, WaveOutput};

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

use crate::history::Sample;

/// Directional output of an indicator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Signal {
    StrongBuy,
    Buy,
    Hold,
    Neutral,
    Sell,
    StrongSell,
    Unavailable,
}

impl Signal {
    /// Vote weight used by the bias aggregation
    pub fn score(&self) -> i32 {
        match self {
            Signal::StrongBuy => 2,
            Signal::Buy => 1,
            Signal::Sell => -1,
            Signal::StrongSell => -2,
            Signal::Hold | Signal::Neutral | Signal::Unavailable => 0,
        }
    }

    pub fn is_available(&self) -> bool {
        *self != Signal::Unavailable
    }

    pub fn is_bullish(&self) -> bool {
        self.score() > 0
    }

    pub fn is_bearish(&self) -> bool {
        self.score() < 0
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Signal::StrongBuy => "STRONG BUY",
            Signal::Buy => "BUY",
            Signal::Hold => "HOLD",
            Signal::Neutral => "NEUTRAL",
            Signal::Sell => "SELL",
            Signal::StrongSell => "STRONG SELL",
            Signal::Unavailable => "UNAVAILABLE",
        };
        f.write_str(label)
    }
}

/// Indicator outputs that carry their own directional signal
pub trait HasSignal {
    fn signal(&self) -> Signal;
}

/// Outcome of an indicator computation
#[derive(Debug, Clone, PartialEq)]
pub enum Computed<T> {
    /// Computed over the full requested window
    Ready(T),
    /// Computed over fewer samples than requested; a conservative stand-in
    Degraded(T),
    /// Not enough input to say anything
    Unavailable { required: usize, available: usize },
}

impl<T> Computed<T> {
    pub fn unavailable(required: usize, available: usize) -> Self {
        Computed::Unavailable {
            required,
            available,
        }
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Computed::Ready(v) | Computed::Degraded(v) => Some(v),
            Computed::Unavailable { .. } => None,
        }
    }

    /// Value only when computed over the full window
    pub fn ready(&self) -> Option<&T> {
        match self {
            Computed::Ready(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Computed::Ready(_))
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Computed::Degraded(_))
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Computed::Unavailable { .. })
    }

    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Computed<U> {
        match self {
            Computed::Ready(v) => Computed::Ready(f(v)),
            Computed::Degraded(v) => Computed::Degraded(f(v)),
            Computed::Unavailable {
                required,
                available,
            } => Computed::Unavailable {
                required,
                available,
            },
        }
    }
}

impl<T: HasSignal> Computed<T> {
    pub fn signal(&self) -> Signal {
        self.value().map_or(Signal::Unavailable, HasSignal::signal)
    }
}

/// Threshold bands for indicator signals
///
/// The defaults are the observable contract: changing any of them changes
/// which signal a given series produces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorThresholds {
    pub rsi_oversold: f64,
    pub rsi_overbought: f64,
    pub stochastic_oversold: f64,
    pub stochastic_overbought: f64,
    /// Percent distance from VWAP that counts as a directional bias
    pub vwap_deviation_pct: f64,
    pub order_flow_weak: f64,
    pub order_flow_strong: f64,
    pub wave_weak: f64,
    pub wave_strong: f64,
    pub composite_weak: f64,
    pub composite_strong: f64,
    /// Net accumulation score needed to call a Wyckoff phase
    pub wyckoff_score: i32,
    /// Below this high-low range (percent of mean) the market counts as ranging
    pub wyckoff_range_pct: f64,
    pub trend_template_strong: u32,
    pub trend_template_buy: u32,
    pub trend_template_sell: u32,
    /// Trailing window the Wyckoff score is taken over
    pub wyckoff_window: usize,
    /// Price must sit at least this multiple above the buffer low
    pub trend_template_low_multiple: f64,
    /// Price must sit within this fraction of the buffer high
    pub trend_template_high_fraction: f64,
    /// Move over the impulse window, in ATRs, that marks an order block
    pub order_block_impulse_atr: f64,
    /// Bars after a candidate block the impulse is measured over
    pub order_block_impulse_bars: usize,
    /// Mean vote per indicator needed for an overall BUY/SELL bias
    pub bias_weak: f64,
    pub bias_strong: f64,
}

impl Default for IndicatorThresholds {
    fn default() -> Self {
        Self {
            rsi_oversold: 30.0,
            rsi_overbought: 70.0,
            stochastic_oversold: 20.0,
            stochastic_overbought: 80.0,
            vwap_deviation_pct: 0.5,
            order_flow_weak: 5.0,
            order_flow_strong: 15.0,
            wave_weak: 20.0,
            wave_strong: 40.0,
            composite_weak: 20.0,
            composite_strong: 60.0,
            wyckoff_score: 10,
            wyckoff_range_pct: 5.0,
            wyckoff_window: 50,
            trend_template_low_multiple: 1.3,
            trend_template_high_fraction: 0.75,
            trend_template_strong: 7,
            trend_template_buy: 5,
            trend_template_sell: 2,
            order_block_impulse_atr: 1.5,
            order_block_impulse_bars: 3,
            bias_weak: 0.2,
            bias_strong: 0.6,
        }
    }
}

/// Map a signed score onto the five-way signal scale
pub(crate) fn graded_signal(value: f64, weak: f64, strong: f64) -> Signal {
    if value >= strong {
        Signal::StrongBuy
    } else if value >= weak {
        Signal::Buy
    } else if value <= -strong {
        Signal::StrongSell
    } else if value <= -weak {
        Signal::Sell
    } else {
        Signal::Hold
    }
}

pub(crate) fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation
pub(crate) fn std_dev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let m = mean(values);
    let variance = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

pub(crate) fn highest(values: impl Iterator<Item = f64>) -> Option<f64> {
    values.map(OrderedFloat).max().map(|v| v.into_inner())
}

pub(crate) fn lowest(values: impl Iterator<Item = f64>) -> Option<f64> {
    values.map(OrderedFloat).min().map(|v| v.into_inner())
}

/// Midpoint of the highest high and lowest low over the trailing `period` samples
pub(crate) fn range_midpoint(samples: &[Sample], period: usize) -> Option<f64> {
    let window = &samples[samples.len().saturating_sub(period)..];
    let high = highest(window.iter().map(|s| s.high))?;
    let low = lowest(window.iter().map(|s| s.low))?;
    Some((high + low) / 2.0)
}

/// True range of each sample against the previous close
///
/// Entry `i` belongs to `samples[i + 1]`. For tick samples (high == low ==
/// price) this reduces to the absolute bar-to-bar price change.
pub(crate) fn true_ranges(samples: &[Sample]) -> Vec<f64> {
    samples
        .windows(2)
        .map(|w| {
            let prev_close = w[0].price;
            let bar = &w[1];
            (bar.high - bar.low)
                .max((bar.high - prev_close).abs())
                .max((bar.low - prev_close).abs())
        })
        .collect()
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_graded_signal_bands() {
        assert_eq!(graded_signal(16.0, 5.0, 15.0), Signal::StrongBuy);
        assert_eq!(graded_signal(6.0, 5.0, 15.0), Signal::Buy);
        assert_eq!(graded_signal(0.0, 5.0, 15.0), Signal::Hold);
        assert_eq!(graded_signal(-6.0, 5.0, 15.0), Signal::Sell);
        assert_eq!(graded_signal(-15.0, 5.0, 15.0), Signal::StrongSell);
    }

    #[test]
    fn test_true_range_uses_previous_close() {
        let samples = vec![
            Sample::tick(1, 100.0, 1.0),
            Sample {
                timestamp: 2,
                price: 101.0,
                high: 102.0,
                low: 99.5,
                volume: 1.0,
            },
            Sample::tick(3, 97.0, 1.0),
        ];
        assert_eq!(true_ranges(&samples), vec![2.5, 4.0]);
    }

    #[test]
    fn test_signal_display() {
        assert_eq!(Signal::StrongSell.to_string(), "STRONG SELL");
        assert_eq!(Signal::Unavailable.to_string(), "UNAVAILABLE");
    }
}
