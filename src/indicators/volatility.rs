//! Volatility bands: ATR, Bollinger, Keltner, Supertrend

use serde::{Deserialize, Serialize};

use super::{ema, mean, std_dev, true_ranges, Computed, HasSignal, Signal};
use crate::history::Sample;

/// Average true range over the last `period` bars
///
/// Needs `period + 1` samples for a full window; with at least two samples
/// the mean of whatever ranges exist is returned as `Degraded`.
pub fn atr(samples: &[Sample], period: usize) -> Computed<f64> {
    let period = period.max(1);
    let ranges = true_ranges(samples);
    if ranges.is_empty() {
        return Computed::unavailable(period + 1, samples.len());
    }
    let window = &ranges[ranges.len().saturating_sub(period)..];
    if ranges.len() >= period {
        Computed::Ready(mean(window))
    } else {
        Computed::Degraded(mean(window))
    }
}

/// Where the latest price sits relative to Bollinger bands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BandPosition {
    AboveUpper,
    UpperHalf,
    LowerHalf,
    BelowLower,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BollingerOutput {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
    pub percent_b: f64,
    /// Band width as a percentage of the middle band
    pub bandwidth: f64,
    pub position: BandPosition,
    pub signal: Signal,
}

impl HasSignal for BollingerOutput {
    fn signal(&self) -> Signal {
        self.signal
    }
}

/// Bollinger bands: SMA ± `k` population standard deviations
pub fn bollinger(prices: &[f64], period: usize, k: f64) -> Computed<BollingerOutput> {
    let period = period.max(1);
    let Some(&price) = prices.last() else {
        return Computed::unavailable(period, 0);
    };
    if prices.len() < period {
        return Computed::unavailable(period, prices.len());
    }

    let window = &prices[prices.len() - period..];
    let middle = mean(window);
    let deviation = std_dev(window);
    let upper = middle + k * deviation;
    let lower = middle - k * deviation;

    let position = if price > upper {
        BandPosition::AboveUpper
    } else if price >= middle {
        BandPosition::UpperHalf
    } else if price >= lower {
        BandPosition::LowerHalf
    } else {
        BandPosition::BelowLower
    };

    let width = upper - lower;
    let percent_b = if width > 0.0 {
        (price - lower) / width
    } else {
        0.5
    };
    let bandwidth = if middle != 0.0 {
        width / middle * 100.0
    } else {
        0.0
    };

    let signal = match position {
        BandPosition::BelowLower => Signal::Buy,
        BandPosition::AboveUpper => Signal::Sell,
        _ => Signal::Hold,
    };

    Computed::Ready(BollingerOutput {
        upper,
        middle,
        lower,
        percent_b,
        bandwidth,
        position,
        signal,
    })
}

/// Where the latest price sits relative to an envelope channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelPosition {
    Above,
    Inside,
    Below,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KeltnerOutput {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
    pub position: ChannelPosition,
    pub signal: Signal,
}

impl HasSignal for KeltnerOutput {
    fn signal(&self) -> Signal {
        self.signal
    }
}

/// Keltner channel: EMA middle line ± `multiplier` ATRs
///
/// A close outside the channel is read as a breakout in that direction.
pub fn keltner(
    samples: &[Sample],
    ema_period: usize,
    atr_period: usize,
    multiplier: f64,
) -> Computed<KeltnerOutput> {
    let ema_period = ema_period.max(1);
    let Some(last) = samples.last() else {
        return Computed::unavailable(ema_period, 0);
    };
    let prices: Vec<f64> = samples.iter().map(|s| s.price).collect();
    let Some(&middle) = ema(&prices, ema_period).ready() else {
        return Computed::unavailable(ema_period, samples.len());
    };
    let range = atr(samples, atr_period).value().copied().unwrap_or(0.0);

    let upper = middle + multiplier * range;
    let lower = middle - multiplier * range;
    let (position, signal) = if last.price > upper {
        (ChannelPosition::Above, Signal::Buy)
    } else if last.price < lower {
        (ChannelPosition::Below, Signal::Sell)
    } else {
        (ChannelPosition::Inside, Signal::Hold)
    };

    Computed::Ready(KeltnerOutput {
        upper,
        middle,
        lower,
        position,
        signal,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Up,
    Down,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SupertrendOutput {
    pub upper: f64,
    pub lower: f64,
    /// The active line: lower band in an uptrend, upper band in a downtrend
    pub value: f64,
    pub trend: TrendDirection,
    /// Trend changed on the latest bar
    pub flipped: bool,
    pub signal: Signal,
}

impl HasSignal for SupertrendOutput {
    fn signal(&self) -> Signal {
        self.signal
    }
}

/// Supertrend with ratcheting final bands
///
/// Rolls forward from the first bar with a full ATR window. Bands only
/// tighten while price stays on their side; the trend flips when the close
/// crosses the opposite band.
pub fn supertrend(samples: &[Sample], period: usize, multiplier: f64) -> Computed<SupertrendOutput> {
    let period = period.max(1);
    if samples.len() < period + 1 {
        return Computed::unavailable(period + 1, samples.len());
    }

    let ranges = true_ranges(samples);
    let mut final_upper = 0.0;
    let mut final_lower = 0.0;
    let mut trend = TrendDirection::Up;
    let mut flipped = false;

    for i in period..samples.len() {
        let bar = &samples[i];
        // ranges[i - period..i] covers samples[i - period + 1..=i]
        let range = mean(&ranges[i - period..i]);
        let hl2 = (bar.high + bar.low) / 2.0;
        let basic_upper = hl2 + multiplier * range;
        let basic_lower = hl2 - multiplier * range;

        if i == period {
            final_upper = basic_upper;
            final_lower = basic_lower;
            trend = if bar.price >= hl2 {
                TrendDirection::Up
            } else {
                TrendDirection::Down
            };
            continue;
        }

        let prev_close = samples[i - 1].price;
        if basic_upper < final_upper || prev_close > final_upper {
            final_upper = basic_upper;
        }
        if basic_lower > final_lower || prev_close < final_lower {
            final_lower = basic_lower;
        }

        let next = match trend {
            TrendDirection::Up if bar.price < final_lower => TrendDirection::Down,
            TrendDirection::Down if bar.price > final_upper => TrendDirection::Up,
            current => current,
        };
        flipped = next != trend;
        trend = next;
    }

    let (value, signal) = match trend {
        TrendDirection::Up => (final_lower, Signal::Buy),
        TrendDirection::Down => (final_upper, Signal::Sell),
    };

    Computed::Ready(SupertrendOutput {
        upper: final_upper,
        lower: final_lower,
        value,
        trend,
        flipped,
        signal,
    })
}
