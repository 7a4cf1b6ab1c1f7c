//! Heuristic composites built from price/volume co-movement
//!
//! These are threshold-tuned scores, not canonical formulas. The thresholds
//! live in [`IndicatorThresholds`] and define the observable output.

use serde::{Deserialize, Serialize};

use super::{
    atr, graded_signal, highest, lowest, mean, BollingerOutput, Computed, HasSignal,
    IndicatorThresholds, MacdOutput, RsiOutput, Signal, StochasticOutput,
};
use crate::history::Sample;

const WYCKOFF_MIN_SAMPLES: usize = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WyckoffPhase {
    Accumulation,
    Markup,
    Distribution,
    Markdown,
    Neutral,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WyckoffOutput {
    pub score: i32,
    /// High-low range of the window as a percentage of its mean price
    pub range_pct: f64,
    pub phase: WyckoffPhase,
    pub signal: Signal,
}

impl HasSignal for WyckoffOutput {
    fn signal(&self) -> Signal {
        self.signal
    }
}

/// Accumulation/distribution score over the trailing window
///
/// Per bar, against the window's average volume:
/// - up on heavy volume: +2 (demand)
/// - down on heavy volume: -2 (supply)
/// - down on light volume: +1 (no supply)
/// - up on light volume: -1 (no demand)
///
/// A strong positive score in a tight range is accumulation, outside a tight
/// range markup; mirrored for distribution and markdown.
pub fn wyckoff(samples: &[Sample], thresholds: &IndicatorThresholds) -> Computed<WyckoffOutput> {
    if samples.len() < WYCKOFF_MIN_SAMPLES {
        return Computed::unavailable(WYCKOFF_MIN_SAMPLES, samples.len());
    }
    let window = &samples[samples.len().saturating_sub(thresholds.wyckoff_window)..];
    let volumes: Vec<f64> = window.iter().map(|s| s.volume).collect();
    let avg_volume = mean(&volumes);

    let score: i32 = window
        .windows(2)
        .map(|w| {
            let delta = w[1].price - w[0].price;
            let heavy = w[1].volume > avg_volume;
            match (delta > 0.0, delta < 0.0, heavy) {
                (true, _, true) => 2,
                (_, true, true) => -2,
                (_, true, false) => 1,
                (true, _, false) => -1,
                _ => 0,
            }
        })
        .sum();

    let prices: Vec<f64> = window.iter().map(|s| s.price).collect();
    let mean_price = mean(&prices);
    let high = highest(prices.iter().copied()).unwrap_or(mean_price);
    let low = lowest(prices.iter().copied()).unwrap_or(mean_price);
    let range_pct = if mean_price > 0.0 {
        (high - low) / mean_price * 100.0
    } else {
        0.0
    };
    let ranging = range_pct < thresholds.wyckoff_range_pct;

    let phase = if score >= thresholds.wyckoff_score {
        if ranging {
            WyckoffPhase::Accumulation
        } else {
            WyckoffPhase::Markup
        }
    } else if score <= -thresholds.wyckoff_score {
        if ranging {
            WyckoffPhase::Distribution
        } else {
            WyckoffPhase::Markdown
        }
    } else {
        WyckoffPhase::Neutral
    };
    let signal = match phase {
        WyckoffPhase::Accumulation | WyckoffPhase::Markup => Signal::Buy,
        WyckoffPhase::Distribution | WyckoffPhase::Markdown => Signal::Sell,
        WyckoffPhase::Neutral => Signal::Hold,
    };

    let output = WyckoffOutput {
        score,
        range_pct,
        phase,
        signal,
    };
    if samples.len() >= thresholds.wyckoff_window {
        Computed::Ready(output)
    } else {
        Computed::Degraded(output)
    }
}

/// Oscillator readings the composite votes over
pub struct OscillatorInputs<'a> {
    pub rsi: &'a Computed<RsiOutput>,
    pub stochastic: &'a Computed<StochasticOutput>,
    pub bollinger: &'a Computed<BollingerOutput>,
    pub macd: &'a Computed<MacdOutput>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompositeOutput {
    /// Mean of the component votes scaled to -100..=100
    pub score: f64,
    pub components: usize,
    pub signal: Signal,
}

impl HasSignal for CompositeOutput {
    fn signal(&self) -> Signal {
        self.signal
    }
}

/// Multi-oscillator composite
///
/// RSI, %K and %B vote contrarian (oversold is positive), MACD votes with its
/// histogram sign. Each vote is in -1..=1; only fully computed components
/// take part.
pub fn oscillator_composite(
    inputs: &OscillatorInputs<'_>,
    thresholds: &IndicatorThresholds,
) -> Computed<CompositeOutput> {
    let mut votes = Vec::with_capacity(4);
    if let Some(r) = inputs.rsi.ready() {
        votes.push((50.0 - r.value) / 50.0);
    }
    if let Some(s) = inputs.stochastic.ready() {
        votes.push((50.0 - s.k) / 50.0);
    }
    if let Some(b) = inputs.bollinger.ready() {
        votes.push(((0.5 - b.percent_b) * 2.0).clamp(-1.0, 1.0));
    }
    if let Some(m) = inputs.macd.ready() {
        votes.push(if m.histogram > 0.0 {
            1.0
        } else if m.histogram < 0.0 {
            -1.0
        } else {
            0.0
        });
    }

    if votes.is_empty() {
        return match inputs.rsi {
            Computed::Unavailable {
                required,
                available,
            } => Computed::unavailable(*required, *available),
            _ => Computed::unavailable(0, 0),
        };
    }

    let score = mean(&votes) * 100.0;
    Computed::Ready(CompositeOutput {
        score,
        components: votes.len(),
        signal: graded_signal(score, thresholds.composite_weak, thresholds.composite_strong),
    })
}

const ORDER_BLOCK_MIN_SAMPLES: usize = 20;
const ORDER_BLOCK_ATR_PERIOD: usize = 14;

/// Price zone of the last opposing bar before an impulsive move
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OrderBlock {
    pub timestamp: i64,
    pub low: f64,
    pub high: f64,
}

impl OrderBlock {
    fn contains(&self, price: f64) -> bool {
        price >= self.low && price <= self.high
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OrderBlockOutput {
    pub bullish: Option<OrderBlock>,
    pub bearish: Option<OrderBlock>,
    pub signal: Signal,
}

impl HasSignal for OrderBlockOutput {
    fn signal(&self) -> Signal {
        self.signal
    }
}

/// Structural order-block detection
///
/// A down bar followed within `order_block_impulse_bars` bars by a rise of at least
/// `order_block_impulse_atr` ATRs marks a bullish block; an up bar followed by
/// an equally sharp drop marks a bearish one. The most recent block of each
/// kind is kept. Price trading back inside a bullish block reads BUY, inside a
/// bearish block SELL.
pub fn order_blocks(
    samples: &[Sample],
    thresholds: &IndicatorThresholds,
) -> Computed<OrderBlockOutput> {
    if samples.len() < ORDER_BLOCK_MIN_SAMPLES {
        return Computed::unavailable(ORDER_BLOCK_MIN_SAMPLES, samples.len());
    }
    let range = atr(samples, ORDER_BLOCK_ATR_PERIOD)
        .value()
        .copied()
        .unwrap_or(0.0);
    let impulse = range * thresholds.order_block_impulse_atr;
    let bars = thresholds.order_block_impulse_bars.max(1);

    let mut bullish = None;
    let mut bearish = None;
    if impulse > 0.0 {
        for i in 1..samples.len().saturating_sub(bars) {
            let prev = &samples[i - 1];
            let bar = &samples[i];
            let moved = samples[i + bars].price - bar.price;
            let block = OrderBlock {
                timestamp: bar.timestamp,
                low: bar.low.min(prev.price),
                high: bar.high.max(prev.price),
            };
            if bar.price < prev.price && moved >= impulse {
                bullish = Some(block);
            } else if bar.price > prev.price && moved <= -impulse {
                bearish = Some(block);
            }
        }
    }

    let price = samples[samples.len() - 1].price;
    let in_bullish = bullish.map_or(false, |b: OrderBlock| b.contains(price));
    let in_bearish = bearish.map_or(false, |b: OrderBlock| b.contains(price));
    let signal = match (in_bullish, in_bearish) {
        (true, false) => Signal::Buy,
        (false, true) => Signal::Sell,
        _ => Signal::Hold,
    };

    Computed::Ready(OrderBlockOutput {
        bullish,
        bearish,
        signal,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::test_support::{ramp, ticks};
    use crate::indicators::{bollinger, macd, rsi, stochastic};

    fn bar(t: i64, price: f64, volume: f64) -> Sample {
        Sample::tick(t, price, volume)
    }

    #[test]
    fn test_wyckoff_accumulation_in_tight_range() {
        // rises on heavy volume, dips on light volume, inside a ~2% range
        let samples: Vec<Sample> = (0..50)
            .map(|i| {
                if i % 2 == 0 {
                    bar(i, 100.0, 1.0)
                } else {
                    bar(i, 101.0, 10.0)
                }
            })
            .collect();
        let out = *wyckoff(&samples, &IndicatorThresholds::default())
            .ready()
            .unwrap();
        assert!(out.score >= 10);
        assert_eq!(out.phase, WyckoffPhase::Accumulation);
        assert_eq!(out.signal, Signal::Buy);
    }

    #[test]
    fn test_wyckoff_markdown_on_heavy_selling() {
        let samples: Vec<Sample> = (0..50)
            .map(|i| bar(i, 200.0 - i as f64, if i % 2 == 0 { 10.0 } else { 1.0 }))
            .collect();
        let out = *wyckoff(&samples, &IndicatorThresholds::default())
            .ready()
            .unwrap();
        assert_eq!(out.phase, WyckoffPhase::Markdown);
        assert_eq!(out.signal, Signal::Sell);
    }

    #[test]
    fn test_wyckoff_short_buffer() {
        let samples = ticks(&ramp(20, 100.0, 1.0));
        assert!(wyckoff(&samples, &IndicatorThresholds::default()).is_unavailable());
        let samples = ticks(&ramp(40, 100.0, 1.0));
        assert!(wyckoff(&samples, &IndicatorThresholds::default()).is_degraded());
    }

    #[test]
    fn test_oscillator_composite_counts_only_ready_components() {
        let thresholds = IndicatorThresholds::default();
        let prices = ramp(20, 100.0, -1.0);
        let samples = ticks(&prices);
        let r = rsi(&prices, 14, &thresholds);
        let s = stochastic(&samples, 14, 3, &thresholds);
        let b = bollinger(&prices, 20, 2.0);
        let m = macd(&prices, 12, 26, 9);
        let out = oscillator_composite(
            &OscillatorInputs {
                rsi: &r,
                stochastic: &s,
                bollinger: &b,
                macd: &m,
            },
            &thresholds,
        );
        let value = out.ready().unwrap();
        // macd unavailable at 20 samples
        assert_eq!(value.components, 3);
        // steady decline is oversold on every oscillator
        assert!(value.score >= 60.0);
        assert_eq!(value.signal, Signal::StrongBuy);
    }

    #[test]
    fn test_oscillator_composite_unavailable_without_inputs() {
        let thresholds = IndicatorThresholds::default();
        let prices = [100.0, 101.0];
        let r = rsi(&prices, 14, &thresholds);
        let s = stochastic(&ticks(&prices), 14, 3, &thresholds);
        let b = bollinger(&prices, 20, 2.0);
        let m = macd(&prices, 12, 26, 9);
        let out = oscillator_composite(
            &OscillatorInputs {
                rsi: &r,
                stochastic: &s,
                bollinger: &b,
                macd: &m,
            },
            &thresholds,
        );
        assert_eq!(
            out,
            Computed::Unavailable {
                required: 15,
                available: 2
            }
        );
    }

    #[test]
    fn test_order_block_retest_reads_buy() {
        // quiet drift, a down bar, a sharp rally, then price returns to the down bar
        let mut prices = vec![100.0, 100.2].repeat(10);
        prices.extend([99.5, 102.0, 104.0, 106.0, 104.0, 101.0, 99.8]);
        let out = *order_blocks(&ticks(&prices), &IndicatorThresholds::default())
            .ready()
            .unwrap();
        let block = out.bullish.unwrap();
        assert_eq!(block.timestamp, 21);
        assert!(block.contains(99.8));
        assert_eq!(out.signal, Signal::Buy);
    }

    #[test]
    fn test_order_blocks_need_twenty_samples() {
        let samples = ticks(&ramp(10, 100.0, 1.0));
        assert!(order_blocks(&samples, &IndicatorThresholds::default()).is_unavailable());
    }
}
