//! Volume-weighted indicators: VWAP, order flow imbalance, wave imbalance

use serde::{Deserialize, Serialize};

use super::{graded_signal, Computed, HasSignal, IndicatorThresholds, Signal};
use crate::history::Sample;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VwapOutput {
    pub vwap: f64,
    /// Percent distance of the latest price from VWAP
    pub deviation_pct: f64,
    pub signal: Signal,
}

impl HasSignal for VwapOutput {
    fn signal(&self) -> Signal {
        self.signal
    }
}

/// Volume-weighted average price across the whole buffer
pub fn vwap(samples: &[Sample], thresholds: &IndicatorThresholds) -> Computed<VwapOutput> {
    let Some(last) = samples.last() else {
        return Computed::unavailable(1, 0);
    };
    let (pv, volume) = samples
        .iter()
        .fold((0.0, 0.0), |(pv, v), s| (pv + s.price * s.volume, v + s.volume));
    if volume <= 0.0 {
        return Computed::unavailable(1, 0);
    }

    let vwap = pv / volume;
    let deviation_pct = (last.price - vwap) / vwap * 100.0;
    let signal = if deviation_pct > thresholds.vwap_deviation_pct {
        Signal::Buy
    } else if deviation_pct < -thresholds.vwap_deviation_pct {
        Signal::Sell
    } else {
        Signal::Hold
    };

    Computed::Ready(VwapOutput {
        vwap,
        deviation_pct,
        signal,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OrderFlowOutput {
    pub buy_volume: f64,
    pub sell_volume: f64,
    pub imbalance_pct: f64,
    pub signal: Signal,
}

impl HasSignal for OrderFlowOutput {
    fn signal(&self) -> Signal {
        self.signal
    }
}

/// Up-tick versus down-tick volume, as a percentage of total classified volume
///
/// A sample's volume counts as buying when its price rose from the previous
/// sample and selling when it fell; unchanged prices are not classified.
pub fn order_flow_imbalance(
    samples: &[Sample],
    thresholds: &IndicatorThresholds,
) -> Computed<OrderFlowOutput> {
    if samples.len() < 2 {
        return Computed::unavailable(2, samples.len());
    }

    let (buy_volume, sell_volume) =
        samples
            .windows(2)
            .fold((0.0, 0.0), |(buy, sell), w| match w[1].price.partial_cmp(&w[0].price) {
                Some(std::cmp::Ordering::Greater) => (buy + w[1].volume, sell),
                Some(std::cmp::Ordering::Less) => (buy, sell + w[1].volume),
                _ => (buy, sell),
            });

    let total = buy_volume + sell_volume;
    if total <= 0.0 {
        return Computed::unavailable(2, samples.len());
    }

    let imbalance_pct = (buy_volume - sell_volume) / total * 100.0;
    Computed::Ready(OrderFlowOutput {
        buy_volume,
        sell_volume,
        imbalance_pct,
        signal: graded_signal(
            imbalance_pct,
            thresholds.order_flow_weak,
            thresholds.order_flow_strong,
        ),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WaveOutput {
    pub up_volume: f64,
    pub down_volume: f64,
    pub imbalance_pct: f64,
    /// Waves included in the tally
    pub waves: usize,
    /// Direction of the wave still in progress
    pub rising: bool,
    pub signal: Signal,
}

impl HasSignal for WaveOutput {
    fn signal(&self) -> Signal {
        self.signal
    }
}

/// Cumulative volume of the last `max_waves` up- and down-waves
///
/// A wave is a run of price changes in one direction; unchanged prices extend
/// the current wave.
pub fn wave_imbalance(
    samples: &[Sample],
    max_waves: usize,
    thresholds: &IndicatorThresholds,
) -> Computed<WaveOutput> {
    // (rising, volume)
    let mut waves: Vec<(bool, f64)> = Vec::new();
    for w in samples.windows(2) {
        let delta = w[1].price - w[0].price;
        let extends = waves
            .last()
            .map_or(false, |(rising, _)| delta == 0.0 || (delta > 0.0) == *rising);
        if extends {
            if let Some((_, volume)) = waves.last_mut() {
                *volume += w[1].volume;
            }
        } else if delta != 0.0 {
            waves.push((delta > 0.0, w[1].volume));
        }
    }

    let Some(&(rising, _)) = waves.last() else {
        return Computed::unavailable(2, samples.len());
    };

    let recent = &waves[waves.len().saturating_sub(max_waves.max(1))..];
    let (up_volume, down_volume) = recent.iter().fold((0.0, 0.0), |(up, down), (r, v)| {
        if *r {
            (up + v, down)
        } else {
            (up, down + v)
        }
    });
    let total = up_volume + down_volume;
    if total <= 0.0 {
        return Computed::unavailable(2, samples.len());
    }

    let imbalance_pct = (up_volume - down_volume) / total * 100.0;
    Computed::Ready(WaveOutput {
        up_volume,
        down_volume,
        imbalance_pct,
        waves: recent.len(),
        rising,
        signal: graded_signal(imbalance_pct, thresholds.wave_weak, thresholds.wave_strong),
    })
}
