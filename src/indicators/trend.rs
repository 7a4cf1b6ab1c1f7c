//! Trend structure: Ichimoku cloud, Elder ray, trend template

use serde::{Deserialize, Serialize};

use super::{
    ema_series, highest, lowest, range_midpoint, rsi, sma, Computed, HasSignal,
    IndicatorThresholds, Signal,
};
use crate::history::Sample;

const TENKAN_PERIOD: usize = 9;
const KIJUN_PERIOD: usize = 26;
const SENKOU_B_PERIOD: usize = 52;

/// Where the latest price sits relative to the cloud
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloudPosition {
    Above,
    Inside,
    Below,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IchimokuOutput {
    pub conversion: f64,
    pub base: f64,
    pub span_a: f64,
    pub span_b: f64,
    pub cloud_top: f64,
    pub cloud_bottom: f64,
    pub position: CloudPosition,
    pub signal: Signal,
}

impl HasSignal for IchimokuOutput {
    fn signal(&self) -> Signal {
        self.signal
    }
}

/// Ichimoku cloud over 9/26/52 sample windows
///
/// Price above the cloud with conversion over base is STRONG BUY, above the
/// cloud otherwise BUY; mirrored below. Inside the cloud is NEUTRAL.
pub fn ichimoku(samples: &[Sample]) -> Computed<IchimokuOutput> {
    if samples.len() < SENKOU_B_PERIOD {
        return Computed::unavailable(SENKOU_B_PERIOD, samples.len());
    }
    let (Some(conversion), Some(base), Some(span_b), Some(last)) = (
        range_midpoint(samples, TENKAN_PERIOD),
        range_midpoint(samples, KIJUN_PERIOD),
        range_midpoint(samples, SENKOU_B_PERIOD),
        samples.last(),
    ) else {
        return Computed::unavailable(SENKOU_B_PERIOD, samples.len());
    };

    let span_a = (conversion + base) / 2.0;
    let cloud_top = span_a.max(span_b);
    let cloud_bottom = span_a.min(span_b);

    let (position, signal) = if last.price > cloud_top {
        let signal = if conversion > base {
            Signal::StrongBuy
        } else {
            Signal::Buy
        };
        (CloudPosition::Above, signal)
    } else if last.price < cloud_bottom {
        let signal = if conversion < base {
            Signal::StrongSell
        } else {
            Signal::Sell
        };
        (CloudPosition::Below, signal)
    } else {
        (CloudPosition::Inside, Signal::Neutral)
    };

    Computed::Ready(IchimokuOutput {
        conversion,
        base,
        span_a,
        span_b,
        cloud_top,
        cloud_bottom,
        position,
        signal,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElderState {
    /// Both powers positive: buyers hold price above the EMA
    Bullish,
    /// Both powers negative
    Bearish,
    Balanced,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ElderRayOutput {
    pub ema: f64,
    pub bull_power: f64,
    pub bear_power: f64,
    pub ema_rising: bool,
    pub state: ElderState,
    pub signal: Signal,
}

impl HasSignal for ElderRayOutput {
    fn signal(&self) -> Signal {
        self.signal
    }
}

/// Elder ray: high and low of the latest sample measured against an EMA
pub fn elder_ray(samples: &[Sample], period: usize) -> Computed<ElderRayOutput> {
    let period = period.max(1);
    if samples.len() < period + 1 {
        return Computed::unavailable(period + 1, samples.len());
    }
    let prices: Vec<f64> = samples.iter().map(|s| s.price).collect();
    let series = ema_series(&prices, period);
    let (Some(&ema), Some(last)) = (series.last(), samples.last()) else {
        return Computed::unavailable(period + 1, samples.len());
    };
    let ema_rising = series.len() >= 2 && ema > series[series.len() - 2];

    let bull_power = last.high - ema;
    let bear_power = last.low - ema;
    let (state, signal) = if bull_power > 0.0 && bear_power > 0.0 {
        (ElderState::Bullish, Signal::Buy)
    } else if bull_power < 0.0 && bear_power < 0.0 {
        (ElderState::Bearish, Signal::Sell)
    } else {
        (ElderState::Balanced, Signal::Hold)
    };

    Computed::Ready(ElderRayOutput {
        ema,
        bull_power,
        bear_power,
        ema_rising,
        state,
        signal,
    })
}

/// The eight trend-template checks, in scoring order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TrendCriteria {
    pub above_150_and_200: bool,
    pub ma150_above_ma200: bool,
    pub ma200_rising: bool,
    pub ma50_above_150_and_200: bool,
    pub above_50: bool,
    pub well_off_low: bool,
    pub near_high: bool,
    pub relative_strength: bool,
}

impl TrendCriteria {
    pub fn score(&self) -> u32 {
        [
            self.above_150_and_200,
            self.ma150_above_ma200,
            self.ma200_rising,
            self.ma50_above_150_and_200,
            self.above_50,
            self.well_off_low,
            self.near_high,
            self.relative_strength,
        ]
        .iter()
        .filter(|passed| **passed)
        .count() as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrendTemplateOutput {
    pub score: u32,
    pub max_score: u32,
    pub criteria: TrendCriteria,
    pub signal: Signal,
}

impl HasSignal for TrendTemplateOutput {
    fn signal(&self) -> Signal {
        self.signal
    }
}

const TEMPLATE_LONG: usize = 200;
const TEMPLATE_MID: usize = 150;
const TEMPLATE_SHORT: usize = 50;
/// Lookback for the long average's slope
const TEMPLATE_SLOPE: usize = 20;

/// Stage-two trend template scored out of eight
///
/// Needs a full 200-sample window. The slope check compares the 200-sample
/// average with the one up to 20 samples earlier and fails when there is no
/// earlier window to compare against.
pub fn trend_template(
    samples: &[Sample],
    thresholds: &IndicatorThresholds,
) -> Computed<TrendTemplateOutput> {
    if samples.len() < TEMPLATE_LONG {
        return Computed::unavailable(TEMPLATE_LONG, samples.len());
    }
    let prices: Vec<f64> = samples.iter().map(|s| s.price).collect();
    let price = prices[prices.len() - 1];

    let (Some(&ma50), Some(&ma150), Some(&ma200)) = (
        sma(&prices, TEMPLATE_SHORT).ready(),
        sma(&prices, TEMPLATE_MID).ready(),
        sma(&prices, TEMPLATE_LONG).ready(),
    ) else {
        return Computed::unavailable(TEMPLATE_LONG, samples.len());
    };

    let shift = TEMPLATE_SLOPE.min(prices.len() - TEMPLATE_LONG);
    let ma200_rising = shift > 0
        && sma(&prices[..prices.len() - shift], TEMPLATE_LONG)
            .ready()
            .map_or(false, |earlier| ma200 > *earlier);

    let low = lowest(prices.iter().copied()).unwrap_or(price);
    let high = highest(prices.iter().copied()).unwrap_or(price);
    let strength = rsi(&prices, 14, thresholds)
        .ready()
        .map_or(false, |r| r.value > 50.0);

    let criteria = TrendCriteria {
        above_150_and_200: price > ma150 && price > ma200,
        ma150_above_ma200: ma150 > ma200,
        ma200_rising,
        ma50_above_150_and_200: ma50 > ma150 && ma50 > ma200,
        above_50: price > ma50,
        well_off_low: price >= low * thresholds.trend_template_low_multiple,
        near_high: price >= high * thresholds.trend_template_high_fraction,
        relative_strength: strength,
    };
    let score = criteria.score();

    let signal = if score >= thresholds.trend_template_strong {
        Signal::StrongBuy
    } else if score >= thresholds.trend_template_buy {
        Signal::Buy
    } else if score <= thresholds.trend_template_sell {
        Signal::Sell
    } else {
        Signal::Hold
    };

    Computed::Ready(TrendTemplateOutput {
        score,
        max_score: 8,
        criteria,
        signal,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::test_support::{ramp, ticks};

    #[test]
    fn test_ichimoku_needs_52_samples() {
        let samples = ticks(&ramp(10, 100.0, 1.0));
        let out = ichimoku(&samples);
        assert_eq!(
            out,
            Computed::Unavailable {
                required: 52,
                available: 10
            }
        );
        assert_eq!(out.signal(), Signal::Unavailable);
    }

    #[test]
    fn test_ichimoku_strong_buy_in_uptrend() {
        let samples = ticks(&ramp(60, 100.0, 1.0));
        let out = *ichimoku(&samples).ready().unwrap();
        assert_eq!(out.position, CloudPosition::Above);
        assert!(out.conversion > out.base);
        assert_eq!(out.signal, Signal::StrongBuy);
    }

    #[test]
    fn test_ichimoku_strong_sell_in_downtrend() {
        let samples = ticks(&ramp(60, 200.0, -1.0));
        assert_eq!(ichimoku(&samples).signal(), Signal::StrongSell);
    }

    #[test]
    fn test_elder_ray_states() {
        let up = ticks(&ramp(20, 100.0, 1.0));
        assert_eq!(elder_ray(&up, 13).ready().unwrap().state, ElderState::Bullish);
        let down = ticks(&ramp(20, 100.0, -1.0));
        let out = *elder_ray(&down, 13).ready().unwrap();
        assert_eq!(out.state, ElderState::Bearish);
        assert!(!out.ema_rising);
    }

    #[test]
    fn test_trend_template_requires_200() {
        let samples = ticks(&ramp(150, 100.0, 1.0));
        assert!(trend_template(&samples, &IndicatorThresholds::default()).is_unavailable());
    }

    #[test]
    fn test_trend_template_full_score_in_steady_uptrend() {
        let samples = ticks(&ramp(260, 100.0, 1.0));
        let out = *trend_template(&samples, &IndicatorThresholds::default())
            .ready()
            .unwrap();
        assert_eq!(out.score, 8);
        assert_eq!(out.signal, Signal::StrongBuy);
    }

    #[test]
    fn test_trend_template_low_multiple_is_configurable() {
        // the ramp ends 3.59x above its low
        let samples = ticks(&ramp(260, 100.0, 1.0));
        let thresholds = IndicatorThresholds {
            trend_template_low_multiple: 4.0,
            ..IndicatorThresholds::default()
        };
        let out = *trend_template(&samples, &thresholds).ready().unwrap();
        assert!(!out.criteria.well_off_low);
        assert_eq!(out.score, 7);
        assert_eq!(out.signal, Signal::StrongBuy);
    }

    #[test]
    fn test_trend_template_scores_low_in_downtrend() {
        let samples = ticks(&ramp(260, 400.0, -1.0));
        let out = *trend_template(&samples, &IndicatorThresholds::default())
            .ready()
            .unwrap();
        assert!(out.score <= 2);
        assert_eq!(out.signal, Signal::Sell);
    }
}
