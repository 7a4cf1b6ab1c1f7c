//! Signal aggregation
//!
//! Runs the full indicator battery over one history snapshot and publishes
//! the result as a single immutable report.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

use crate::history::HistorySnapshot;
use crate::indicators::{
    self, BollingerOutput, CompositeOutput, Computed, ElderRayOutput, HasSignal, IchimokuOutput,
    IndicatorThresholds, KeltnerOutput, MacdOutput, OrderBlockOutput, OrderFlowOutput,
    OscillatorInputs, RsiOutput, Signal, StochasticOutput, SupertrendOutput, TrendTemplateOutput,
    VwapOutput, WaveOutput, WyckoffOutput,
};

/// Value half of a reading: a number or an indicator-specific record
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum IndicatorValue {
    Scalar(f64),
    Rsi(RsiOutput),
    Macd(MacdOutput),
    Bollinger(BollingerOutput),
    Stochastic(StochasticOutput),
    Vwap(VwapOutput),
    OrderFlow(OrderFlowOutput),
    Ichimoku(IchimokuOutput),
    Supertrend(SupertrendOutput),
    ElderRay(ElderRayOutput),
    Keltner(KeltnerOutput),
    Wyckoff(WyckoffOutput),
    TrendTemplate(TrendTemplateOutput),
    Composite(CompositeOutput),
    Waves(WaveOutput),
    OrderBlocks(OrderBlockOutput),
    Unavailable { required: usize, available: usize },
}

macro_rules! impl_from_output {
    ($($output:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$output> for IndicatorValue {
                fn from(output: $output) -> Self {
                    IndicatorValue::$variant(output)
                }
            }
        )*
    };
}

impl_from_output!(
    f64 => Scalar,
    RsiOutput => Rsi,
    MacdOutput => Macd,
    BollingerOutput => Bollinger,
    StochasticOutput => Stochastic,
    VwapOutput => Vwap,
    OrderFlowOutput => OrderFlow,
    IchimokuOutput => Ichimoku,
    SupertrendOutput => Supertrend,
    ElderRayOutput => ElderRay,
    KeltnerOutput => Keltner,
    WyckoffOutput => Wyckoff,
    TrendTemplateOutput => TrendTemplate,
    CompositeOutput => Composite,
    WaveOutput => Waves,
    OrderBlockOutput => OrderBlocks,
);

/// One indicator's entry in a report
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    pub value: IndicatorValue,
    pub signal: Signal,
    /// Computed over a shorter window than the indicator asks for
    pub degraded: bool,
}

impl Reading {
    fn from_computed<T>(computed: Computed<T>, signal: impl FnOnce(&T) -> Signal) -> Self
    where
        T: Into<IndicatorValue>,
    {
        match computed {
            Computed::Ready(v) => Self {
                signal: signal(&v),
                value: v.into(),
                degraded: false,
            },
            Computed::Degraded(v) => Self {
                signal: signal(&v),
                value: v.into(),
                degraded: true,
            },
            Computed::Unavailable {
                required,
                available,
            } => Self {
                value: IndicatorValue::Unavailable {
                    required,
                    available,
                },
                signal: Signal::Unavailable,
                degraded: false,
            },
        }
    }

    fn with_signal<T>(computed: Computed<T>) -> Self
    where
        T: Into<IndicatorValue> + HasSignal,
    {
        Self::from_computed(computed, HasSignal::signal)
    }
}

/// Overall directional bias voted from the individual readings
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Bias {
    pub signal: Signal,
    /// Mean vote per available reading, in -2..=2
    pub score: f64,
    /// Share of available readings that agree with `signal`, in 0..=1
    pub confidence: f64,
    pub bullish: usize,
    pub bearish: usize,
    pub neutral: usize,
}

impl Bias {
    fn unavailable() -> Self {
        Self {
            signal: Signal::Unavailable,
            score: 0.0,
            confidence: 0.0,
            bullish: 0,
            bearish: 0,
            neutral: 0,
        }
    }
}

/// Atomic snapshot of every indicator for one instrument
#[derive(Debug, Clone, Serialize)]
pub struct IndicatorReport {
    pub instrument: String,
    pub sample_count: usize,
    pub last_price: Option<f64>,
    pub last_timestamp: Option<i64>,
    pub computed_at: DateTime<Utc>,
    pub readings: BTreeMap<String, Reading>,
    pub bias: Bias,
}

impl IndicatorReport {
    /// Report with no readings, used before the first history arrives
    pub fn empty(instrument: &str) -> Self {
        Self {
            instrument: instrument.to_string(),
            sample_count: 0,
            last_price: None,
            last_timestamp: None,
            computed_at: Utc::now(),
            readings: BTreeMap::new(),
            bias: Bias::unavailable(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Reading> {
        self.readings.get(name)
    }

    pub fn signal(&self, name: &str) -> Signal {
        self.get(name).map_or(Signal::Unavailable, |r| r.signal)
    }
}

/// Signal for price relative to a moving average
fn price_vs(price: f64, average: f64) -> Signal {
    if price > average {
        Signal::Buy
    } else if price < average {
        Signal::Sell
    } else {
        Signal::Hold
    }
}

/// Equal-weight vote over every available reading
///
/// Each reading contributes its signal score (STRONG ±2, plain ±1, else 0);
/// the mean over available readings is graded with `bias_weak`/`bias_strong`.
pub fn vote(readings: &BTreeMap<String, Reading>, thresholds: &IndicatorThresholds) -> Bias {
    let available: Vec<Signal> = readings
        .values()
        .map(|r| r.signal)
        .filter(Signal::is_available)
        .collect();
    if available.is_empty() {
        return Bias::unavailable();
    }

    let total: i32 = available.iter().map(Signal::score).sum();
    let score = total as f64 / available.len() as f64;
    let bullish = available.iter().filter(|s| s.is_bullish()).count();
    let bearish = available.iter().filter(|s| s.is_bearish()).count();
    let neutral = available.len() - bullish - bearish;

    let signal = indicators::graded_signal(score, thresholds.bias_weak, thresholds.bias_strong);
    let agreeing = if signal.is_bullish() {
        bullish
    } else if signal.is_bearish() {
        bearish
    } else {
        neutral
    };

    Bias {
        signal,
        score,
        confidence: agreeing as f64 / available.len() as f64,
        bullish,
        bearish,
        neutral,
    }
}

/// Computes indicator reports and publishes the latest one
pub struct SignalAggregator {
    thresholds: IndicatorThresholds,
    latest: watch::Sender<Arc<IndicatorReport>>,
}

impl SignalAggregator {
    /// Create an aggregator with an empty initial report
    pub fn new(instrument: &str, thresholds: IndicatorThresholds) -> Self {
        let (latest, _) = watch::channel(Arc::new(IndicatorReport::empty(instrument)));
        Self { thresholds, latest }
    }

    /// Receiver that always holds the most recent complete report
    pub fn subscribe(&self) -> watch::Receiver<Arc<IndicatorReport>> {
        self.latest.subscribe()
    }

    pub fn latest(&self) -> Arc<IndicatorReport> {
        self.latest.borrow().clone()
    }

    pub fn thresholds(&self) -> &IndicatorThresholds {
        &self.thresholds
    }

    /// Evaluate the battery over `snapshot` and replace the published report
    pub fn recompute(&self, snapshot: &HistorySnapshot) -> Arc<IndicatorReport> {
        let report = Arc::new(self.evaluate(snapshot));
        debug!(
            instrument = %report.instrument,
            samples = report.sample_count,
            bias = %report.bias.signal,
            "Indicators recomputed"
        );
        self.latest.send_replace(report.clone());
        report
    }

    /// Evaluate the battery without publishing
    pub fn evaluate(&self, snapshot: &HistorySnapshot) -> IndicatorReport {
        let t = &self.thresholds;
        let samples = snapshot.samples();
        let prices = snapshot.prices();
        let last_price = snapshot.last().map(|s| s.price);
        let price = last_price.unwrap_or(0.0);

        let rsi = indicators::rsi(&prices, 14, t);
        let macd = indicators::macd(&prices, 12, 26, 9);
        let bollinger = indicators::bollinger(&prices, 20, 2.0);
        let stochastic = indicators::stochastic(samples, 14, 3, t);
        let composite = indicators::oscillator_composite(
            &OscillatorInputs {
                rsi: &rsi,
                stochastic: &stochastic,
                bollinger: &bollinger,
                macd: &macd,
            },
            t,
        );

        let mut readings = BTreeMap::new();
        let mut put = |name: &str, reading: Reading| {
            readings.insert(name.to_string(), reading);
        };

        put("sma_20", Reading::from_computed(indicators::sma(&prices, 20), |v| price_vs(price, *v)));
        put("sma_50", Reading::from_computed(indicators::sma(&prices, 50), |v| price_vs(price, *v)));
        put("ema_12", Reading::from_computed(indicators::ema(&prices, 12), |v| price_vs(price, *v)));
        put("ema_26", Reading::from_computed(indicators::ema(&prices, 26), |v| price_vs(price, *v)));
        put("atr", Reading::from_computed(indicators::atr(samples, 14), |_| Signal::Neutral));
        put("rsi", Reading::with_signal(rsi));
        put("macd", Reading::with_signal(macd));
        put("bollinger", Reading::with_signal(bollinger));
        put("stochastic", Reading::with_signal(stochastic));
        put("oscillator_composite", Reading::with_signal(composite));
        put("vwap", Reading::with_signal(indicators::vwap(samples, t)));
        put("order_flow", Reading::with_signal(indicators::order_flow_imbalance(samples, t)));
        put("wave_imbalance", Reading::with_signal(indicators::wave_imbalance(samples, 10, t)));
        put("ichimoku", Reading::with_signal(indicators::ichimoku(samples)));
        put("supertrend", Reading::with_signal(indicators::supertrend(samples, 10, 3.0)));
        put("elder_ray", Reading::with_signal(indicators::elder_ray(samples, 13)));
        put("keltner", Reading::with_signal(indicators::keltner(samples, 20, 10, 2.0)));
        put("wyckoff", Reading::with_signal(indicators::wyckoff(samples, t)));
        put("trend_template", Reading::with_signal(indicators::trend_template(samples, t)));
        put("order_blocks", Reading::with_signal(indicators::order_blocks(samples, t)));

        let bias = vote(&readings, t);

        IndicatorReport {
            instrument: snapshot.instrument().to_string(),
            sample_count: samples.len(),
            last_price,
            last_timestamp: snapshot.last().map(|s| s.timestamp),
            computed_at: Utc::now(),
            readings,
            bias,
        }
    }
}
