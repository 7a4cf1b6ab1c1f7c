//! Benchmarks for history and indicator operations

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use market_pulse::history::{HistoryBuffer, Sample, MAX_SAMPLES};
use market_pulse::indicators::{self, IndicatorThresholds};
use market_pulse::SignalAggregator;

fn create_history(len: usize) -> Vec<Sample> {
    (0..len)
        .map(|i| {
            let price = 50000.0 + 250.0 * ((i as f64) / 12.0).sin() + i as f64;
            Sample {
                timestamp: i as i64 + 1,
                price,
                high: price + 15.0,
                low: price - 15.0,
                volume: 1.0 + (i % 7) as f64,
            }
        })
        .collect()
}

fn benchmark_replace(c: &mut Criterion) {
    let history = create_history(MAX_SAMPLES * 2);

    c.bench_function("replace_1000_samples", |b| {
        b.iter(|| {
            let mut buffer = HistoryBuffer::new("BTCUSDT", MAX_SAMPLES);
            buffer.replace("BTCUSDT", black_box(history.clone()));
        })
    });
}

fn benchmark_append(c: &mut Criterion) {
    let mut buffer = HistoryBuffer::new("BTCUSDT", MAX_SAMPLES);
    buffer.replace("BTCUSDT", create_history(MAX_SAMPLES));
    let mut ts = MAX_SAMPLES as i64;

    c.bench_function("append_with_eviction", |b| {
        b.iter(|| {
            ts += 1;
            black_box(buffer.append(Sample::tick(ts, 50000.0, 1.0)));
        })
    });
}

fn benchmark_indicators(c: &mut Criterion) {
    let history = create_history(MAX_SAMPLES);
    let prices: Vec<f64> = history.iter().map(|s| s.price).collect();
    let thresholds = IndicatorThresholds::default();

    c.bench_function("rsi_14", |b| {
        b.iter(|| black_box(indicators::rsi(black_box(&prices), 14, &thresholds)))
    });

    c.bench_function("macd_12_26_9", |b| {
        b.iter(|| black_box(indicators::macd(black_box(&prices), 12, 26, 9)))
    });

    c.bench_function("trend_template", |b| {
        b.iter(|| black_box(indicators::trend_template(black_box(&history), &thresholds)))
    });
}

fn benchmark_full_battery(c: &mut Criterion) {
    let mut buffer = HistoryBuffer::new("BTCUSDT", MAX_SAMPLES);
    buffer.replace("BTCUSDT", create_history(MAX_SAMPLES));
    let snapshot = buffer.snapshot();
    let aggregator = SignalAggregator::new("BTCUSDT", IndicatorThresholds::default());

    c.bench_function("evaluate_500_samples", |b| {
        b.iter(|| black_box(aggregator.evaluate(black_box(&snapshot))))
    });
}

criterion_group!(
    benches,
    benchmark_replace,
    benchmark_append,
    benchmark_indicators,
    benchmark_full_battery
);
criterion_main!(benches);
