//! Rolling price history
//!
//! Holds the time-ordered, size-bounded sample sequence for the active instrument.

mod buffer;

pub use buffer::{AppendOutcome, HistoryBuffer, MAX_SAMPLES};

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A single price/volume observation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Unix time in seconds
    pub timestamp: i64,
    pub price: f64,
    pub high: f64,
    pub low: f64,
    pub volume: f64,
}

impl Sample {
    /// Sample for a point-in-time trade or quote (high and low equal the price)
    pub fn tick(timestamp: i64, price: f64, volume: f64) -> Self {
        Self {
            timestamp,
            price,
            high: price,
            low: price,
            volume,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.price.is_finite() && self.price > 0.0
    }
}

/// Immutable view of the buffer at one point in time
///
/// Shares storage with the buffer until the next mutation, so taking a
/// snapshot is cheap and indicator code never sees a half-updated sequence.
#[derive(Debug, Clone)]
pub struct HistorySnapshot {
    instrument: String,
    samples: Arc<[Sample]>,
}

impl HistorySnapshot {
    pub fn new(instrument: impl Into<String>, samples: Arc<[Sample]>) -> Self {
        Self {
            instrument: instrument.into(),
            samples,
        }
    }

    pub fn instrument(&self) -> &str {
        &self.instrument
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    /// Shared handle to the underlying storage
    pub fn shared(&self) -> Arc<[Sample]> {
        self.samples.clone()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn is_sufficient(&self, min_samples: usize) -> bool {
        self.samples.len() >= min_samples
    }

    pub fn last(&self) -> Option<&Sample> {
        self.samples.last()
    }

    /// Closing prices in time order
    pub fn prices(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.price).collect()
    }
}
