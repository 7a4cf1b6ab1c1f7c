//! Bounded, strictly time-ordered sample buffer
//!
//! Uses a VecDeque so eviction of the oldest sample is O(1).

use std::collections::VecDeque;
use std::sync::Arc;

use super::{HistorySnapshot, Sample};

/// Default rolling capacity
pub const MAX_SAMPLES: usize = 500;

/// Result of offering a live sample to the buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    /// Appended and the oldest sample was evicted
    AppendedWithEviction,
    /// Timestamp not after the newest sample
    OutOfOrder,
    /// Non-positive or non-finite price
    Invalid,
}

impl AppendOutcome {
    pub fn is_appended(&self) -> bool {
        matches!(self, Self::Appended | Self::AppendedWithEviction)
    }
}

/// History for exactly one instrument
#[derive(Debug)]
pub struct HistoryBuffer {
    instrument: String,
    samples: VecDeque<Sample>,
    capacity: usize,
    /// Cached snapshot, dropped on every mutation
    shared: Option<Arc<[Sample]>>,
}

impl HistoryBuffer {
    /// Create an empty buffer for an instrument
    pub fn new(instrument: &str, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            instrument: instrument.to_string(),
            samples: VecDeque::with_capacity(capacity),
            capacity,
            shared: None,
        }
    }

    /// Discard everything and install a fresh sequence for `instrument`
    ///
    /// Input is sorted by timestamp; on duplicate timestamps the sample that
    /// came later in the input wins. Only the newest `capacity` samples are kept.
    pub fn replace(&mut self, instrument: &str, samples: Vec<Sample>) {
        let mut samples: Vec<Sample> = samples.into_iter().filter(Sample::is_valid).collect();
        // stable sort keeps input order among equal timestamps
        samples.sort_by_key(|s| s.timestamp);

        let mut deduped: Vec<Sample> = Vec::with_capacity(samples.len());
        for sample in samples {
            match deduped.last_mut() {
                Some(last) if last.timestamp == sample.timestamp => *last = sample,
                _ => deduped.push(sample),
            }
        }

        let skip = deduped.len().saturating_sub(self.capacity);
        self.instrument = instrument.to_string();
        self.samples = deduped.into_iter().skip(skip).collect();
        self.shared = None;
    }

    /// Push a live sample if it is strictly newer than the last one
    pub fn append(&mut self, sample: Sample) -> AppendOutcome {
        if !sample.is_valid() {
            return AppendOutcome::Invalid;
        }
        if let Some(last) = self.samples.back() {
            if sample.timestamp <= last.timestamp {
                return AppendOutcome::OutOfOrder;
            }
        }

        self.samples.push_back(sample);
        self.shared = None;

        if self.samples.len() > self.capacity {
            self.samples.pop_front();
            AppendOutcome::AppendedWithEviction
        } else {
            AppendOutcome::Appended
        }
    }

    /// Read-only view that is unaffected by later mutation
    pub fn snapshot(&mut self) -> HistorySnapshot {
        let shared = self
            .shared
            .get_or_insert_with(|| self.samples.iter().copied().collect::<Vec<_>>().into())
            .clone();
        HistorySnapshot::new(self.instrument.clone(), shared)
    }

    pub fn instrument(&self) -> &str {
        &self.instrument
    }

    pub fn size(&self) -> usize {
        self.samples.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_sufficient(&self, min_samples: usize) -> bool {
        self.samples.len() >= min_samples
    }

    pub fn last(&self) -> Option<&Sample> {
        self.samples.back()
    }

    /// Samples strictly newer than `timestamp`, oldest first
    pub fn newer_than(&self, timestamp: i64) -> Vec<Sample> {
        self.samples
            .iter()
            .filter(|s| s.timestamp > timestamp)
            .copied()
            .collect()
    }
}
