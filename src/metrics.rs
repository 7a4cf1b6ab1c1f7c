//! Prometheus metrics for the feed client

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

use crate::connection::ConnectionState;
use crate::error::Result;

/// Why an inbound tick never reached the history buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Tick for an instrument other than the active one
    WrongInstrument,
    /// Timestamp not after the last buffered sample
    OutOfOrder,
    /// Non-positive or non-finite price
    Invalid,
    /// Frame could not be parsed
    Malformed,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::WrongInstrument => "wrong_instrument",
            DropReason::OutOfOrder => "out_of_order",
            DropReason::Invalid => "invalid",
            DropReason::Malformed => "malformed",
        }
    }
}

/// Metrics registered on a registry owned by this struct
pub struct Metrics {
    registry: Registry,
    ticks_ingested: IntCounter,
    ticks_dropped: IntCounterVec,
    history_replacements: IntCounter,
    recomputations: IntCounter,
    reconnect_attempts: IntCounter,
    connection_state: IntGauge,
    outbound_queue_depth: IntGauge,
    outbound_evicted: IntCounter,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let ticks_ingested = IntCounter::new(
            "market_pulse_ticks_ingested_total",
            "Live ticks appended to the history buffer",
        )?;
        let ticks_dropped = IntCounterVec::new(
            Opts::new(
                "market_pulse_ticks_dropped_total",
                "Inbound ticks discarded before reaching the buffer",
            ),
            &["reason"],
        )?;
        let history_replacements = IntCounter::new(
            "market_pulse_history_replacements_total",
            "Full history replacements from switches and reconciliation",
        )?;
        let recomputations = IntCounter::new(
            "market_pulse_indicator_recomputations_total",
            "Indicator battery evaluations",
        )?;
        let reconnect_attempts = IntCounter::new(
            "market_pulse_reconnect_attempts_total",
            "Scheduled reconnection attempts",
        )?;
        let connection_state = IntGauge::new(
            "market_pulse_connection_state",
            "Live channel state (0=disconnected 1=connecting 2=connected 3=reconnecting 4=failed)",
        )?;
        let outbound_queue_depth = IntGauge::new(
            "market_pulse_outbound_queue_depth",
            "Outbound messages waiting for the channel to open",
        )?;
        let outbound_evicted = IntCounter::new(
            "market_pulse_outbound_evicted_total",
            "Queued outbound messages evicted by overflow or coalescing",
        )?;

        registry.register(Box::new(ticks_ingested.clone()))?;
        registry.register(Box::new(ticks_dropped.clone()))?;
        registry.register(Box::new(history_replacements.clone()))?;
        registry.register(Box::new(recomputations.clone()))?;
        registry.register(Box::new(reconnect_attempts.clone()))?;
        registry.register(Box::new(connection_state.clone()))?;
        registry.register(Box::new(outbound_queue_depth.clone()))?;
        registry.register(Box::new(outbound_evicted.clone()))?;

        Ok(Self {
            registry,
            ticks_ingested,
            ticks_dropped,
            history_replacements,
            recomputations,
            reconnect_attempts,
            connection_state,
            outbound_queue_depth,
            outbound_evicted,
        })
    }

    pub fn inc_tick(&self) {
        self.ticks_ingested.inc();
    }

    pub fn inc_dropped(&self, reason: DropReason) {
        self.ticks_dropped.with_label_values(&[reason.as_str()]).inc();
    }

    pub fn inc_replacement(&self) {
        self.history_replacements.inc();
    }

    pub fn inc_recompute(&self) {
        self.recomputations.inc();
    }

    pub fn inc_reconnect(&self) {
        self.reconnect_attempts.inc();
    }

    pub fn set_connection_state(&self, state: ConnectionState) {
        self.connection_state.set(state.as_gauge());
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.outbound_queue_depth.set(depth as i64);
    }

    pub fn inc_evicted(&self, count: usize) {
        self.outbound_evicted.inc_by(count as u64);
    }

    pub fn dropped(&self, reason: DropReason) -> u64 {
        self.ticks_dropped.with_label_values(&[reason.as_str()]).get()
    }

    pub fn ticks(&self) -> u64 {
        self.ticks_ingested.get()
    }

    /// Render the registry in the Prometheus text format
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_counters() {
        let metrics = Metrics::new().unwrap();
        metrics.inc_tick();
        metrics.inc_dropped(DropReason::WrongInstrument);
        metrics.inc_dropped(DropReason::WrongInstrument);
        metrics.set_connection_state(ConnectionState::Connected);

        assert_eq!(metrics.ticks(), 1);
        assert_eq!(metrics.dropped(DropReason::WrongInstrument), 2);

        let text = metrics.render().unwrap();
        assert!(text.contains("market_pulse_ticks_ingested_total 1"));
        assert!(text.contains(r#"reason="wrong_instrument""#));
        assert!(text.contains("market_pulse_connection_state 2"));
    }

    #[test]
    fn test_registries_are_independent() {
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();
        a.inc_recompute();
        assert!(b.render().unwrap().contains("market_pulse_indicator_recomputations_total 0"));
    }
}
