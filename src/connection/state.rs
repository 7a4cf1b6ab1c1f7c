//! Connection state machine
//!
//! No I/O happens here. The driver in `manager.rs` reports what the socket
//! did and acts on what the machine returns, which keeps every transition
//! testable without a network or a runtime.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::protocol::Outbound;

/// Lifecycle of the live channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl ConnectionState {
    /// Numeric encoding for the state gauge
    pub fn as_gauge(&self) -> i64 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Connected => 2,
            ConnectionState::Reconnecting => 3,
            ConnectionState::Failed => 4,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Reconnecting => "RECONNECTING",
            ConnectionState::Failed => "FAILED",
        };
        f.write_str(label)
    }
}

/// Capped exponential backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            cap,
            max_attempts,
        }
    }

    /// `min(base * 2^attempt, cap)`
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.cap, |d| d.min(self.cap))
    }
}

/// What the driver should do after the channel closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// Not open or opening; nothing changes
    Ignored,
    RetryAfter(Duration),
    /// Attempts exhausted; waits for a manual reconnect
    Failed,
}

/// What `send` decided for an outbound message
#[derive(Debug, Clone, PartialEq)]
pub enum SendAction {
    /// Channel is open; write it now
    Deliver(Outbound),
    /// Held until the next open; `evicted` older messages were pushed out
    Queued { evicted: usize },
    /// Heartbeat probes are not worth holding
    Discarded,
}

/// Connection lifecycle, retry counter, heartbeat tracking and the outbound queue
#[derive(Debug)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
    attempt: u32,
    backoff: Backoff,
    queue: VecDeque<Outbound>,
    queue_capacity: usize,
    awaiting_pong_since: Option<Instant>,
}

impl ConnectionStateMachine {
    pub fn new(backoff: Backoff, queue_capacity: usize) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            attempt: 0,
            backoff,
            queue: VecDeque::new(),
            queue_capacity: queue_capacity.max(1),
            awaiting_pong_since: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Start connecting; no-op unless disconnected or failed
    pub fn connect(&mut self) -> bool {
        match self.state {
            ConnectionState::Disconnected | ConnectionState::Failed => {
                self.state = ConnectionState::Connecting;
                true
            }
            _ => false,
        }
    }

    /// Channel opened; returns the queued messages to flush in order
    pub fn on_open(&mut self) -> Vec<Outbound> {
        if self.state != ConnectionState::Connecting {
            warn!(state = %self.state, "Channel opened outside CONNECTING, ignoring");
            return Vec::new();
        }
        self.state = ConnectionState::Connected;
        self.attempt = 0;
        self.awaiting_pong_since = None;
        info!(queued = self.queue.len(), "Connection established");
        self.queue.drain(..).collect()
    }

    /// Channel closed or errored
    ///
    /// Only the first close of an open or opening channel counts; repeats
    /// while already reconnecting are ignored.
    pub fn on_close(&mut self) -> CloseOutcome {
        match self.state {
            ConnectionState::Connected | ConnectionState::Connecting => {}
            _ => return CloseOutcome::Ignored,
        }
        self.awaiting_pong_since = None;
        self.attempt += 1;

        if self.attempt > self.backoff.max_attempts {
            self.state = ConnectionState::Failed;
            warn!(attempts = self.attempt - 1, "Reconnect attempts exhausted");
            return CloseOutcome::Failed;
        }

        self.state = ConnectionState::Reconnecting;
        let delay = self.backoff.delay(self.attempt);
        info!(
            attempt = self.attempt,
            delay_ms = delay.as_millis() as u64,
            "Scheduling reconnect"
        );
        CloseOutcome::RetryAfter(delay)
    }

    /// Backoff elapsed; move to CONNECTING for the next attempt
    pub fn begin_retry(&mut self) -> bool {
        if self.state == ConnectionState::Reconnecting {
            self.state = ConnectionState::Connecting;
            true
        } else {
            false
        }
    }

    /// Manual reconnect: resets the attempt counter from any state
    pub fn reconnect(&mut self) {
        self.attempt = 0;
        self.awaiting_pong_since = None;
        self.state = ConnectionState::Connecting;
    }

    pub fn disconnect(&mut self) {
        self.attempt = 0;
        self.awaiting_pong_since = None;
        self.state = ConnectionState::Disconnected;
    }

    /// Record a heartbeat probe; keeps the earliest unanswered one
    pub fn heartbeat_sent(&mut self, now: Instant) {
        if self.state == ConnectionState::Connected && self.awaiting_pong_since.is_none() {
            self.awaiting_pong_since = Some(now);
        }
    }

    /// Any inbound frame proves the channel is alive
    pub fn heartbeat_ack(&mut self) {
        self.awaiting_pong_since = None;
    }

    /// When the outstanding probe times out, if one is outstanding
    pub fn heartbeat_deadline(&self, timeout: Duration) -> Option<Instant> {
        match self.state {
            ConnectionState::Connected => self.awaiting_pong_since.map(|sent| sent + timeout),
            _ => None,
        }
    }

    /// Treat an unanswered probe older than `timeout` as a close
    pub fn check_heartbeat(&mut self, now: Instant, timeout: Duration) -> CloseOutcome {
        match self.heartbeat_deadline(timeout) {
            Some(deadline) if now >= deadline => {
                warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "Heartbeat not answered, forcing reconnect"
                );
                self.on_close()
            }
            _ => CloseOutcome::Ignored,
        }
    }

    /// Deliver now if connected, otherwise hold in the bounded queue
    ///
    /// A queued `switch_symbol` replaces any older one. On overflow the oldest
    /// message is evicted.
    pub fn send(&mut self, msg: Outbound) -> SendAction {
        if self.state == ConnectionState::Connected {
            return SendAction::Deliver(msg);
        }
        if msg == Outbound::Ping {
            return SendAction::Discarded;
        }

        let mut evicted = 0;
        if matches!(msg, Outbound::SwitchSymbol { .. }) {
            let before = self.queue.len();
            self.queue
                .retain(|queued| !matches!(queued, Outbound::SwitchSymbol { .. }));
            evicted += before - self.queue.len();
        }
        while self.queue.len() >= self.queue_capacity {
            if let Some(dropped) = self.queue.pop_front() {
                debug!(kind = dropped.kind(), "Outbound queue full, evicting oldest");
                evicted += 1;
            }
        }
        self.queue.push_back(msg);
        SendAction::Queued { evicted }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine(max_attempts: u32) -> ConnectionStateMachine {
        let backoff = Backoff::new(Duration::from_millis(1000), Duration::from_millis(30_000), max_attempts);
        ConnectionStateMachine::new(backoff, 4)
    }

    fn connected(max_attempts: u32) -> ConnectionStateMachine {
        let mut m = machine(max_attempts);
        assert!(m.connect());
        m.on_open();
        m
    }

    #[test]
    fn test_backoff_sequence_is_capped() {
        let backoff = Backoff::new(Duration::from_millis(1000), Duration::from_millis(30_000), 10);
        let delays: Vec<u128> = (1..=5).map(|a| backoff.delay(a).as_millis()).collect();
        assert_eq!(delays, vec![2000, 4000, 8000, 16000, 30000]);
        assert_eq!(backoff.delay(200), Duration::from_millis(30_000));
    }

    #[test]
    fn test_close_schedules_growing_delays() {
        let mut m = connected(10);
        let mut delays = Vec::new();
        for _ in 0..5 {
            match m.on_close() {
                CloseOutcome::RetryAfter(d) => delays.push(d.as_millis()),
                other => panic!("unexpected {:?}", other),
            }
            assert_eq!(m.state(), ConnectionState::Reconnecting);
            assert!(m.begin_retry());
            assert_eq!(m.state(), ConnectionState::Connecting);
        }
        assert_eq!(delays, vec![2000, 4000, 8000, 16000, 30000]);
    }

    #[test]
    fn test_connect_is_idempotent() {
        let mut m = machine(3);
        assert!(m.connect());
        assert!(!m.connect());
        m.on_open();
        assert!(!m.connect());
        assert_eq!(m.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_failed_after_max_attempts_until_manual_reconnect() {
        let mut m = connected(2);
        assert!(matches!(m.on_close(), CloseOutcome::RetryAfter(_)));
        m.begin_retry();
        assert!(matches!(m.on_close(), CloseOutcome::RetryAfter(_)));
        m.begin_retry();
        assert_eq!(m.on_close(), CloseOutcome::Failed);
        assert_eq!(m.state(), ConnectionState::Failed);
        assert!(!m.begin_retry());

        m.reconnect();
        assert_eq!(m.state(), ConnectionState::Connecting);
        assert_eq!(m.attempt(), 0);
        m.on_open();
        assert_eq!(m.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_heartbeat_timeout_transitions_once() {
        let mut m = connected(10);
        let timeout = Duration::from_secs(10);
        let t0 = Instant::now();

        m.heartbeat_sent(t0);
        assert_eq!(m.check_heartbeat(t0 + Duration::from_secs(5), timeout), CloseOutcome::Ignored);
        assert_eq!(m.state(), ConnectionState::Connected);

        let first = m.check_heartbeat(t0 + Duration::from_secs(11), timeout);
        assert!(matches!(first, CloseOutcome::RetryAfter(_)));
        assert_eq!(m.state(), ConnectionState::Reconnecting);

        assert_eq!(m.check_heartbeat(t0 + Duration::from_secs(12), timeout), CloseOutcome::Ignored);
        assert_eq!(m.on_close(), CloseOutcome::Ignored);
        assert_eq!(m.attempt(), 1);
    }

    #[test]
    fn test_heartbeat_ack_clears_probe() {
        let mut m = connected(10);
        let t0 = Instant::now();
        m.heartbeat_sent(t0);
        m.heartbeat_ack();
        assert_eq!(m.heartbeat_deadline(Duration::from_secs(10)), None);
        assert_eq!(m.check_heartbeat(t0 + Duration::from_secs(60), Duration::from_secs(10)), CloseOutcome::Ignored);
    }

    #[test]
    fn test_queue_flushes_in_fifo_order() {
        let mut m = machine(3);
        let subscribe = Outbound::Subscribe {
            channels: vec!["ticker".to_string()],
        };
        assert_eq!(m.send(Outbound::switch_symbol("BTCUSDT")), SendAction::Queued { evicted: 0 });
        assert_eq!(m.send(subscribe.clone()), SendAction::Queued { evicted: 0 });
        assert_eq!(m.send(Outbound::Ping), SendAction::Discarded);

        m.connect();
        let flushed = m.on_open();
        assert_eq!(flushed, vec![Outbound::switch_symbol("BTCUSDT"), subscribe]);
        assert_eq!(m.queue_len(), 0);
        assert_eq!(m.send(Outbound::Ping), SendAction::Deliver(Outbound::Ping));
    }

    #[test]
    fn test_queue_coalesces_switches_and_evicts_oldest() {
        let mut m = machine(3);
        m.send(Outbound::switch_symbol("BTCUSDT"));
        assert_eq!(m.send(Outbound::switch_symbol("ETHUSDT")), SendAction::Queued { evicted: 1 });
        assert_eq!(m.queue_len(), 1);

        for i in 0..3 {
            m.send(Outbound::Subscribe {
                channels: vec![format!("c{}", i)],
            });
        }
        assert_eq!(m.queue_len(), 4);
        assert_eq!(
            m.send(Outbound::Subscribe {
                channels: vec!["c3".to_string()],
            }),
            SendAction::Queued { evicted: 1 }
        );

        m.connect();
        let flushed = m.on_open();
        assert_eq!(flushed.len(), 4);
        assert!(!flushed.contains(&Outbound::switch_symbol("ETHUSDT")));
    }
}
