//! Configuration module for the feed client

use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{FeedError, Result};

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Instrument selected at startup (e.g., "BTCUSDT")
    pub symbol: String,

    /// Live price channel endpoint
    pub ws_endpoint: String,

    /// REST endpoint serving history and current price
    pub rest_endpoint: String,

    /// IPC socket path for publishing core events
    pub ipc_socket_path: String,

    /// Port for the health/metrics server
    pub health_port: u16,

    /// How far back a history pull reaches
    pub history_lookback_hours: u32,

    /// Rolling history capacity
    pub max_samples: usize,

    /// Reconnection settings
    pub reconnect_base_ms: u64,
    pub reconnect_cap_ms: u64,
    pub max_reconnect_attempts: u32,

    /// Liveness probe settings
    pub heartbeat_interval_secs: u64,
    pub heartbeat_timeout_secs: u64,

    /// Cadences for indicator recomputation, reconciliation and polling fallback
    pub recompute_interval_secs: u64,
    pub reconcile_interval_secs: u64,
    pub poll_interval_secs: u64,

    /// Outbound messages held while disconnected
    pub outbound_queue_capacity: usize,
}

impl Config {
    /// Load configuration from environment variables
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = Self::default();
        let config = Self {
            symbol: env::var("SYMBOL")
                .map(|s| s.trim().to_uppercase())
                .unwrap_or(defaults.symbol),
            ws_endpoint: env::var("WS_ENDPOINT").unwrap_or(defaults.ws_endpoint),
            rest_endpoint: env::var("REST_ENDPOINT").unwrap_or(defaults.rest_endpoint),
            ipc_socket_path: env::var("IPC_SOCKET_PATH").unwrap_or(defaults.ipc_socket_path),
            health_port: env_or("HEALTH_PORT", defaults.health_port),
            history_lookback_hours: env_or("HISTORY_LOOKBACK_HOURS", defaults.history_lookback_hours),
            max_samples: env_or("MAX_SAMPLES", defaults.max_samples),
            reconnect_base_ms: env_or("RECONNECT_BASE_MS", defaults.reconnect_base_ms),
            reconnect_cap_ms: env_or("RECONNECT_CAP_MS", defaults.reconnect_cap_ms),
            max_reconnect_attempts: env_or("MAX_RECONNECT_ATTEMPTS", defaults.max_reconnect_attempts),
            heartbeat_interval_secs: env_or("HEARTBEAT_INTERVAL_SECS", defaults.heartbeat_interval_secs),
            heartbeat_timeout_secs: env_or("HEARTBEAT_TIMEOUT_SECS", defaults.heartbeat_timeout_secs),
            recompute_interval_secs: env_or("RECOMPUTE_INTERVAL_SECS", defaults.recompute_interval_secs),
            reconcile_interval_secs: env_or("RECONCILE_INTERVAL_SECS", defaults.reconcile_interval_secs),
            poll_interval_secs: env_or("POLL_INTERVAL_SECS", defaults.poll_interval_secs),
            outbound_queue_capacity: env_or("OUTBOUND_QUEUE_CAPACITY", defaults.outbound_queue_capacity),
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would stall timers or make the buffer useless
    pub fn validate(&self) -> Result<()> {
        if self.symbol.is_empty() {
            return Err(FeedError::ConfigError("SYMBOL must not be empty".to_string()));
        }
        if self.max_samples == 0 {
            return Err(FeedError::ConfigError("MAX_SAMPLES must be > 0".to_string()));
        }
        if self.outbound_queue_capacity == 0 {
            return Err(FeedError::ConfigError(
                "OUTBOUND_QUEUE_CAPACITY must be > 0".to_string(),
            ));
        }
        if self.reconnect_base_ms == 0 || self.reconnect_cap_ms < self.reconnect_base_ms {
            return Err(FeedError::ConfigError(format!(
                "invalid backoff: base={}ms cap={}ms",
                self.reconnect_base_ms, self.reconnect_cap_ms
            )));
        }
        let intervals = [
            ("HEARTBEAT_INTERVAL_SECS", self.heartbeat_interval_secs),
            ("HEARTBEAT_TIMEOUT_SECS", self.heartbeat_timeout_secs),
            ("RECOMPUTE_INTERVAL_SECS", self.recompute_interval_secs),
            ("RECONCILE_INTERVAL_SECS", self.reconcile_interval_secs),
            ("POLL_INTERVAL_SECS", self.poll_interval_secs),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, secs)| *secs == 0) {
            return Err(FeedError::ConfigError(format!("{} must be > 0", name)));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn recompute_interval(&self) -> Duration {
        Duration::from_secs(self.recompute_interval_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            symbol: "BTCUSDT".to_string(),
            ws_endpoint: "ws://localhost:8000/ws".to_string(),
            rest_endpoint: "http://localhost:8000/api".to_string(),
            ipc_socket_path: "/tmp/market-pulse.sock".to_string(),
            health_port: 9090,
            history_lookback_hours: 24,
            max_samples: 500,
            reconnect_base_ms: 1000,
            reconnect_cap_ms: 30_000,
            max_reconnect_attempts: 10,
            heartbeat_interval_secs: 15,
            heartbeat_timeout_secs: 10,
            recompute_interval_secs: 30,
            reconcile_interval_secs: 60,
            poll_interval_secs: 5,
            outbound_queue_capacity: 256,
        }
    }
}

/// Parse an environment variable, falling back to `default` when unset or invalid
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(default)
}
