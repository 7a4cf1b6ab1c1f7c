//! Market Pulse - streaming price-feed client
//!
//! Maintains a live connection to a price feed, keeps a bounded rolling
//! history for the active instrument, and derives technical indicators and
//! an overall directional bias from it.

use std::sync::Arc;
use tokio::sync::watch;

pub mod aggregator;
pub mod config;
pub mod connection;
pub mod coordinator;
pub mod error;
pub mod fetch;
pub mod health;
pub mod history;
pub mod indicators;
pub mod metrics;
pub mod protocol;
pub mod publisher;

pub use aggregator::{Bias, IndicatorReport, IndicatorValue, Reading, SignalAggregator};
pub use config::Config;
pub use connection::{
    ConnectionEvent, ConnectionHandle, ConnectionManager, ConnectionSettings, ConnectionState,
    Transport, WebSocketClient,
};
pub use coordinator::{CoordinatorHandle, CoordinatorSettings, CoreEvent, SyncCoordinator, SyncStatus};
pub use error::{FeedError, Result};
pub use fetch::{HistorySource, HttpHistorySource, PriceQuote};
pub use history::{HistoryBuffer, HistorySnapshot, Sample, MAX_SAMPLES};
pub use indicators::{Computed, IndicatorThresholds, Signal};
pub use metrics::Metrics;
pub use protocol::{Inbound, Outbound};
pub use publisher::Publisher;

/// Application state shared with the health server
pub struct AppState {
    pub config: Arc<Config>,
    pub connection: ConnectionHandle,
    pub coordinator: CoordinatorHandle,
    pub reports: watch::Receiver<Arc<IndicatorReport>>,
    pub metrics: Arc<Metrics>,
}
