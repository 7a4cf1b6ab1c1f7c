//! Instrument switching and history synchronization
//!
//! The coordinator task is the only writer of the history buffer. It filters
//! live ticks by the active instrument, installs pulled history snapshots,
//! replays ticks that raced ahead of a snapshot, and keeps the buffer in line
//! with the pull source on a fixed cadence.
//!
//! A switch runs in a fixed order: install the ingestion filter, request
//! history and subscribe, replace the buffer, replay buffered ticks, then
//! recompute indicators and notify. Every request carries the generation it
//! was issued under; results from an older generation are discarded.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::aggregator::{IndicatorReport, SignalAggregator};
use crate::config::Config;
use crate::connection::{ConnectionEvent, ConnectionHandle, ConnectionState};
use crate::error::{FeedError, Result};
use crate::fetch::{HistorySource, PriceQuote};
use crate::history::{AppendOutcome, HistoryBuffer, Sample};
use crate::metrics::{DropReason, Metrics};
use crate::protocol::{Inbound, Outbound};

const COMMAND_BUFFER: usize = 32;
const FETCH_BUFFER: usize = 16;
const EVENT_CAPACITY: usize = 256;

/// Live streams requested on every open channel
const LIVE_CHANNELS: [&str; 2] = ["ticker", "trade"];

/// Notifications for the presentation layer
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CoreEvent {
    HistoryChanged {
        instrument: String,
        samples: Arc<[Sample]>,
    },
    IndicatorsUpdated {
        report: Arc<IndicatorReport>,
    },
    ConnectionStateChanged {
        state: ConnectionState,
    },
}

/// Point-in-time view of the coordinator for health reporting
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncStatus {
    pub instrument: String,
    /// History for the active instrument has been installed
    pub settled: bool,
    pub samples: usize,
    pub connection: ConnectionState,
    pub supported_symbols: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub instrument: String,
    pub lookback_hours: u32,
    pub max_samples: usize,
    pub recompute_interval: Duration,
    pub reconcile_interval: Duration,
    pub poll_interval: Duration,
}

impl CoordinatorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            instrument: config.symbol.clone(),
            lookback_hours: config.history_lookback_hours,
            max_samples: config.max_samples,
            recompute_interval: config.recompute_interval(),
            reconcile_interval: config.reconcile_interval(),
            poll_interval: config.poll_interval(),
        }
    }
}

#[derive(Debug)]
enum Command {
    Switch(String),
    Refresh,
    Reconcile,
    Shutdown,
}

/// Cloneable handle to a running [`SyncCoordinator`]
#[derive(Clone)]
pub struct CoordinatorHandle {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<SyncStatus>,
    events: broadcast::Sender<CoreEvent>,
}

impl CoordinatorHandle {
    async fn command(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| FeedError::ChannelClosed("coordinator commands"))
    }

    /// Make `instrument` the active instrument
    pub async fn switch_instrument(&self, instrument: &str) -> Result<()> {
        self.command(Command::Switch(instrument.to_string())).await
    }

    /// Recompute indicators now
    pub async fn refresh(&self) -> Result<()> {
        self.command(Command::Refresh).await
    }

    /// Re-pull history now instead of waiting for the cadence
    pub async fn reconcile(&self) -> Result<()> {
        self.command(Command::Reconcile).await
    }

    /// Stop the coordinator task
    pub async fn shutdown(&self) -> Result<()> {
        self.command(Command::Shutdown).await
    }

    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.events.subscribe()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchKind {
    Switch,
    Reconcile,
    Poll,
}

#[derive(Debug)]
enum Fetched {
    History(Result<Vec<Sample>>),
    Quote(Result<PriceQuote>),
}

/// A pull result tagged with the switch generation it was requested under
#[derive(Debug)]
struct FetchDone {
    generation: u64,
    kind: FetchKind,
    fetched: Fetched,
}

/// Owner of the history buffer and the active subscription
pub struct SyncCoordinator {
    settings: CoordinatorSettings,
    buffer: HistoryBuffer,
    target: String,
    generation: u64,
    settled: bool,
    /// Live ticks for the target that arrived before its history
    pending: Vec<Sample>,
    /// Buffer changed since the last recompute
    dirty: bool,
    connection_state: ConnectionState,
    supported_symbols: Vec<String>,
    source: Arc<dyn HistorySource>,
    connection: ConnectionHandle,
    connection_events: mpsc::Receiver<ConnectionEvent>,
    aggregator: Arc<SignalAggregator>,
    metrics: Arc<Metrics>,
    events: broadcast::Sender<CoreEvent>,
    status: watch::Sender<SyncStatus>,
    commands: mpsc::Receiver<Command>,
    fetch_tx: mpsc::Sender<FetchDone>,
    fetch_rx: mpsc::Receiver<FetchDone>,
}

impl SyncCoordinator {
    pub fn new(
        settings: CoordinatorSettings,
        source: Arc<dyn HistorySource>,
        connection: ConnectionHandle,
        connection_events: mpsc::Receiver<ConnectionEvent>,
        aggregator: Arc<SignalAggregator>,
        metrics: Arc<Metrics>,
    ) -> (Self, CoordinatorHandle) {
        let target = normalize_instrument(&settings.instrument);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (fetch_tx, fetch_rx) = mpsc::channel(FETCH_BUFFER);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let connection_state = connection.state();
        let (status, status_rx) = watch::channel(SyncStatus {
            instrument: target.clone(),
            settled: false,
            samples: 0,
            connection: connection_state,
            supported_symbols: Vec::new(),
        });

        let coordinator = Self {
            buffer: HistoryBuffer::new(&target, settings.max_samples),
            settings,
            target,
            generation: 0,
            settled: false,
            pending: Vec::new(),
            dirty: false,
            connection_state,
            supported_symbols: Vec::new(),
            source,
            connection,
            connection_events,
            aggregator,
            metrics,
            events: events.clone(),
            status,
            commands: command_rx,
            fetch_tx,
            fetch_rx,
        };
        let handle = CoordinatorHandle {
            commands: command_tx,
            status: status_rx,
            events,
        };
        (coordinator, handle)
    }

    /// Run until every handle is dropped or the connection manager stops
    pub async fn run(mut self) {
        info!(instrument = %self.target, "Starting sync coordinator");
        let initial = self.target.clone();
        self.begin_switch(&initial).await;

        let mut recompute = cadence(self.settings.recompute_interval);
        let mut reconcile = cadence(self.settings.reconcile_interval);
        let mut poll = cadence(self.settings.poll_interval);

        loop {
            let polling = self.connection_state != ConnectionState::Connected;

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) => break,
                    Some(command) => self.handle_command(command).await,
                    None => {
                        debug!("All coordinator handles dropped");
                        break;
                    }
                },
                event = self.connection_events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        warn!("Connection manager stopped");
                        break;
                    }
                },
                Some(done) = self.fetch_rx.recv() => self.handle_fetch(done),
                _ = recompute.tick() => {
                    if self.settled && self.dirty {
                        self.publish_history();
                        self.recompute();
                    }
                }
                _ = reconcile.tick() => self.start_reconcile(),
                _ = poll.tick(), if polling => {
                    if self.settled {
                        self.spawn_fetch(FetchKind::Poll);
                    }
                }
            }
        }

        info!("Sync coordinator stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Switch(instrument) => self.begin_switch(&instrument).await,
            Command::Refresh => {
                if self.settled {
                    self.recompute();
                }
            }
            Command::Reconcile => self.start_reconcile(),
            Command::Shutdown => {}
        }
    }

    /// Steps 1 and 2 of a switch: filter, then request history and subscribe
    async fn begin_switch(&mut self, instrument: &str) {
        let instrument = normalize_instrument(instrument);
        if !self.supported_symbols.is_empty() && !self.supported_symbols.contains(&instrument) {
            warn!(instrument = %instrument, "Instrument not advertised by the feed, switching anyway");
        }

        self.generation += 1;
        self.target = instrument;
        self.settled = false;
        self.pending.clear();
        info!(
            instrument = %self.target,
            generation = self.generation,
            "Switching instrument"
        );

        self.spawn_fetch(FetchKind::Switch);
        if self.connection_state == ConnectionState::Connected {
            self.send(Outbound::switch_symbol(&self.target)).await;
        }
        self.publish_status();
    }

    fn start_reconcile(&mut self) {
        // an unsettled target retries its switch fetch instead
        let kind = if self.settled {
            FetchKind::Reconcile
        } else {
            FetchKind::Switch
        };
        debug!(instrument = %self.target, kind = ?kind, "Re-pulling history");
        self.spawn_fetch(kind);
    }

    fn spawn_fetch(&self, kind: FetchKind) {
        let source = self.source.clone();
        let tx = self.fetch_tx.clone();
        let instrument = self.target.clone();
        let generation = self.generation;
        let hours = self.settings.lookback_hours;

        tokio::spawn(async move {
            let fetched = match kind {
                FetchKind::Switch | FetchKind::Reconcile => {
                    Fetched::History(source.fetch_history(&instrument, hours).await)
                }
                FetchKind::Poll => Fetched::Quote(source.fetch_current_price(&instrument).await),
            };
            let _ = tx
                .send(FetchDone {
                    generation,
                    kind,
                    fetched,
                })
                .await;
        });
    }

    fn handle_fetch(&mut self, done: FetchDone) {
        if done.generation != self.generation {
            debug!(
                generation = done.generation,
                current = self.generation,
                "Discarding stale fetch result"
            );
            return;
        }

        match (done.kind, done.fetched) {
            // a retried switch fetch may land after the first one settled
            (FetchKind::Switch, Fetched::History(Ok(samples))) if self.settled => {
                self.apply_reconcile(samples)
            }
            (FetchKind::Switch, Fetched::History(Err(e))) if self.settled => {
                debug!(instrument = %self.target, error = %e, "Retried switch fetch failed after settle");
            }
            (FetchKind::Switch, Fetched::History(Ok(samples))) => self.settle(samples),
            (FetchKind::Switch, Fetched::History(Err(e))) => {
                warn!(
                    instrument = %self.target,
                    error = %e,
                    "History fetch failed, starting from live ticks"
                );
                self.settle(Vec::new());
            }
            (FetchKind::Reconcile, Fetched::History(Ok(samples))) => {
                if self.settled {
                    self.apply_reconcile(samples);
                }
            }
            (FetchKind::Reconcile, Fetched::History(Err(e))) => {
                warn!(instrument = %self.target, error = %e, "Reconciliation fetch failed");
            }
            (FetchKind::Poll, Fetched::Quote(Ok(quote))) => {
                if self.settled && self.connection_state != ConnectionState::Connected {
                    let sample = quote.to_sample(chrono::Utc::now().timestamp());
                    if self.ingest(sample) {
                        trace!(price = sample.price, "Polled price appended");
                    }
                }
            }
            (FetchKind::Poll, Fetched::Quote(Err(e))) => {
                debug!(error = %e, "Price poll failed");
            }
            (kind, _) => warn!(kind = ?kind, "Mismatched fetch result"),
        }
    }

    /// Steps 3 to 5 of a switch: replace, replay, recompute and notify
    fn settle(&mut self, samples: Vec<Sample>) {
        self.buffer.replace(&self.target, samples);
        self.metrics.inc_replacement();
        self.settled = true;

        let pending = std::mem::take(&mut self.pending);
        let replayed = pending.len();
        for sample in pending {
            self.ingest(sample);
        }

        info!(
            instrument = %self.target,
            samples = self.buffer.size(),
            replayed,
            "History installed"
        );
        self.publish_history();
        self.recompute();
    }

    /// Replace with pulled history, keeping live samples newer than it
    fn apply_reconcile(&mut self, samples: Vec<Sample>) {
        let pulled_until = samples.iter().map(|s| s.timestamp).max();
        let tail = match pulled_until {
            Some(ts) => self.buffer.newer_than(ts),
            None => {
                debug!(instrument = %self.target, "Reconciliation returned no history, keeping buffer");
                return;
            }
        };

        self.buffer.replace(&self.target, samples);
        self.metrics.inc_replacement();
        let kept = tail.len();
        for sample in tail {
            self.buffer.append(sample);
        }
        debug!(
            instrument = %self.target,
            samples = self.buffer.size(),
            kept,
            "History reconciled"
        );
        self.publish_history();
        self.recompute();
    }

    async fn handle_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::StateChanged(state) => {
                let previous = self.connection_state;
                self.connection_state = state;
                let _ = self.events.send(CoreEvent::ConnectionStateChanged { state });

                if state == ConnectionState::Connected && previous != ConnectionState::Connected {
                    self.resubscribe().await;
                }
                self.publish_status();
            }
            ConnectionEvent::Message(msg) => self.handle_message(msg),
        }
    }

    /// The server forgets subscriptions when the channel drops
    async fn resubscribe(&mut self) {
        info!(instrument = %self.target, "Subscribing on open channel");
        self.send(Outbound::Subscribe {
            channels: LIVE_CHANNELS.iter().map(|c| c.to_string()).collect(),
        })
        .await;
        self.send(Outbound::switch_symbol(&self.target)).await;
    }

    fn handle_message(&mut self, msg: Inbound) {
        match msg {
            Inbound::PriceUpdate { symbol, data, .. } => {
                if normalize_instrument(&symbol) != self.target {
                    trace!(symbol = %symbol, target = %self.target, "Dropping tick for inactive instrument");
                    self.metrics.inc_dropped(DropReason::WrongInstrument);
                    return;
                }
                let sample = data.to_sample(chrono::Utc::now().timestamp());
                self.ingest(sample);
            }
            Inbound::SymbolSwitched { symbol, cached } => {
                if normalize_instrument(&symbol) == self.target {
                    info!(symbol = %symbol, cached, "Feed switched instrument");
                } else {
                    debug!(symbol = %symbol, target = %self.target, "Ignoring stale switch acknowledgement");
                }
            }
            Inbound::Connection {
                message,
                supported_symbols,
            } => {
                info!(
                    message = %message,
                    symbols = supported_symbols.len(),
                    "Feed greeting received"
                );
                self.supported_symbols = supported_symbols
                    .iter()
                    .map(|s| normalize_instrument(s))
                    .collect();
                self.publish_status();
            }
            Inbound::Error { message } => warn!(message = %message, "Feed reported an error"),
            Inbound::Pong => {}
        }
    }

    /// Route a sample for the target into the buffer or the replay queue
    fn ingest(&mut self, sample: Sample) -> bool {
        if !sample.is_valid() {
            self.metrics.inc_dropped(DropReason::Invalid);
            return false;
        }
        if !self.settled {
            if self.pending.len() >= self.buffer.capacity() {
                self.pending.remove(0);
            }
            self.pending.push(sample);
            return false;
        }

        match self.buffer.append(sample) {
            AppendOutcome::Appended | AppendOutcome::AppendedWithEviction => {
                self.metrics.inc_tick();
                self.dirty = true;
                true
            }
            AppendOutcome::OutOfOrder => {
                self.metrics.inc_dropped(DropReason::OutOfOrder);
                false
            }
            AppendOutcome::Invalid => {
                self.metrics.inc_dropped(DropReason::Invalid);
                false
            }
        }
    }

    fn recompute(&mut self) {
        let snapshot = self.buffer.snapshot();
        let report = self.aggregator.recompute(&snapshot);
        self.metrics.inc_recompute();
        self.dirty = false;
        let _ = self.events.send(CoreEvent::IndicatorsUpdated { report });
        self.publish_status();
    }

    fn publish_history(&mut self) {
        let snapshot = self.buffer.snapshot();
        let _ = self.events.send(CoreEvent::HistoryChanged {
            instrument: snapshot.instrument().to_string(),
            samples: snapshot.shared(),
        });
    }

    fn publish_status(&self) {
        self.status.send_replace(SyncStatus {
            instrument: self.target.clone(),
            settled: self.settled,
            samples: if self.settled { self.buffer.size() } else { 0 },
            connection: self.connection_state,
            supported_symbols: self.supported_symbols.clone(),
        });
    }

    async fn send(&self, msg: Outbound) {
        let kind = msg.kind();
        if let Err(e) = self.connection.send(msg).await {
            warn!(error = %e, kind, "Failed to hand message to connection");
        }
    }
}

fn normalize_instrument(instrument: &str) -> String {
    instrument.trim().to_uppercase()
}

/// Interval whose first tick is one period out
fn cadence(period: Duration) -> Interval {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}
