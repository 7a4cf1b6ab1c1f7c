//! Connection driver
//!
//! One task owns the transport and the state machine. Callers talk to it
//! through a [`ConnectionHandle`]; it reports state changes and parsed server
//! messages on an event channel.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, sleep_until, timeout, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use super::state::{Backoff, CloseOutcome, ConnectionState, ConnectionStateMachine, SendAction};
use super::Transport;
use crate::config::Config;
use crate::error::{FeedError, Result};
use crate::metrics::{DropReason, Metrics};
use crate::protocol::{Inbound, Outbound};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const COMMAND_BUFFER: usize = 64;
const EVENT_BUFFER: usize = 1024;

/// Timing and queue settings for the driver
#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    pub backoff: Backoff,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub queue_capacity: usize,
}

impl ConnectionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            backoff: Backoff::new(
                Duration::from_millis(config.reconnect_base_ms),
                Duration::from_millis(config.reconnect_cap_ms),
                config.max_reconnect_attempts,
            ),
            heartbeat_interval: config.heartbeat_interval(),
            heartbeat_timeout: config.heartbeat_timeout(),
            queue_capacity: config.outbound_queue_capacity,
        }
    }
}

/// Reported by the driver to its single consumer
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    StateChanged(ConnectionState),
    Message(Inbound),
}

#[derive(Debug)]
enum Command {
    Send(Outbound),
    Connect,
    Reconnect,
    Disconnect,
    Shutdown,
}

/// Cloneable handle to a running [`ConnectionManager`]
#[derive(Clone)]
pub struct ConnectionHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ConnectionState>,
}

impl ConnectionHandle {
    async fn command(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| FeedError::ChannelClosed("connection commands"))
    }

    /// Deliver now if connected, else queue until the channel opens
    pub async fn send(&self, msg: Outbound) -> Result<()> {
        self.command(Command::Send(msg)).await
    }

    /// Open the channel; no-op if already connecting or connected
    pub async fn connect(&self) -> Result<()> {
        self.command(Command::Connect).await
    }

    /// Drop the current channel and retry immediately with a fresh attempt counter
    pub async fn reconnect(&self) -> Result<()> {
        self.command(Command::Reconnect).await
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.command(Command::Disconnect).await
    }

    /// Close the channel and stop the driver task
    pub async fn shutdown(&self) -> Result<()> {
        self.command(Command::Shutdown).await
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }
}

/// Owns the live channel and drives its state machine
pub struct ConnectionManager<T: Transport> {
    transport: T,
    machine: ConnectionStateMachine,
    settings: ConnectionSettings,
    metrics: Arc<Metrics>,
    commands: mpsc::Receiver<Command>,
    events: mpsc::Sender<ConnectionEvent>,
    state_tx: watch::Sender<ConnectionState>,
    heartbeat: Interval,
    retry_at: Option<Instant>,
}

impl<T: Transport> ConnectionManager<T> {
    /// Create the driver, its handle and the event stream it reports on
    pub fn new(
        transport: T,
        settings: ConnectionSettings,
        metrics: Arc<Metrics>,
    ) -> (Self, ConnectionHandle, mpsc::Receiver<ConnectionEvent>) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let mut heartbeat = interval(settings.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let manager = Self {
            transport,
            machine: ConnectionStateMachine::new(settings.backoff, settings.queue_capacity),
            settings,
            metrics,
            commands: command_rx,
            events: event_tx,
            state_tx,
            heartbeat,
            retry_at: None,
        };
        let handle = ConnectionHandle {
            commands: command_tx,
            state: state_rx,
        };
        (manager, handle, event_rx)
    }

    /// Run until every handle is dropped or the event consumer goes away
    pub async fn run(mut self) {
        info!("Starting connection manager");

        loop {
            if self.machine.state() == ConnectionState::Connecting {
                self.open().await;
                if self.publish_state().await.is_err() {
                    break;
                }
                continue;
            }

            let connected = self.machine.state() == ConnectionState::Connected;
            let retry_at = self.retry_at;
            let heartbeat_deadline = self.machine.heartbeat_deadline(self.settings.heartbeat_timeout);

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) => break,
                    Some(command) => self.handle_command(command).await,
                    None => {
                        debug!("All connection handles dropped");
                        break;
                    }
                },
                frame = self.transport.recv(), if connected => {
                    if self.handle_frame(frame).await.is_err() {
                        break;
                    }
                }
                _ = self.heartbeat.tick(), if connected => self.send_heartbeat().await,
                _ = sleep_until_opt(heartbeat_deadline) => {
                    let outcome = self
                        .machine
                        .check_heartbeat(Instant::now(), self.settings.heartbeat_timeout);
                    if outcome != CloseOutcome::Ignored {
                        self.transport.close().await;
                        self.schedule(outcome);
                    }
                }
                _ = sleep_until_opt(retry_at) => {
                    self.retry_at = None;
                    self.machine.begin_retry();
                }
            }

            if self.publish_state().await.is_err() {
                break;
            }
        }

        self.transport.close().await;
        info!("Connection manager stopped");
    }

    async fn open(&mut self) {
        let opened = match timeout(CONNECT_TIMEOUT, self.transport.connect()).await {
            Ok(result) => result,
            Err(_) => Err(FeedError::WebSocketConnection("connect timed out".to_string())),
        };

        match opened {
            Ok(()) => {
                self.heartbeat.reset();
                let queued = self.machine.on_open();
                self.metrics.set_queue_depth(0);
                for msg in queued {
                    self.deliver(msg).await;
                }
            }
            Err(e) => {
                warn!(error = %e, attempt = self.machine.attempt() + 1, "Connect failed");
                let outcome = self.machine.on_close();
                self.schedule(outcome);
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Send(msg) => self.send(msg).await,
            Command::Connect => {
                if !self.machine.connect() {
                    debug!(state = %self.machine.state(), "Connect ignored");
                }
            }
            Command::Reconnect => {
                info!("Manual reconnect requested");
                self.transport.close().await;
                self.retry_at = None;
                self.machine.reconnect();
            }
            Command::Disconnect => {
                info!("Disconnect requested");
                self.transport.close().await;
                self.retry_at = None;
                self.machine.disconnect();
            }
            Command::Shutdown => {}
        }
    }

    async fn send(&mut self, msg: Outbound) {
        match self.machine.send(msg) {
            SendAction::Deliver(msg) => self.deliver(msg).await,
            SendAction::Queued { evicted } => {
                if evicted > 0 {
                    self.metrics.inc_evicted(evicted);
                }
                self.metrics.set_queue_depth(self.machine.queue_len());
            }
            SendAction::Discarded => {}
        }
    }

    /// Write to the open channel; a failed write closes it and requeues the message
    async fn deliver(&mut self, msg: Outbound) {
        let text = match msg.to_json() {
            Ok(text) => text,
            Err(e) => {
                error!(error = %e, kind = msg.kind(), "Failed to encode outbound message");
                return;
            }
        };
        trace!(kind = msg.kind(), "Sending");

        if let Err(e) = self.transport.send(text).await {
            warn!(error = %e, kind = msg.kind(), "Send failed");
            self.transport.close().await;
            let outcome = self.machine.on_close();
            self.schedule(outcome);
            self.send_queued(msg);
        }
    }

    fn send_queued(&mut self, msg: Outbound) {
        if let SendAction::Queued { evicted } = self.machine.send(msg) {
            self.metrics.inc_evicted(evicted);
            self.metrics.set_queue_depth(self.machine.queue_len());
        }
    }

    async fn handle_frame(&mut self, frame: Result<Option<String>>) -> Result<()> {
        let text = match frame {
            Ok(Some(text)) => text,
            Ok(None) => {
                self.machine.heartbeat_ack();
                return Ok(());
            }
            Err(e) => {
                warn!(error = %e, "Channel closed");
                self.transport.close().await;
                let outcome = self.machine.on_close();
                self.schedule(outcome);
                return Ok(());
            }
        };
        self.machine.heartbeat_ack();

        match Inbound::parse(&text) {
            Ok(Inbound::Pong) => {
                trace!("Heartbeat answered");
                Ok(())
            }
            Ok(msg) => self.emit(ConnectionEvent::Message(msg)).await,
            Err(e) => {
                warn!(error = %e, len = text.len(), "Dropping malformed message");
                self.metrics.inc_dropped(DropReason::Malformed);
                Ok(())
            }
        }
    }

    async fn send_heartbeat(&mut self) {
        if self
            .machine
            .heartbeat_deadline(self.settings.heartbeat_timeout)
            .is_some()
        {
            return;
        }
        self.machine.heartbeat_sent(Instant::now());
        self.deliver(Outbound::Ping).await;
    }

    fn schedule(&mut self, outcome: CloseOutcome) {
        match outcome {
            CloseOutcome::RetryAfter(delay) => {
                self.metrics.inc_reconnect();
                self.retry_at = Some(Instant::now() + delay);
            }
            CloseOutcome::Failed => {
                error!("Connection failed, waiting for manual reconnect");
                self.retry_at = None;
            }
            CloseOutcome::Ignored => {}
        }
    }

    /// Report the current state if it differs from the last one reported
    async fn publish_state(&mut self) -> Result<()> {
        let state = self.machine.state();
        if *self.state_tx.borrow() == state {
            return Ok(());
        }
        debug!(state = %state, "Connection state changed");
        self.state_tx.send_replace(state);
        self.metrics.set_connection_state(state);
        self.emit(ConnectionEvent::StateChanged(state)).await
    }

    async fn emit(&self, event: ConnectionEvent) -> Result<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| FeedError::ChannelClosed("connection events"))
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
