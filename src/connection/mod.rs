//! Live channel connection management

mod client;
mod manager;
mod state;

pub use client::{Transport, WebSocketClient};
pub use manager::{ConnectionEvent, ConnectionHandle, ConnectionManager, ConnectionSettings};
pub use state::{Backoff, CloseOutcome, ConnectionState, ConnectionStateMachine, SendAction};
