//! Publisher module for IPC communication
//!
//! Forwards core events to other processes over a Unix socket. Each frame is
//! a 4-byte big-endian length followed by a MessagePack body.

use bytes::{BufMut, Bytes, BytesMut};
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::coordinator::CoreEvent;
use crate::error::{FeedError, Result};

/// Encode an event as a length-prefixed MessagePack frame
pub fn encode_frame(event: &CoreEvent) -> Result<Bytes> {
    let data = rmp_serde::to_vec_named(event)?;
    let mut frame = BytesMut::with_capacity(4 + data.len());
    frame.put_u32(data.len() as u32);
    frame.put_slice(&data);
    Ok(frame.freeze())
}

/// Publisher for sending core events via Unix socket
pub struct Publisher {
    socket_path: String,
    stream: Mutex<Option<UnixStream>>,
}

impl Publisher {
    /// Create a new publisher
    pub async fn new(socket_path: &str) -> Self {
        let publisher = Self {
            socket_path: socket_path.to_string(),
            stream: Mutex::new(None),
        };

        // the consumer may not be listening yet
        if let Err(e) = publisher.connect().await {
            warn!(error = %e, "Initial IPC connection failed, will retry on publish");
        }

        publisher
    }

    async fn connect(&self) -> Result<()> {
        let path = Path::new(&self.socket_path);

        if !path.exists() {
            return Err(FeedError::IpcError(format!(
                "Socket path does not exist: {}",
                self.socket_path
            )));
        }

        let stream = UnixStream::connect(path).await.map_err(|e| {
            FeedError::IpcError(format!("Failed to connect to {}: {}", self.socket_path, e))
        })?;

        let mut guard = self.stream.lock().await;
        *guard = Some(stream);

        info!(path = %self.socket_path, "Connected to IPC socket");
        Ok(())
    }

    /// Publish one event; delivery failures are logged, never returned
    pub async fn publish(&self, event: &CoreEvent) -> Result<()> {
        let frame = encode_frame(event)?;

        let mut guard = self.stream.lock().await;

        if guard.is_none() {
            drop(guard);
            if let Err(e) = self.connect().await {
                debug!(error = %e, "Failed to reconnect to IPC socket");
                return Ok(());
            }
            guard = self.stream.lock().await;
        }

        if let Some(stream) = guard.as_mut() {
            match stream.write_all(&frame).await {
                Ok(_) => debug!(len = frame.len(), "Published core event"),
                Err(e) => {
                    warn!(error = %e, "Failed to write to IPC socket");
                    *guard = None;
                }
            }
        }

        Ok(())
    }

    /// Forward every event from `events` until the sender side closes
    pub async fn run(self, mut events: broadcast::Receiver<CoreEvent>) {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Err(e) = self.publish(&event).await {
                        warn!(error = %e, "Failed to encode core event");
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Publisher fell behind, events skipped");
                }
                Err(RecvError::Closed) => break,
            }
        }
        debug!("Publisher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionState;
    use crate::history::Sample;
    use std::sync::Arc;
    use tokio::io::AsyncReadExt;
    use tokio::net::UnixListener;

    async fn read_frame(stream: &mut UnixStream) -> serde_json::Value {
        let len = stream.read_u32().await.unwrap() as usize;
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).await.unwrap();
        rmp_serde::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_publish_writes_length_prefixed_frames() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("core.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let publisher = Publisher::new(path.to_str().unwrap()).await;
        let (mut server, _) = listener.accept().await.unwrap();

        publisher
            .publish(&CoreEvent::ConnectionStateChanged {
                state: ConnectionState::Connected,
            })
            .await
            .unwrap();
        let samples: Arc<[Sample]> = vec![Sample::tick(1, 100.0, 2.0)].into();
        publisher
            .publish(&CoreEvent::HistoryChanged {
                instrument: "BTCUSDT".to_string(),
                samples,
            })
            .await
            .unwrap();

        let first = read_frame(&mut server).await;
        assert_eq!(first["event"], "connection_state_changed");
        assert_eq!(first["state"], "CONNECTED");

        let second = read_frame(&mut server).await;
        assert_eq!(second["instrument"], "BTCUSDT");
        assert_eq!(second["samples"][0]["price"], 100.0);
    }

    #[tokio::test]
    async fn test_missing_socket_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.sock");
        let publisher = Publisher::new(path.to_str().unwrap()).await;

        let result = publisher
            .publish(&CoreEvent::ConnectionStateChanged {
                state: ConnectionState::Failed,
            })
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_run_forwards_until_closed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let (tx, rx) = broadcast::channel(8);
        let publisher = Publisher::new(path.to_str().unwrap()).await;
        let (mut server, _) = listener.accept().await.unwrap();
        let task = tokio::spawn(publisher.run(rx));

        tx.send(CoreEvent::ConnectionStateChanged {
            state: ConnectionState::Reconnecting,
        })
        .unwrap();
        drop(tx);
        task.await.unwrap();

        let frame = read_frame(&mut server).await;
        assert_eq!(frame["state"], "RECONNECTING");
    }
}
