//! WebSocket transport for the live price channel
//!
//! Handles connection, frame send and reception.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::protocol::Message,
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};

use crate::error::{FeedError, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A duplex text channel
///
/// `recv` must be cancel safe: the driver polls it inside `select!`.
#[async_trait]
pub trait Transport: Send {
    async fn connect(&mut self) -> Result<()>;

    async fn send(&mut self, text: String) -> Result<()>;

    /// Next text frame; `Ok(None)` for control frames with no payload for the caller
    async fn recv(&mut self) -> Result<Option<String>>;

    async fn close(&mut self);
}

/// WebSocket client for a single connection
pub struct WebSocketClient {
    stream: Option<WsStream>,
    endpoint: String,
}

impl WebSocketClient {
    pub fn new(endpoint: &str) -> Self {
        Self {
            stream: None,
            endpoint: endpoint.to_string(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn stream(&mut self) -> Result<&mut WsStream> {
        self.stream.as_mut().ok_or(FeedError::NotConnected)
    }
}

#[async_trait]
impl Transport for WebSocketClient {
    async fn connect(&mut self) -> Result<()> {
        info!(url = %self.endpoint, "Connecting to price feed");

        let (ws_stream, response) = connect_async(self.endpoint.as_str()).await.map_err(|e| {
            FeedError::WebSocketConnection(format!("Failed to connect: {}", e))
        })?;

        info!(status = ?response.status(), "WebSocket connected");
        self.stream = Some(ws_stream);
        Ok(())
    }

    async fn send(&mut self, text: String) -> Result<()> {
        let stream = self.stream()?;
        if let Err(e) = stream.send(Message::Text(text)).await {
            self.stream = None;
            return Err(FeedError::WebSocketMessage(e.to_string()));
        }
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<String>> {
        let stream = self.stream()?;

        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                debug!(len = text.len(), "Received text message");
                Ok(Some(text))
            }
            Some(Ok(Message::Binary(data))) => {
                let text = String::from_utf8_lossy(&data).to_string();
                Ok(Some(text))
            }
            Some(Ok(Message::Ping(data))) => {
                debug!("Received ping, sending pong");
                if let Some(stream) = self.stream.as_mut() {
                    let _ = stream.send(Message::Pong(data)).await;
                }
                Ok(None)
            }
            Some(Ok(Message::Pong(_))) => Ok(None),
            Some(Ok(Message::Close(frame))) => {
                warn!(frame = ?frame, "Received close frame");
                self.stream = None;
                Err(FeedError::WebSocketConnection(
                    "Connection closed".to_string(),
                ))
            }
            Some(Ok(Message::Frame(_))) => Ok(None),
            Some(Err(e)) => {
                error!(error = %e, "WebSocket error");
                self.stream = None;
                Err(FeedError::WebSocketMessage(e.to_string()))
            }
            None => {
                warn!("WebSocket stream ended");
                self.stream = None;
                Err(FeedError::WebSocketConnection(
                    "Stream ended".to_string(),
                ))
            }
        }
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.close(None).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_io_before_connect_is_not_connected() {
        let mut client = WebSocketClient::new("ws://localhost:1/ws");
        assert!(!client.is_connected());
        assert!(matches!(client.recv().await, Err(FeedError::NotConnected)));
        assert!(matches!(
            client.send("{}".to_string()).await,
            Err(FeedError::NotConnected)
        ));
        client.close().await;
    }
}
