//! End-to-end pipeline: connection driver, coordinator and health server
//! wired together over in-memory transport and history source.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex, Notify};
use tokio::time::timeout;

use market_pulse::connection::Backoff;
use market_pulse::metrics::DropReason;
use market_pulse::{
    health, AppState, Config, ConnectionManager, ConnectionSettings, ConnectionState,
    CoordinatorSettings, CoreEvent, FeedError, HistorySource, IndicatorThresholds, Metrics,
    PriceQuote, Result, Sample, SignalAggregator, SyncCoordinator, Transport,
};

const WAIT: Duration = Duration::from_secs(5);

struct ChannelTransport {
    inbound: mpsc::UnboundedReceiver<String>,
    outbound: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn connect(&mut self) -> Result<()> {
        Ok(())
    }

    async fn send(&mut self, text: String) -> Result<()> {
        self.outbound
            .send(text)
            .map_err(|_| FeedError::NotConnected)
    }

    async fn recv(&mut self) -> Result<Option<String>> {
        match self.inbound.recv().await {
            Some(text) => Ok(Some(text)),
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self) {}
}

/// History per instrument; instruments with a gate wait for it before answering
struct FakeSource {
    history: HashMap<String, Vec<Sample>>,
    gates: Mutex<HashMap<String, Arc<Notify>>>,
}

#[async_trait]
impl HistorySource for FakeSource {
    async fn fetch_history(&self, instrument: &str, _lookback_hours: u32) -> Result<Vec<Sample>> {
        let gate = self.gates.lock().await.get(instrument).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.history
            .get(instrument)
            .cloned()
            .ok_or_else(|| FeedError::RestApiError(format!("unknown symbol {}", instrument)))
    }

    async fn fetch_current_price(&self, _instrument: &str) -> Result<PriceQuote> {
        Err(FeedError::RestApiError("not served".to_string()))
    }
}

fn history(len: i64, base: f64) -> Vec<Sample> {
    (1..=len)
        .map(|t| Sample::tick(t, base + t as f64, 1.0))
        .collect()
}

fn price_update(symbol: &str, t: i64, price: f64) -> String {
    serde_json::json!({
        "type": "price_update",
        "symbol": symbol,
        "stream_type": "trade",
        "data": {"price": price.to_string(), "quantity": "1", "trade_time": t * 1000}
    })
    .to_string()
}

async fn next_history(events: &mut broadcast::Receiver<CoreEvent>, instrument: &str) -> Vec<f64> {
    loop {
        let event = timeout(WAIT, events.recv()).await.unwrap().unwrap();
        if let CoreEvent::HistoryChanged {
            instrument: got,
            samples,
        } = event
        {
            if got == instrument {
                return samples.iter().map(|s| s.price).collect();
            }
        }
    }
}

async fn next_outbound(outbound: &mut mpsc::UnboundedReceiver<String>) -> serde_json::Value {
    let text = timeout(WAIT, outbound.recv()).await.unwrap().unwrap();
    serde_json::from_str(&text).unwrap()
}

#[tokio::test]
async fn test_switch_pipeline_end_to_end() {
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    let transport = ChannelTransport {
        inbound: inbound_rx,
        outbound: outbound_tx,
    };

    let eth_gate = Arc::new(Notify::new());
    let source = Arc::new(FakeSource {
        history: HashMap::from([
            ("BTCUSDT".to_string(), history(10, 100.0)),
            ("ETHUSDT".to_string(), history(5, 1000.0)),
        ]),
        gates: Mutex::new(HashMap::from([("ETHUSDT".to_string(), eth_gate.clone())])),
    });

    let metrics = Arc::new(Metrics::new().unwrap());
    let (manager, connection, connection_events) = ConnectionManager::new(
        transport,
        ConnectionSettings {
            backoff: Backoff::new(Duration::from_millis(10), Duration::from_millis(100), 3),
            heartbeat_interval: Duration::from_secs(3600),
            heartbeat_timeout: Duration::from_secs(3600),
            queue_capacity: 16,
        },
        metrics.clone(),
    );
    let aggregator = Arc::new(SignalAggregator::new("BTCUSDT", IndicatorThresholds::default()));
    let (coordinator, handle) = SyncCoordinator::new(
        CoordinatorSettings {
            instrument: "BTCUSDT".to_string(),
            lookback_hours: 24,
            max_samples: 500,
            recompute_interval: Duration::from_secs(3600),
            reconcile_interval: Duration::from_secs(3600),
            poll_interval: Duration::from_secs(3600),
        },
        source,
        connection.clone(),
        connection_events,
        aggregator.clone(),
        metrics.clone(),
    );
    let mut events = handle.subscribe();

    let connection_task = tokio::spawn(manager.run());
    let coordinator_task = tokio::spawn(coordinator.run());

    assert_eq!(next_history(&mut events, "BTCUSDT").await.len(), 10);

    // subscription is issued once the channel opens
    connection.connect().await.unwrap();
    let subscribe = next_outbound(&mut outbound_rx).await;
    assert_eq!(subscribe["type"], "subscribe");
    let switch = next_outbound(&mut outbound_rx).await;
    assert_eq!(switch["type"], "switch_symbol");
    assert_eq!(switch["symbol"], "BTCUSDT");
    assert_eq!(connection.state(), ConnectionState::Connected);

    handle.switch_instrument("ETHUSDT").await.unwrap();
    let switch = next_outbound(&mut outbound_rx).await;
    assert_eq!(switch["symbol"], "ETHUSDT");

    // both ticks arrive while the ETH history is still in flight
    inbound_tx.send(price_update("ETHUSDT", 6, 1006.0)).unwrap();
    inbound_tx.send(price_update("BTCUSDT", 11, 111.0)).unwrap();
    timeout(WAIT, async {
        while metrics.dropped(DropReason::WrongInstrument) < 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    eth_gate.notify_one();

    let prices = next_history(&mut events, "ETHUSDT").await;
    assert_eq!(prices, vec![1001.0, 1002.0, 1003.0, 1004.0, 1005.0, 1006.0]);
    assert_eq!(aggregator.latest().instrument, "ETHUSDT");
    assert_eq!(aggregator.latest().sample_count, 6);

    // health endpoint reflects the settled switch
    let state = Arc::new(AppState {
        config: Arc::new(Config::default()),
        connection: connection.clone(),
        coordinator: handle.clone(),
        reports: aggregator.subscribe(),
        metrics: metrics.clone(),
    });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, health::router(state)).await;
    });

    let body: serde_json::Value = reqwest::get(format!("http://{}/health", addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["instrument"], "ETHUSDT");
    assert_eq!(body["connection"], "CONNECTED");
    assert_eq!(body["samples"], 6);

    let text = reqwest::get(format!("http://{}/metrics", addr))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(text.contains("market_pulse_ticks_dropped_total"));

    let _ = connection.shutdown().await;
    let _ = handle.shutdown().await;
    timeout(WAIT, coordinator_task).await.unwrap().unwrap();
    timeout(WAIT, connection_task).await.unwrap().unwrap();
}
