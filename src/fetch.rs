//! Pull-based history and price source
//!
//! The REST side of the feed answers in a few shapes: a `{success, data}`
//! envelope, a bare `{history}` object, or a flat price quote. Everything is
//! normalized here so the rest of the crate only sees [`Sample`] and
//! [`PriceQuote`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{FeedError, Result};
use crate::history::Sample;

/// Timestamps above this are taken to be milliseconds
const MILLIS_THRESHOLD: i64 = 100_000_000_000;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Current price with the 24h statistics the feed reports alongside it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceQuote {
    pub price: f64,
    pub change_24h: Option<f64>,
    pub high_24h: Option<f64>,
    pub low_24h: Option<f64>,
    pub volume_24h: Option<f64>,
}

impl PriceQuote {
    /// Sample for the polling fallback, stamped with the poll time
    ///
    /// The 24h volume is a rolling total, so the sample carries none.
    pub fn to_sample(&self, timestamp: i64) -> Sample {
        Sample::tick(timestamp, self.price, 0.0)
    }
}

/// Source of history snapshots and current prices
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HistorySource: Send + Sync {
    /// Samples covering the last `lookback_hours` for `instrument`, oldest first
    async fn fetch_history(&self, instrument: &str, lookback_hours: u32) -> Result<Vec<Sample>>;

    async fn fetch_current_price(&self, instrument: &str) -> Result<PriceQuote>;
}

/// [`HistorySource`] backed by the feed's REST API
pub struct HttpHistorySource {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpHistorySource {
    pub fn new(endpoint: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }

    async fn get_json(&self, url: &str) -> Result<Value> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FeedError::RestApiError(format!(
                "{} returned {}",
                url, status
            )));
        }
        Ok(response.json::<Value>().await?)
    }
}

#[async_trait]
impl HistorySource for HttpHistorySource {
    async fn fetch_history(&self, instrument: &str, lookback_hours: u32) -> Result<Vec<Sample>> {
        let url = format!(
            "{}/history/{}?hours={}",
            self.endpoint, instrument, lookback_hours
        );
        info!(instrument = %instrument, url = %url, "Fetching price history");

        let body = self.get_json(&url).await?;
        let samples = normalize_history(body)?;
        debug!(instrument = %instrument, count = samples.len(), "History fetched");
        Ok(samples)
    }

    async fn fetch_current_price(&self, instrument: &str) -> Result<PriceQuote> {
        let url = format!("{}/price/{}", self.endpoint, instrument);
        let body = self.get_json(&url).await?;
        normalize_quote(body)
    }
}

/// Strip the `{success, data}` envelope if present
fn unwrap_envelope(body: Value) -> Result<Value> {
    let Value::Object(mut map) = body else {
        return Ok(body);
    };
    match map.get("success").and_then(Value::as_bool) {
        Some(false) => {
            let reason = map
                .get("error")
                .or_else(|| map.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("request was not successful");
            Err(FeedError::RestApiError(reason.to_string()))
        }
        Some(true) => Ok(map.remove("data").unwrap_or(Value::Null)),
        None => Ok(Value::Object(map)),
    }
}

/// Number or numeric string
fn number(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn timestamp(value: Option<&Value>) -> Option<i64> {
    let raw = match value? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .ok()
            .or_else(|| {
                chrono::DateTime::parse_from_rfc3339(s.trim())
                    .ok()
                    .map(|dt| dt.timestamp())
            }),
        _ => None,
    }?;
    Some(if raw > MILLIS_THRESHOLD { raw / 1000 } else { raw })
}

fn parse_sample(entry: &Value) -> Option<Sample> {
    let ts = timestamp(entry.get("timestamp").or_else(|| entry.get("time")))?;
    let price = number(entry.get("price").or_else(|| entry.get("close")))?;
    let sample = Sample {
        timestamp: ts,
        price,
        high: number(entry.get("high")).unwrap_or(price),
        low: number(entry.get("low")).unwrap_or(price),
        volume: number(entry.get("volume")).unwrap_or(0.0),
    };
    sample.is_valid().then_some(sample)
}

/// Normalize a history response into samples
///
/// Entries missing a timestamp or a positive price are dropped; high and low
/// default to the price and volume to zero. Ordering and deduplication are
/// left to [`crate::history::HistoryBuffer::replace`].
pub fn normalize_history(body: Value) -> Result<Vec<Sample>> {
    let payload = unwrap_envelope(body)?;
    let entries = match &payload {
        Value::Array(entries) => entries.as_slice(),
        Value::Object(map) => match map.get("history") {
            Some(Value::Array(entries)) => entries.as_slice(),
            _ => {
                return Err(FeedError::MalformedResponse(
                    "history response has no history array".to_string(),
                ))
            }
        },
        _ => {
            return Err(FeedError::MalformedResponse(
                "history response is not an object".to_string(),
            ))
        }
    };

    let samples: Vec<Sample> = entries.iter().filter_map(parse_sample).collect();
    let dropped = entries.len() - samples.len();
    if dropped > 0 {
        warn!(dropped, "Dropped invalid history entries");
    }
    Ok(samples)
}

/// Normalize a current-price response
pub fn normalize_quote(body: Value) -> Result<PriceQuote> {
    let payload = unwrap_envelope(body)?;
    let price = number(payload.get("price"))
        .filter(|p| p.is_finite() && *p > 0.0)
        .ok_or_else(|| FeedError::MalformedResponse("quote has no valid price".to_string()))?;
    Ok(PriceQuote {
        price,
        change_24h: number(payload.get("change_24h")),
        high_24h: number(payload.get("high_24h")),
        low_24h: number(payload.get("low_24h")),
        volume_24h: number(payload.get("volume_24h")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_history_envelope_and_bare_shapes_agree() {
        let history = json!([
            {"timestamp": 1, "price": 100.0, "volume": 2.0},
            {"timestamp": 2, "price": "101.5", "high": 102.0, "low": 101.0}
        ]);
        let enveloped = normalize_history(json!({"success": true, "data": {"history": history}})).unwrap();
        let bare = normalize_history(json!({"history": history})).unwrap();

        assert_eq!(enveloped, bare);
        assert_eq!(enveloped.len(), 2);
        assert_eq!(enveloped[0].high, 100.0);
        assert_eq!(enveloped[0].volume, 2.0);
        assert_eq!(enveloped[1].price, 101.5);
        assert_eq!(enveloped[1].volume, 0.0);
    }

    #[test]
    fn test_history_drops_invalid_entries() {
        let samples = normalize_history(json!({"history": [
            {"timestamp": 1, "price": 0.0},
            {"timestamp": 2, "price": -5},
            {"price": 100.0},
            {"timestamp": 1672531200000i64, "price": 100.0}
        ]}))
        .unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].timestamp, 1672531200);
    }

    #[test]
    fn test_unsuccessful_envelope_is_error() {
        let err = normalize_history(json!({"success": false, "error": "unknown symbol"})).unwrap_err();
        assert!(matches!(err, FeedError::RestApiError(msg) if msg == "unknown symbol"));
        assert!(matches!(
            normalize_history(json!({"success": true, "data": {}})),
            Err(FeedError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_quote_shapes() {
        let quote = normalize_quote(json!({
            "success": true,
            "data": {"price": "50000", "change_24h": -1.5, "volume_24h": 12.0}
        }))
        .unwrap();
        assert_eq!(quote.price, 50000.0);
        assert_eq!(quote.change_24h, Some(-1.5));
        assert_eq!(quote.high_24h, None);
        assert_eq!(quote.to_sample(7), Sample::tick(7, 50000.0, 0.0));

        assert!(normalize_quote(json!({"price": null})).is_err());
    }

    #[tokio::test]
    async fn test_mock_source() {
        let mut source = MockHistorySource::new();
        source
            .expect_fetch_history()
            .withf(|instrument, hours| instrument == "BTCUSDT" && *hours == 24)
            .returning(|_, _| Ok(vec![Sample::tick(1, 100.0, 1.0)]));

        let samples = source.fetch_history("BTCUSDT", 24).await.unwrap();
        assert_eq!(samples.len(), 1);
    }
}
