//! Live channel wire protocol
//!
//! JSON messages tagged by `type`. Numeric fields are accepted either as JSON
//! numbers or as numeric strings, since feeds disagree on which they send.

use serde::{Deserialize, Deserializer, Serialize};

use crate::history::Sample;

/// Messages the client sends on the live channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    SwitchSymbol { symbol: String },
    Subscribe { channels: Vec<String> },
    /// Liveness probe; the server answers with `pong`
    Ping,
}

impl Outbound {
    pub fn switch_symbol(symbol: &str) -> Self {
        Outbound::SwitchSymbol {
            symbol: symbol.to_string(),
        }
    }

    /// Short name for logs and metrics labels
    pub fn kind(&self) -> &'static str {
        match self {
            Outbound::SwitchSymbol { .. } => "switch_symbol",
            Outbound::Subscribe { .. } => "subscribe",
            Outbound::Ping => "ping",
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Which feed stream a price update came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamType {
    Ticker,
    Trade,
}

/// Payload of a `price_update`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PriceData {
    #[serde(deserialize_with = "deserialize_f64")]
    pub price: f64,

    #[serde(default, deserialize_with = "deserialize_opt_f64")]
    pub change_24h: Option<f64>,

    #[serde(default, deserialize_with = "deserialize_opt_f64")]
    pub high_24h: Option<f64>,

    #[serde(default, deserialize_with = "deserialize_opt_f64")]
    pub low_24h: Option<f64>,

    #[serde(default, deserialize_with = "deserialize_opt_f64")]
    pub volume_24h: Option<f64>,

    #[serde(default, deserialize_with = "deserialize_opt_f64")]
    pub bid: Option<f64>,

    #[serde(default, deserialize_with = "deserialize_opt_f64")]
    pub ask: Option<f64>,

    /// Trade size (trade stream only)
    #[serde(default, deserialize_with = "deserialize_opt_f64")]
    pub quantity: Option<f64>,

    /// Trade time in milliseconds
    #[serde(default)]
    pub trade_time: Option<i64>,
}

/// Messages the server sends on the live channel
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inbound {
    PriceUpdate {
        symbol: String,
        #[serde(default = "default_stream_type")]
        stream_type: StreamType,
        data: PriceData,
    },
    SymbolSwitched {
        symbol: String,
        #[serde(default)]
        cached: bool,
    },
    Connection {
        #[serde(default)]
        message: String,
        #[serde(default)]
        supported_symbols: Vec<String>,
    },
    Error {
        message: String,
    },
    Pong,
}

fn default_stream_type() -> StreamType {
    StreamType::Ticker
}

impl Inbound {
    /// Parse a raw text frame; unknown types and bad JSON are errors
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

impl PriceData {
    /// Convert a live update into a history sample
    ///
    /// Uses the trade time when present, else `received_at` (seconds). Only
    /// trade quantity is per-sample volume; `volume_24h` is a rolling total,
    /// so ticker updates carry no volume.
    pub fn to_sample(&self, received_at: i64) -> Sample {
        let timestamp = self
            .trade_time
            .map(|ms| ms.div_euclid(1000))
            .unwrap_or(received_at);
        let volume = self.quantity.unwrap_or(0.0);
        Sample::tick(timestamp, self.price, volume)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrString {
    Number(f64),
    Text(String),
}

impl NumberOrString {
    fn into_f64<E: serde::de::Error>(self) -> Result<f64, E> {
        match self {
            NumberOrString::Number(v) => Ok(v),
            NumberOrString::Text(s) => s.trim().parse().map_err(E::custom),
        }
    }
}

/// Custom deserializer for f64 from a number or numeric string
pub(crate) fn deserialize_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    NumberOrString::deserialize(deserializer)?.into_f64()
}

/// Optional variant of [`deserialize_f64`]; `null` maps to `None`
pub(crate) fn deserialize_opt_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<NumberOrString>::deserialize(deserializer)?
        .map(NumberOrString::into_f64)
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_price_update() {
        let raw = r#"{
            "type": "price_update",
            "symbol": "BTCUSDT",
            "stream_type": "trade",
            "data": {
                "price": "50000.50",
                "change_24h": 1.25,
                "volume_24h": "1234.5",
                "quantity": "0.5",
                "trade_time": 1672531200123
            }
        }"#;

        let msg = Inbound::parse(raw).unwrap();
        if let Inbound::PriceUpdate {
            symbol,
            stream_type,
            data,
        } = msg
        {
            assert_eq!(symbol, "BTCUSDT");
            assert_eq!(stream_type, StreamType::Trade);
            assert_eq!(data.price, 50000.5);
            assert_eq!(data.change_24h, Some(1.25));
            assert_eq!(data.bid, None);

            let sample = data.to_sample(0);
            assert_eq!(sample.timestamp, 1672531200);
            assert_eq!(sample.volume, 0.5);
        } else {
            panic!("Expected PriceUpdate");
        }
    }

    #[test]
    fn test_ticker_sample_uses_receive_time() {
        let raw = r#"{"type":"price_update","symbol":"ETHUSDT","data":{"price":3000,"volume_24h":10}}"#;
        let Inbound::PriceUpdate { stream_type, data, .. } = Inbound::parse(raw).unwrap() else {
            panic!("Expected PriceUpdate");
        };
        assert_eq!(stream_type, StreamType::Ticker);
        let sample = data.to_sample(42);
        assert_eq!(sample.timestamp, 42);
        assert_eq!(sample.volume, 0.0);
    }

    #[test]
    fn test_ticker_tick_does_not_dominate_vwap() {
        use crate::indicators::{vwap, IndicatorThresholds, Signal};

        let mut samples: Vec<Sample> = (1..=10)
            .map(|t| Sample::tick(t, 100.0 + t as f64, 1.0))
            .collect();
        let raw = r#"{"type":"price_update","symbol":"BTCUSDT","data":{"price":150,"volume_24h":1000000}}"#;
        let Inbound::PriceUpdate { data, .. } = Inbound::parse(raw).unwrap() else {
            panic!("Expected PriceUpdate");
        };
        samples.push(data.to_sample(11));

        let out = *vwap(&samples, &IndicatorThresholds::default()).ready().unwrap();
        assert_eq!(out.vwap, 105.5);
        assert!(out.deviation_pct > 40.0);
        assert_eq!(out.signal, Signal::Buy);
    }

    #[test]
    fn test_parse_control_messages() {
        let switched = Inbound::parse(r#"{"type":"symbol_switched","symbol":"ETHUSDT","cached":true}"#).unwrap();
        assert_eq!(
            switched,
            Inbound::SymbolSwitched {
                symbol: "ETHUSDT".to_string(),
                cached: true
            }
        );

        let hello = Inbound::parse(
            r#"{"type":"connection","message":"welcome","supported_symbols":["BTCUSDT","ETHUSDT"]}"#,
        )
        .unwrap();
        assert!(matches!(hello, Inbound::Connection { supported_symbols, .. } if supported_symbols.len() == 2));

        assert_eq!(Inbound::parse(r#"{"type":"pong"}"#).unwrap(), Inbound::Pong);
    }

    #[test]
    fn test_unknown_type_and_garbage_are_errors() {
        assert!(Inbound::parse(r#"{"type":"mystery"}"#).is_err());
        assert!(Inbound::parse("not json").is_err());
        assert!(Inbound::parse(r#"{"type":"price_update","symbol":"X","data":{"price":"abc"}}"#).is_err());
    }

    #[test]
    fn test_outbound_encoding() {
        assert_eq!(
            Outbound::switch_symbol("ETHUSDT").to_json().unwrap(),
            r#"{"type":"switch_symbol","symbol":"ETHUSDT"}"#
        );
        assert_eq!(Outbound::Ping.to_json().unwrap(), r#"{"type":"ping"}"#);
        let subscribe = Outbound::Subscribe {
            channels: vec!["ticker".to_string(), "trade".to_string()],
        };
        assert_eq!(
            subscribe.to_json().unwrap(),
            r#"{"type":"subscribe","channels":["ticker","trade"]}"#
        );
    }
}
