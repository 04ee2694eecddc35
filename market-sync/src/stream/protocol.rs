use super::{StreamPlan, StreamUpdate};
use crate::{
    config::{StreamConfig, StreamVenue},
    de::de_str,
    types::{Candle, Interval, Symbol, TickerSnapshot},
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use std::{fmt::Debug, sync::Arc};
use thiserror::Error;
use tracing::warn;
use url::Url;

/// Bybit accepts at most this many topics per subscribe request.
const BYBIT_MAX_ARGS_PER_REQUEST: usize = 10;

/// Failure to turn a text frame into [`StreamUpdate`]s.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown stream: {0}")]
    UnknownStream(String),

    #[error("invalid payload: {0}")]
    Invalid(String),

    #[error("request rejected by server: {0}")]
    Rejected(String),
}

/// Wire protocol of one streaming venue.
pub trait StreamProtocol: Send + Sync + Debug {
    fn venue(&self) -> StreamVenue;

    /// Channel identifiers for `plan`, the kline channel first.
    fn identifiers(&self, plan: &StreamPlan, interval: Interval) -> Vec<String>;

    fn url(&self, base: &str, identifiers: &[String]) -> Result<Url, url::ParseError>;

    /// Text frames sent right after the socket opens.
    fn subscribe_messages(&self, identifiers: &[String]) -> Vec<String>;

    /// Application level keepalive text; `None` sends WebSocket ping frames.
    fn ping_message(&self) -> Option<String> {
        None
    }

    /// Decode a text frame. Control frames decode to nothing.
    fn parse(&self, text: &str) -> Result<Vec<StreamUpdate>, ParseError>;
}

impl StreamVenue {
    pub fn protocol(&self) -> Arc<dyn StreamProtocol> {
        match self {
            StreamVenue::Binance => Arc::new(BinanceCombined),
            StreamVenue::Bybit => Arc::new(BybitSpot),
        }
    }
}

/// URL and identifiers to connect with, dropping identifiers from the tail
/// until the URL fits `config.max_url_len`.
pub fn fit_url(
    protocol: &dyn StreamProtocol,
    config: &StreamConfig,
    plan: &StreamPlan,
    interval: Interval,
) -> Result<(Url, Vec<String>), url::ParseError> {
    let mut identifiers = protocol.identifiers(plan, interval);
    let requested = identifiers.len();
    let mut url = protocol.url(&config.url, &identifiers)?;

    while url.as_str().len() > config.max_url_len && identifiers.len() > 1 {
        identifiers.pop();
        url = protocol.url(&config.url, &identifiers)?;
    }

    if identifiers.len() < requested {
        warn!(
            requested,
            kept = identifiers.len(),
            max_url_len = config.max_url_len,
            "stream URL too long, dropped trailing streams"
        );
    }

    Ok((url, identifiers))
}

fn timestamp(millis: i64) -> Result<DateTime<Utc>, ParseError> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| ParseError::Invalid(format!("timestamp out of range: {millis}")))
}

/// Binance combined stream, every channel listed in the connect URL.
///
/// See docs: <https://developers.binance.com/docs/binance-spot-api-docs/web-socket-streams>
#[derive(Debug, Clone, Copy, Default)]
pub struct BinanceCombined;

#[derive(Debug, Deserialize)]
struct BinanceEnvelope {
    stream: String,
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct BinanceTicker {
    #[serde(rename = "E")]
    event_time: i64,
    #[serde(rename = "s")]
    symbol: Symbol,
    #[serde(rename = "c", deserialize_with = "de_str")]
    last_price: f64,
    #[serde(rename = "p", deserialize_with = "de_str")]
    price_change: f64,
    #[serde(rename = "P", deserialize_with = "de_str")]
    price_change_percent: f64,
    #[serde(rename = "v", deserialize_with = "de_str")]
    volume: f64,
}

#[derive(Debug, Deserialize)]
struct BinanceKlineEvent {
    #[serde(rename = "s")]
    symbol: Symbol,
    #[serde(rename = "k")]
    kline: BinanceKlineBody,
}

#[derive(Debug, Deserialize)]
struct BinanceKlineBody {
    #[serde(rename = "t")]
    open_time: i64,
    #[serde(rename = "o", deserialize_with = "de_str")]
    open: f64,
    #[serde(rename = "h", deserialize_with = "de_str")]
    high: f64,
    #[serde(rename = "l", deserialize_with = "de_str")]
    low: f64,
    #[serde(rename = "c", deserialize_with = "de_str")]
    close: f64,
    #[serde(rename = "v", deserialize_with = "de_str")]
    volume: f64,
    #[serde(rename = "x")]
    closed: bool,
}

impl StreamProtocol for BinanceCombined {
    fn venue(&self) -> StreamVenue {
        StreamVenue::Binance
    }

    fn identifiers(&self, plan: &StreamPlan, interval: Interval) -> Vec<String> {
        plan.kline
            .iter()
            .map(|symbol| format!("{}@kline_{}", symbol.stream_name(), interval.as_binance()))
            .chain(
                plan.tickers
                    .iter()
                    .map(|symbol| format!("{}@ticker", symbol.stream_name())),
            )
            .collect()
    }

    fn url(&self, base: &str, identifiers: &[String]) -> Result<Url, url::ParseError> {
        Url::parse(&format!(
            "{}/stream?streams={}",
            base.trim_end_matches('/'),
            identifiers.join("/")
        ))
    }

    fn subscribe_messages(&self, _: &[String]) -> Vec<String> {
        Vec::new()
    }

    fn parse(&self, text: &str) -> Result<Vec<StreamUpdate>, ParseError> {
        let envelope: BinanceEnvelope = serde_json::from_str(text)?;

        if envelope.stream.ends_with("@ticker") {
            let ticker: BinanceTicker = serde_json::from_value(envelope.data)?;
            return Ok(vec![StreamUpdate::Ticker(TickerSnapshot {
                timestamp: timestamp(ticker.event_time)?,
                symbol: ticker.symbol,
                price: ticker.last_price,
                price_change_24h: ticker.price_change,
                price_change_percent_24h: ticker.price_change_percent,
                volume_24h: ticker.volume,
            })]);
        }

        if envelope.stream.contains("@kline_") {
            let event: BinanceKlineEvent = serde_json::from_value(envelope.data)?;
            let k = event.kline;
            return Ok(vec![StreamUpdate::Kline {
                symbol: event.symbol,
                candle: Candle::new(
                    k.open_time.div_euclid(1000),
                    k.open,
                    k.high,
                    k.low,
                    k.close,
                    k.volume,
                ),
                closed: k.closed,
            }]);
        }

        Err(ParseError::UnknownStream(envelope.stream))
    }
}

/// Bybit v5 public spot, channels subscribed with `{"op":"subscribe"}` after connect.
///
/// See docs: <https://bybit-exchange.github.io/docs/v5/ws/connect>
#[derive(Debug, Clone, Copy, Default)]
pub struct BybitSpot;

#[derive(Debug, Deserialize)]
struct BybitFrame {
    #[serde(default)]
    topic: Option<String>,
    #[serde(default)]
    op: Option<String>,
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    ret_msg: Option<String>,
    #[serde(default)]
    ts: Option<i64>,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BybitTicker {
    symbol: Symbol,
    #[serde(deserialize_with = "de_str")]
    last_price: f64,
    #[serde(deserialize_with = "de_str")]
    prev_price24h: f64,
    /// Fraction, `0.0123` means 1.23%
    #[serde(deserialize_with = "de_str")]
    price24h_pcnt: f64,
    #[serde(deserialize_with = "de_str")]
    volume24h: f64,
}

#[derive(Debug, Deserialize)]
struct BybitKline {
    start: i64,
    #[serde(deserialize_with = "de_str")]
    open: f64,
    #[serde(deserialize_with = "de_str")]
    high: f64,
    #[serde(deserialize_with = "de_str")]
    low: f64,
    #[serde(deserialize_with = "de_str")]
    close: f64,
    #[serde(deserialize_with = "de_str")]
    volume: f64,
    confirm: bool,
}

impl StreamProtocol for BybitSpot {
    fn venue(&self) -> StreamVenue {
        StreamVenue::Bybit
    }

    fn identifiers(&self, plan: &StreamPlan, interval: Interval) -> Vec<String> {
        plan.kline
            .iter()
            .map(|symbol| format!("kline.{}.{}", interval.as_bybit(), symbol))
            .chain(plan.tickers.iter().map(|symbol| format!("tickers.{symbol}")))
            .collect()
    }

    fn url(&self, base: &str, _: &[String]) -> Result<Url, url::ParseError> {
        Url::parse(base)
    }

    fn subscribe_messages(&self, identifiers: &[String]) -> Vec<String> {
        identifiers
            .chunks(BYBIT_MAX_ARGS_PER_REQUEST)
            .map(|args| json!({ "op": "subscribe", "args": args }).to_string())
            .collect()
    }

    fn ping_message(&self) -> Option<String> {
        Some(json!({ "op": "ping" }).to_string())
    }

    fn parse(&self, text: &str) -> Result<Vec<StreamUpdate>, ParseError> {
        let frame: BybitFrame = serde_json::from_str(text)?;

        let Some(topic) = frame.topic else {
            return match (frame.op, frame.success) {
                (Some(op), Some(false)) => Err(ParseError::Rejected(format!(
                    "{op}: {}",
                    frame.ret_msg.unwrap_or_default()
                ))),
                (Some(_), _) => Ok(Vec::new()),
                (None, _) => Err(ParseError::Invalid("frame without topic or op".to_string())),
            };
        };

        if topic.starts_with("tickers.") {
            let ticker: BybitTicker = serde_json::from_value(frame.data)?;
            let event_time = frame
                .ts
                .ok_or_else(|| ParseError::Invalid("ticker frame without ts".to_string()))?;
            return Ok(vec![StreamUpdate::Ticker(TickerSnapshot {
                timestamp: timestamp(event_time)?,
                price_change_24h: ticker.last_price - ticker.prev_price24h,
                price_change_percent_24h: ticker.price24h_pcnt * 100.0,
                symbol: ticker.symbol,
                price: ticker.last_price,
                volume_24h: ticker.volume24h,
            })]);
        }

        if topic.starts_with("kline.") {
            let symbol = topic
                .rsplit('.')
                .next()
                .ok_or_else(|| ParseError::Invalid(topic.clone()))
                .and_then(|name| {
                    Symbol::parse(name).map_err(|e| ParseError::Invalid(e.to_string()))
                })?;
            let klines: Vec<BybitKline> = serde_json::from_value(frame.data)?;

            return Ok(klines
                .into_iter()
                .map(|k| StreamUpdate::Kline {
                    symbol: symbol.clone(),
                    candle: Candle::new(
                        k.start.div_euclid(1000),
                        k.open,
                        k.high,
                        k.low,
                        k.close,
                        k.volume,
                    ),
                    closed: k.confirm,
                })
                .collect());
        }

        Err(ParseError::UnknownStream(topic))
    }
}
