//! Core data types for the synchronisation layer
//!
//! Candle times are epoch seconds, sample and ticker times epoch
//! milliseconds / UTC, matching what the providers deliver.
use crate::error::SyncError;
use chrono::{DateTime, Utc};
use derive_more::{Constructor, Display};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::str::FromStr;

const MAX_SYMBOL_LEN: usize = 20;

/// Quote assets recognised when splitting a pair into base/quote.
const QUOTE_ASSETS: [&str; 6] = ["USDT", "USDC", "FDUSD", "BUSD", "USD", "BTC"];

/// Exchange trading pair, e.g. `BTCUSDT`.
///
/// Always upper-case ASCII alphanumeric.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Display, Serialize, Deserialize)]
#[serde(try_from = "String")]
pub struct Symbol(SmolStr);

impl Symbol {
    /// Parse and normalise a symbol (trimmed, upper-cased).
    pub fn parse(input: &str) -> Result<Self, SyncError> {
        let trimmed = input.trim();
        let invalid = |reason: &str| SyncError::SymbolInvalid {
            symbol: input.to_string(),
            reason: reason.to_string(),
        };

        if trimmed.is_empty() {
            return Err(invalid("empty symbol"));
        }
        if trimmed.len() > MAX_SYMBOL_LEN {
            return Err(invalid("symbol too long"));
        }
        if !trimmed.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(invalid("symbol must be ASCII alphanumeric"));
        }

        Ok(Self(SmolStr::new(trimmed.to_ascii_uppercase())))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Lower-case form used in stream identifiers (`btcusdt@ticker`).
    pub fn stream_name(&self) -> String {
        self.0.to_ascii_lowercase()
    }

    /// Split off a known quote asset: `BTCUSDT` -> `Some(("BTC", "USDT"))`.
    pub fn split_quote(&self) -> Option<(&str, &str)> {
        let symbol = self.as_str();
        QUOTE_ASSETS.iter().find_map(|quote| {
            symbol
                .strip_suffix(quote)
                .filter(|base| !base.is_empty())
                .map(|base| (base, *quote))
        })
    }
}

impl FromStr for Symbol {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Symbol {
    type Error = SyncError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl AsRef<str> for Symbol {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

/// OHLCV record for one time bucket.
#[derive(Debug, Clone, Copy, PartialEq, Constructor, Serialize, Deserialize)]
pub struct Candle {
    /// Bucket open time, epoch seconds
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// All price and volume fields are finite numbers.
    pub fn is_finite(&self) -> bool {
        self.open.is_finite()
            && self.high.is_finite()
            && self.low.is_finite()
            && self.close.is_finite()
            && self.volume.is_finite()
    }
}

/// Latest 24h ticker state for one watched symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickerSnapshot {
    pub symbol: Symbol,
    pub price: f64,
    pub price_change_24h: f64,
    pub price_change_percent_24h: f64,
    pub volume_24h: f64,
    /// Exchange event time
    pub timestamp: DateTime<Utc>,
}

/// One price observation inside a growth window.
#[derive(Debug, Clone, Copy, PartialEq, Constructor)]
pub struct PriceSample {
    pub price: f64,
    /// Epoch milliseconds
    pub timestamp: i64,
}

/// Candle bucket width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display)]
pub enum Interval {
    #[default]
    #[display("1m")]
    OneMinute,
    #[display("5m")]
    FiveMinutes,
    #[display("15m")]
    FifteenMinutes,
    #[display("1h")]
    OneHour,
    #[display("4h")]
    FourHours,
    #[display("1d")]
    OneDay,
}

impl Interval {
    /// Binance REST and stream notation.
    pub fn as_binance(&self) -> &'static str {
        match self {
            Interval::OneMinute => "1m",
            Interval::FiveMinutes => "5m",
            Interval::FifteenMinutes => "15m",
            Interval::OneHour => "1h",
            Interval::FourHours => "4h",
            Interval::OneDay => "1d",
        }
    }

    /// Bybit v5 notation (minutes, or `D`).
    pub fn as_bybit(&self) -> &'static str {
        match self {
            Interval::OneMinute => "1",
            Interval::FiveMinutes => "5",
            Interval::FifteenMinutes => "15",
            Interval::OneHour => "60",
            Interval::FourHours => "240",
            Interval::OneDay => "D",
        }
    }

    pub fn seconds(&self) -> i64 {
        match self {
            Interval::OneMinute => 60,
            Interval::FiveMinutes => 5 * 60,
            Interval::FifteenMinutes => 15 * 60,
            Interval::OneHour => 60 * 60,
            Interval::FourHours => 4 * 60 * 60,
            Interval::OneDay => 24 * 60 * 60,
        }
    }
}

impl FromStr for Interval {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "1m" | "1" => Ok(Interval::OneMinute),
            "5m" | "5" => Ok(Interval::FiveMinutes),
            "15m" | "15" => Ok(Interval::FifteenMinutes),
            "1h" | "60" => Ok(Interval::OneHour),
            "4h" | "240" => Ok(Interval::FourHours),
            "1d" | "D" => Ok(Interval::OneDay),
            other => Err(format!("unsupported interval: {other}")),
        }
    }
}
