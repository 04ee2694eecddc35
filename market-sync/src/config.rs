//! Runtime configuration for the synchronisation layer
//!
//! Every value has a working default; `SyncConfig::from_env` layers
//! `MARKET_SYNC_*` environment overrides on top.
use crate::types::Interval;
use derive_more::Display;
use std::{str::FromStr, time::Duration};

/// Maximum simultaneously streamed ticker symbols.
pub const DEFAULT_SUBSCRIPTION_CAPACITY: usize = 12;

/// Batches smaller than this mean the provider has no older history.
pub const DEFAULT_MERGE_EXHAUSTED_THRESHOLD: usize = 100;

/// Rolling window used for growth percentages.
pub const DEFAULT_GROWTH_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Top level configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Candle interval for both REST history and the live kline channel
    pub interval: Interval,
    pub history: HistoryConfig,
    pub stream: StreamConfig,
    /// Maximum number of watched ticker symbols
    pub subscription_capacity: usize,
    pub growth_window: Duration,
    pub merge_exhausted_threshold: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval: Interval::default(),
            history: HistoryConfig::default(),
            stream: StreamConfig::default(),
            subscription_capacity: DEFAULT_SUBSCRIPTION_CAPACITY,
            growth_window: DEFAULT_GROWTH_WINDOW,
            merge_exhausted_threshold: DEFAULT_MERGE_EXHAUSTED_THRESHOLD,
        }
    }
}

impl SyncConfig {
    /// Defaults overridden by any `MARKET_SYNC_*` variables present in the environment.
    ///
    /// Unparseable values are ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Self::from_env`] but reading from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).map(|value| value.trim().to_string());

        let history = HistoryConfig {
            binance: ProviderConfig {
                base_url: get("MARKET_SYNC_BINANCE_URL").unwrap_or(defaults.history.binance.base_url),
                limit: parse_or(get("MARKET_SYNC_BINANCE_LIMIT"), defaults.history.binance.limit),
                ..defaults.history.binance
            },
            bybit: ProviderConfig {
                base_url: get("MARKET_SYNC_BYBIT_URL").unwrap_or(defaults.history.bybit.base_url),
                limit: parse_or(get("MARKET_SYNC_BYBIT_LIMIT"), defaults.history.bybit.limit),
                ..defaults.history.bybit
            },
            coingecko: ProviderConfig {
                base_url: get("MARKET_SYNC_COINGECKO_URL")
                    .unwrap_or(defaults.history.coingecko.base_url),
                ..defaults.history.coingecko
            },
        };

        let venue = parse_or(get("MARKET_SYNC_STREAM_VENUE"), defaults.stream.venue);
        let stream = StreamConfig {
            url: get("MARKET_SYNC_STREAM_URL").unwrap_or_else(|| venue.default_url().to_string()),
            venue,
            max_reconnect_attempts: parse_or(
                get("MARKET_SYNC_MAX_RECONNECTS"),
                defaults.stream.max_reconnect_attempts,
            ),
            ..defaults.stream
        };

        Self {
            interval: parse_or(get("MARKET_SYNC_INTERVAL"), defaults.interval),
            history,
            stream,
            subscription_capacity: parse_or(
                get("MARKET_SYNC_CAPACITY"),
                defaults.subscription_capacity,
            ),
            growth_window: get("MARKET_SYNC_GROWTH_WINDOW_SECS")
                .and_then(|value| value.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.growth_window),
            merge_exhausted_threshold: defaults.merge_exhausted_threshold,
        }
    }

    pub fn with_interval(mut self, interval: Interval) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_history(mut self, history: HistoryConfig) -> Self {
        self.history = history;
        self
    }

    pub fn with_stream(mut self, stream: StreamConfig) -> Self {
        self.stream = stream;
        self
    }

    /// Set maximum number of watched symbols
    pub fn with_subscription_capacity(mut self, capacity: usize) -> Self {
        self.subscription_capacity = capacity;
        self
    }

    pub fn with_growth_window(mut self, window: Duration) -> Self {
        self.growth_window = window;
        self
    }

    pub fn with_merge_exhausted_threshold(mut self, threshold: usize) -> Self {
        self.merge_exhausted_threshold = threshold;
        self
    }
}

fn parse_or<T: FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// Settings for one REST history provider.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderConfig {
    pub base_url: String,
    /// Candles requested per call (ignored by providers without a limit parameter)
    pub limit: u32,
    /// Hard deadline for the whole request, connect through body
    pub timeout: Duration,
}

impl ProviderConfig {
    pub fn new(base_url: impl Into<String>, limit: u32, timeout: Duration) -> Self {
        Self {
            base_url: base_url.into(),
            limit,
            timeout,
        }
    }
}

/// History providers, tried in field order: Binance, Bybit, CoinGecko.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryConfig {
    pub binance: ProviderConfig,
    pub bybit: ProviderConfig,
    pub coingecko: ProviderConfig,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            binance: ProviderConfig::new("https://api.binance.com", 1000, Duration::from_secs(10)),
            bybit: ProviderConfig::new("https://api.bybit.com", 200, Duration::from_secs(10)),
            coingecko: ProviderConfig::new(
                "https://api.coingecko.com",
                0,
                Duration::from_secs(15),
            ),
        }
    }
}

/// Live stream wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display)]
pub enum StreamVenue {
    /// Binance combined stream, symbols encoded in the URL
    #[default]
    Binance,
    /// Bybit v5 public spot, symbols sent as a subscribe message
    Bybit,
}

impl StreamVenue {
    pub fn default_url(&self) -> &'static str {
        match self {
            StreamVenue::Binance => "wss://stream.binance.com:9443",
            StreamVenue::Bybit => "wss://stream.bybit.com/v5/public/spot",
        }
    }
}

impl FromStr for StreamVenue {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "binance" => Ok(StreamVenue::Binance),
            "bybit" => Ok(StreamVenue::Bybit),
            other => Err(format!("unknown stream venue: {other}")),
        }
    }
}

/// Live WebSocket configuration
#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    pub venue: StreamVenue,
    /// Base URL, stream identifiers are appended for venues that encode them in the URL
    pub url: String,
    /// Longest URL a connect attempt may use
    pub max_url_len: usize,
    pub connect_timeout: Duration,
    /// Close the socket when nothing at all arrives for this long
    pub idle_timeout: Duration,
    pub ping_interval: Duration,
    pub max_reconnect_attempts: u32,
    /// Backoff base after a close frame with a non-normal code
    pub reconnect_base_delay: Duration,
    /// Backoff base after an abnormal close (1006, transport failure, timeout)
    pub abnormal_reconnect_base_delay: Duration,
    pub max_reconnect_delay: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self::new(StreamVenue::default())
    }
}

impl StreamConfig {
    /// Default settings for the given venue
    pub fn new(venue: StreamVenue) -> Self {
        Self {
            venue,
            url: venue.default_url().to_string(),
            max_url_len: 2000,
            connect_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(120),
            ping_interval: Duration::from_secs(30),
            max_reconnect_attempts: 5,
            reconnect_base_delay: Duration::from_secs(3),
            abnormal_reconnect_base_delay: Duration::from_secs(5),
            max_reconnect_delay: Duration::from_secs(30),
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_max_url_len(mut self, len: usize) -> Self {
        self.max_url_len = len;
        self
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }
}
