//! Historical candle retrieval with ordered provider fallback.
//!
//! Providers are tried in order (Binance, Bybit, CoinGecko by default), each
//! under its own deadline. The first success wins; failures are accumulated
//! so exhaustion can report every reason.
use crate::{
    config::{HistoryConfig, ProviderConfig},
    error::{FailureKind, ProviderError, SyncError},
    types::{Candle, Interval, Symbol},
};
use async_trait::async_trait;
use reqwest::StatusCode;
use std::{sync::Arc, time::Duration};
use tracing::{debug, error, info, warn};
use url::Url;

pub mod binance;
pub mod bybit;
pub mod coingecko;

pub use binance::BinanceKlines;
pub use bybit::BybitKlines;
pub use coingecko::CoinGeckoOhlc;

/// Parameters for one history page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRequest {
    pub symbol: Symbol,
    pub interval: Interval,
    /// Exclusive upper bound, epoch seconds. `None` requests the latest page.
    pub end_time: Option<i64>,
}

impl HistoryRequest {
    /// Upper bound in provider milliseconds, excluding the boundary bucket itself.
    pub fn end_time_ms(&self) -> Option<i64> {
        self.end_time
            .map(|end_time| end_time.saturating_mul(1000).saturating_sub(1))
    }
}

/// Candles from the provider that answered, sorted ascending.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryBatch {
    pub candles: Vec<Candle>,
    pub source: &'static str,
}

/// One REST candle source.
#[async_trait]
pub trait HistoryProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Deadline for the complete request, enforced by the fetcher.
    fn timeout(&self) -> Duration;

    async fn fetch(&self, request: &HistoryRequest) -> Result<Vec<Candle>, ProviderError>;
}

/// Request building and body decoding for one provider encoding.
pub trait KlineDecoder: Send + Sync + 'static {
    const NAME: &'static str;

    fn url(&self, config: &ProviderConfig, request: &HistoryRequest) -> Result<Url, ProviderError>;

    fn decode(&self, body: &[u8]) -> Result<Vec<Candle>, ProviderError>;
}

/// [`HistoryProvider`] issuing a single HTTP GET and decoding the body with `D`.
#[derive(Debug, Clone)]
pub struct RestProvider<D> {
    client: reqwest::Client,
    config: ProviderConfig,
    decoder: D,
}

impl<D> RestProvider<D> {
    pub fn new(client: reqwest::Client, config: ProviderConfig, decoder: D) -> Self {
        Self {
            client,
            config,
            decoder,
        }
    }
}

#[async_trait]
impl<D: KlineDecoder> HistoryProvider for RestProvider<D> {
    fn name(&self) -> &'static str {
        D::NAME
    }

    fn timeout(&self) -> Duration {
        self.config.timeout
    }

    async fn fetch(&self, request: &HistoryRequest) -> Result<Vec<Candle>, ProviderError> {
        let url = self.decoder.url(&self.config, request)?;
        debug!(provider = D::NAME, %url, "requesting candles");

        let response = self
            .client
            .get(url)
            .timeout(self.config.timeout)
            .send()
            .await
            .map_err(|e| ProviderError::unavailable(format!("HTTP request failed: {e}")))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| ProviderError::unavailable(format!("body read failed: {e}")))?;

        interpret_response(&self.decoder, status, &body)
    }
}

/// Classify an HTTP response and decode it on success.
///
/// 408/429 and 5xx are transient; any other 4xx means the provider rejects
/// the symbol.
pub fn interpret_response<D: KlineDecoder>(
    decoder: &D,
    status: StatusCode,
    body: &[u8],
) -> Result<Vec<Candle>, ProviderError> {
    if status.is_success() {
        return decoder.decode(body);
    }

    let detail = String::from_utf8_lossy(&body[..body.len().min(200)]).into_owned();
    match status {
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => Err(
            ProviderError::unavailable(format!("HTTP error: {status} {detail}")),
        ),
        status if status.is_client_error() => Err(ProviderError::symbol_invalid(format!(
            "HTTP error: {status} {detail}"
        ))),
        status => Err(ProviderError::unavailable(format!("HTTP error: {status}"))),
    }
}

/// Fetches candle history through an ordered list of providers.
#[derive(Clone)]
pub struct HistoricalDataFetcher {
    providers: Vec<Arc<dyn HistoryProvider>>,
    interval: Interval,
}

impl std::fmt::Debug for HistoricalDataFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoricalDataFetcher")
            .field("providers", &self.provider_names())
            .field("interval", &self.interval)
            .finish()
    }
}

impl HistoricalDataFetcher {
    pub fn new(providers: Vec<Arc<dyn HistoryProvider>>, interval: Interval) -> Self {
        Self {
            providers,
            interval,
        }
    }

    /// Binance, then Bybit, then CoinGecko, sharing one HTTP client.
    pub fn from_config(config: &HistoryConfig, interval: Interval) -> Self {
        let client = reqwest::Client::new();
        let providers: Vec<Arc<dyn HistoryProvider>> = vec![
            Arc::new(RestProvider::new(
                client.clone(),
                config.binance.clone(),
                BinanceKlines,
            )),
            Arc::new(RestProvider::new(
                client.clone(),
                config.bybit.clone(),
                BybitKlines,
            )),
            Arc::new(RestProvider::new(
                client,
                config.coingecko.clone(),
                CoinGeckoOhlc,
            )),
        ];
        Self::new(providers, interval)
    }

    pub fn provider_names(&self) -> Vec<&'static str> {
        self.providers.iter().map(|provider| provider.name()).collect()
    }

    pub fn interval(&self) -> Interval {
        self.interval
    }

    /// Fetch one page of candles, newest first page when `end_time` is `None`.
    ///
    /// With `end_time` set every returned candle satisfies `time < end_time`.
    /// An empty batch means the provider has nothing older.
    pub async fn fetch(
        &self,
        symbol: &Symbol,
        end_time: Option<i64>,
    ) -> Result<HistoryBatch, SyncError> {
        let request = HistoryRequest {
            symbol: symbol.clone(),
            interval: self.interval,
            end_time,
        };
        let mut failures = Vec::with_capacity(self.providers.len());

        for provider in &self.providers {
            let name = provider.name();
            let timeout = provider.timeout();
            debug!(provider = name, %symbol, ?end_time, "fetching history");

            let outcome = match tokio::time::timeout(timeout, provider.fetch(&request)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(ProviderError::unavailable(format!(
                    "timed out after {timeout:?}"
                ))),
            };

            match outcome {
                Ok(candles) => {
                    let candles = normalise(candles, end_time);
                    info!(provider = name, %symbol, candles = candles.len(), "history fetched");
                    return Ok(HistoryBatch {
                        candles,
                        source: name,
                    });
                }
                Err(failure) => {
                    warn!(provider = name, %symbol, %failure, "history provider failed, falling back");
                    failures.push(failure.into_failure(name));
                }
            }
        }

        let unanimous_rejection = !failures.is_empty()
            && failures
                .iter()
                .all(|failure| failure.kind == FailureKind::SymbolInvalid);

        if unanimous_rejection {
            let reason = failures
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            error!(%symbol, %reason, "every history provider rejected symbol");
            return Err(SyncError::SymbolInvalid {
                symbol: symbol.to_string(),
                reason,
            });
        }

        let error = SyncError::ProviderUnavailable { failures };
        error!(%symbol, %error, "history providers exhausted");
        Err(error)
    }
}

fn normalise(mut candles: Vec<Candle>, end_time: Option<i64>) -> Vec<Candle> {
    if let Some(end_time) = end_time {
        candles.retain(|candle| candle.time < end_time);
    }
    candles.sort_by_key(|candle| candle.time);
    candles
}

/// Convert a provider millisecond open time to candle seconds.
pub(crate) fn ms_to_secs(open_time_ms: i64) -> i64 {
    open_time_ms.div_euclid(1000)
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Provider that replays a canned HTTP response through a real decoder.
    pub struct CannedProvider<D> {
        pub name: &'static str,
        pub status: StatusCode,
        pub body: String,
        pub decoder: D,
        pub delay: Option<Duration>,
        pub calls: AtomicUsize,
    }

    impl<D> CannedProvider<D> {
        pub fn new(name: &'static str, status: StatusCode, body: impl Into<String>, decoder: D) -> Self {
            Self {
                name,
                status,
                body: body.into(),
                decoder,
                delay: None,
                calls: AtomicUsize::new(0),
            }
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl<D: KlineDecoder> HistoryProvider for CannedProvider<D> {
        fn name(&self) -> &'static str {
            self.name
        }

        fn timeout(&self) -> Duration {
            Duration::from_millis(50)
        }

        async fn fetch(&self, _: &HistoryRequest) -> Result<Vec<Candle>, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            interpret_response(&self.decoder, self.status, self.body.as_bytes())
        }
    }

    /// Binance kline body with `count` one-minute rows starting at `start_secs`.
    pub fn binance_body(start_secs: i64, count: i64) -> String {
        let rows = (0..count)
            .map(|i| {
                let open_ms = (start_secs + i * 60) * 1000;
                format!(
                    r#"[{open_ms},"100.0","101.0","99.0","100.5","12.5",{},"1250.0",42,"6.0","600.0","0"]"#,
                    open_ms + 59_999
                )
            })
            .collect::<Vec<_>>()
            .join(",");
        format!("[{rows}]")
    }
}
