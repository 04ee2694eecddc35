use super::{HistoryRequest, KlineDecoder, ms_to_secs};
use crate::{config::ProviderConfig, error::ProviderError, types::Candle};
use chrono::Utc;
use url::Url;

/// `days` values the OHLC endpoint accepts.
const OHLC_DAYS: [i64; 5] = [1, 7, 14, 30, 90];

/// CoinGecko OHLC: `GET /api/v3/coins/{id}/ohlc`.
///
/// Last-resort source. Carries no volume and buckets are coarser than the
/// requested interval. Only USD-quoted pairs map onto a coin id.
///
/// See docs: <https://docs.coingecko.com/reference/coins-id-ohlc>
#[derive(Debug, Clone, Copy, Default)]
pub struct CoinGeckoOhlc;

/// Coin id for a base asset ticker.
pub fn coin_id(base: &str) -> Option<&'static str> {
    let id = match base {
        "BTC" => "bitcoin",
        "ETH" => "ethereum",
        "BNB" => "binancecoin",
        "SOL" => "solana",
        "XRP" => "ripple",
        "ADA" => "cardano",
        "DOGE" => "dogecoin",
        "DOT" => "polkadot",
        "AVAX" => "avalanche-2",
        "LINK" => "chainlink",
        "LTC" => "litecoin",
        "TRX" => "tron",
        "MATIC" => "matic-network",
        "SHIB" => "shiba-inu",
        "TON" => "the-open-network",
        "ATOM" => "cosmos",
        "NEAR" => "near",
        "UNI" => "uniswap",
        _ => return None,
    };
    Some(id)
}

/// Smallest accepted `days` window reaching back from `now` to `end_time`.
pub fn days_for(end_time: Option<i64>, now: i64) -> i64 {
    let Some(end_time) = end_time else {
        return OHLC_DAYS[0];
    };

    let needed = (now - end_time).max(0) / 86_400 + 1;
    OHLC_DAYS
        .iter()
        .copied()
        .find(|days| *days >= needed)
        .unwrap_or(OHLC_DAYS[OHLC_DAYS.len() - 1])
}

impl KlineDecoder for CoinGeckoOhlc {
    const NAME: &'static str = "CoinGecko";

    fn url(&self, config: &ProviderConfig, request: &HistoryRequest) -> Result<Url, ProviderError> {
        let id = request
            .symbol
            .split_quote()
            .filter(|(_, quote)| matches!(*quote, "USDT" | "USDC" | "USD"))
            .and_then(|(base, _)| coin_id(base))
            .ok_or_else(|| {
                ProviderError::symbol_invalid(format!("no coin id for {}", request.symbol))
            })?;

        let days = days_for(request.end_time, Utc::now().timestamp());
        let endpoint = format!(
            "{}/api/v3/coins/{id}/ohlc",
            config.base_url.trim_end_matches('/')
        );

        Url::parse_with_params(
            &endpoint,
            &[("vs_currency", "usd".to_string()), ("days", days.to_string())],
        )
        .map_err(|e| ProviderError::unavailable(format!("invalid url {endpoint}: {e}")))
    }

    fn decode(&self, body: &[u8]) -> Result<Vec<Candle>, ProviderError> {
        let rows: Vec<[f64; 5]> = serde_json::from_slice(body).map_err(ProviderError::malformed)?;

        rows.into_iter()
            .map(|[time_ms, open, high, low, close]| {
                let candle = Candle::new(ms_to_secs(time_ms as i64), open, high, low, close, 0.0);
                if candle.is_finite() {
                    Ok(candle)
                } else {
                    Err(ProviderError::malformed(format!("non-finite row at {time_ms}")))
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::FailureKind,
        types::{Interval, Symbol},
    };
    use std::time::Duration;

    fn request(symbol: &str) -> HistoryRequest {
        HistoryRequest {
            symbol: Symbol::parse(symbol).unwrap(),
            interval: Interval::OneMinute,
            end_time: None,
        }
    }

    #[test]
    fn test_decode_defaults_volume_to_zero() {
        let body = "[[1700000000000,100.0,101.0,99.5,100.5],[1700001800000,100.5,102,100,101.5]]";

        let candles = CoinGeckoOhlc.decode(body.as_bytes()).unwrap();

        assert_eq!(
            candles,
            vec![
                Candle::new(1_700_000_000, 100.0, 101.0, 99.5, 100.5, 0.0),
                Candle::new(1_700_001_800, 100.5, 102.0, 100.0, 101.5, 0.0),
            ]
        );
    }

    #[test]
    fn test_url_maps_symbol_to_coin_id() {
        let config = ProviderConfig::new("https://api.coingecko.com", 0, Duration::from_secs(15));

        let url = CoinGeckoOhlc.url(&config, &request("AVAXUSDT")).unwrap();
        assert_eq!(
            url.as_str(),
            "https://api.coingecko.com/api/v3/coins/avalanche-2/ohlc?vs_currency=usd&days=1"
        );

        let error = CoinGeckoOhlc.url(&config, &request("FOOUSDT")).unwrap_err();
        assert_eq!(error.kind, FailureKind::SymbolInvalid);

        let error = CoinGeckoOhlc.url(&config, &request("ETHBTC")).unwrap_err();
        assert_eq!(error.kind, FailureKind::SymbolInvalid);
    }

    #[test]
    fn test_days_for() {
        struct TestCase {
            input: Option<i64>,
            expected: i64,
        }

        let now = 1_700_000_000;
        let tests = vec![
            TestCase {
                // TC0: latest page
                input: None,
                expected: 1,
            },
            TestCase {
                // TC1: a few hours back
                input: Some(now - 3 * 3600),
                expected: 1,
            },
            TestCase {
                // TC2: three days back
                input: Some(now - 3 * 86_400),
                expected: 7,
            },
            TestCase {
                // TC3: beyond the widest window is capped
                input: Some(now - 400 * 86_400),
                expected: 90,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            assert_eq!(days_for(test.input, now), test.expected, "TC{} failed", index);
        }
    }
}
