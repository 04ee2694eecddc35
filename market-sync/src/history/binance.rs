use super::{HistoryRequest, KlineDecoder, ms_to_secs};
use crate::{config::ProviderConfig, de::parse_f64, error::ProviderError, types::Candle};
use serde::Deserialize;
use url::Url;

/// Binance spot klines: `GET /api/v3/klines`.
///
/// See docs: <https://developers.binance.com/docs/binance-spot-api-docs/rest-api/market-data-endpoints#klinecandlestick-data>
#[derive(Debug, Clone, Copy, Default)]
pub struct BinanceKlines;

/// Binance kline row, decimals encoded as strings.
#[allow(dead_code)]
#[derive(Debug, Deserialize)]
pub struct BinanceKline(
    i64,    // 0: Open time (ms)
    String, // 1: Open
    String, // 2: High
    String, // 3: Low
    String, // 4: Close
    String, // 5: Volume
    i64,    // 6: Close time
    String, // 7: Quote asset volume
    i64,    // 8: Number of trades
    String, // 9: Taker buy base asset volume
    String, // 10: Taker buy quote asset volume
    String, // 11: Ignore
);

impl TryFrom<BinanceKline> for Candle {
    type Error = String;

    fn try_from(kline: BinanceKline) -> Result<Self, Self::Error> {
        Ok(Candle {
            time: ms_to_secs(kline.0),
            open: parse_f64("open", &kline.1)?,
            high: parse_f64("high", &kline.2)?,
            low: parse_f64("low", &kline.3)?,
            close: parse_f64("close", &kline.4)?,
            volume: parse_f64("volume", &kline.5)?,
        })
    }
}

impl KlineDecoder for BinanceKlines {
    const NAME: &'static str = "Binance";

    fn url(&self, config: &ProviderConfig, request: &HistoryRequest) -> Result<Url, ProviderError> {
        let mut params = vec![
            ("symbol", request.symbol.to_string()),
            ("interval", request.interval.as_binance().to_string()),
            ("limit", config.limit.to_string()),
        ];
        if let Some(end_time_ms) = request.end_time_ms() {
            params.push(("endTime", end_time_ms.to_string()));
        }

        let endpoint = format!("{}/api/v3/klines", config.base_url.trim_end_matches('/'));
        Url::parse_with_params(&endpoint, &params)
            .map_err(|e| ProviderError::unavailable(format!("invalid url {endpoint}: {e}")))
    }

    fn decode(&self, body: &[u8]) -> Result<Vec<Candle>, ProviderError> {
        let klines: Vec<BinanceKline> =
            serde_json::from_slice(body).map_err(ProviderError::malformed)?;

        klines
            .into_iter()
            .map(Candle::try_from)
            .collect::<Result<Vec<_>, _>>()
            .map_err(ProviderError::malformed)
    }
}
