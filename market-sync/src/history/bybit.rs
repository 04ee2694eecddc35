use super::{HistoryRequest, KlineDecoder, ms_to_secs};
use crate::{config::ProviderConfig, de::parse_f64, error::ProviderError, types::Candle};
use serde::Deserialize;
use url::Url;

/// Bybit `retCode` values meaning the symbol is not listed.
const UNKNOWN_SYMBOL_CODES: [i64; 2] = [10001, 170121];

/// Bybit v5 spot klines: `GET /v5/market/kline`.
///
/// Rows arrive newest first.
///
/// See docs: <https://bybit-exchange.github.io/docs/v5/market/kline>
#[derive(Debug, Clone, Copy, Default)]
pub struct BybitKlines;

#[derive(Debug, Deserialize)]
pub struct BybitKlineResponse {
    #[serde(rename = "retCode")]
    pub ret_code: i64,
    #[serde(rename = "retMsg", default)]
    pub ret_msg: String,
    #[serde(default)]
    pub result: Option<BybitKlineResult>,
}

#[derive(Debug, Deserialize)]
pub struct BybitKlineResult {
    #[serde(default)]
    pub list: Vec<Vec<String>>,
}

/// `[startTime, open, high, low, close, volume, turnover]`
fn parse_row(row: &[String]) -> Result<Candle, String> {
    let [start, open, high, low, close, volume, ..] = row else {
        return Err(format!("expected at least 6 fields, got {}", row.len()));
    };

    let start_ms = start
        .parse::<i64>()
        .map_err(|e| format!("start time parse failed ({start}): {e}"))?;

    Ok(Candle {
        time: ms_to_secs(start_ms),
        open: parse_f64("open", open)?,
        high: parse_f64("high", high)?,
        low: parse_f64("low", low)?,
        close: parse_f64("close", close)?,
        volume: parse_f64("volume", volume)?,
    })
}

impl KlineDecoder for BybitKlines {
    const NAME: &'static str = "Bybit";

    fn url(&self, config: &ProviderConfig, request: &HistoryRequest) -> Result<Url, ProviderError> {
        let mut params = vec![
            ("category", "spot".to_string()),
            ("symbol", request.symbol.to_string()),
            ("interval", request.interval.as_bybit().to_string()),
            ("limit", config.limit.to_string()),
        ];
        if let Some(end_time_ms) = request.end_time_ms() {
            params.push(("end", end_time_ms.to_string()));
        }

        let endpoint = format!("{}/v5/market/kline", config.base_url.trim_end_matches('/'));
        Url::parse_with_params(&endpoint, &params)
            .map_err(|e| ProviderError::unavailable(format!("invalid url {endpoint}: {e}")))
    }

    fn decode(&self, body: &[u8]) -> Result<Vec<Candle>, ProviderError> {
        let response: BybitKlineResponse =
            serde_json::from_slice(body).map_err(ProviderError::malformed)?;

        if response.ret_code != 0 {
            let reason = format!("retCode {}: {}", response.ret_code, response.ret_msg);
            return Err(if UNKNOWN_SYMBOL_CODES.contains(&response.ret_code) {
                ProviderError::symbol_invalid(reason)
            } else {
                ProviderError::unavailable(reason)
            });
        }

        let rows = response
            .result
            .ok_or_else(|| ProviderError::malformed("missing result"))?
            .list;

        let mut candles = rows
            .iter()
            .map(|row| parse_row(row))
            .collect::<Result<Vec<_>, _>>()
            .map_err(ProviderError::malformed)?;

        candles.reverse();
        Ok(candles)
    }
}
