use serde::{Deserialize, Deserializer};
use std::{fmt::Display, str::FromStr};

/// Deserialize a JSON string field (eg/ `"16578.50"`) into any `FromStr` type.
///
/// Exchanges encode most decimals as strings to avoid float rounding.
pub fn de_str<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: Display,
{
    let data = String::deserialize(deserializer)?;
    data.parse::<T>().map_err(serde::de::Error::custom)
}

/// Parse a decimal string into an `f64`, rejecting non-finite results.
pub fn parse_f64(field: &str, value: &str) -> Result<f64, String> {
    match value.trim().parse::<f64>() {
        Ok(parsed) if parsed.is_finite() => Ok(parsed),
        Ok(_) => Err(format!("{field} is not finite: {value}")),
        Err(error) => Err(format!("{field} parse failed ({value}): {error}")),
    }
}
