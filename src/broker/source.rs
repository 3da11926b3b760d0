//! Data sources
//!
//! A `DataSource` supplies the values a producer pushes for one topic. The
//! engine treats the values as opaque JSON; it only knows the route a source
//! is registered under and the topic parameters it passes in.
//!
//! The simulated sources below are deterministic functions of the topic
//! parameters and the producer's tick counter. They back the demo server.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};

use crate::topic::{ParamValue, Params};
use crate::utils::error::SourceError;

#[async_trait]
pub trait DataSource: Send + Sync {
    /// Produces the value for `tick` (counted per producer, starting at 0).
    async fn fetch(&self, params: &Params, tick: u64) -> Result<Value, SourceError>;
}

fn required_str<'a>(params: &'a Params, key: &str) -> Result<&'a str, SourceError> {
    match params.get(key) {
        Some(ParamValue::Str(s)) if !s.is_empty() => Ok(s.as_str()),
        Some(_) => Err(SourceError::new(format!("parameter '{key}' must be a string"))),
        None => Err(SourceError::new(format!("missing parameter '{key}'"))),
    }
}

/// Stable per-symbol base price in the 20..=520 range.
fn base_price(symbol: &str) -> f64 {
    let seed = symbol
        .bytes()
        .fold(2_166_136_261_u32, |acc, b| (acc ^ u32::from(b)).wrapping_mul(16_777_619));
    20.0 + f64::from(seed % 50_000) / 100.0
}

fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// OHLCV bars for the `bars` route; params `symbol` and `resolution`.
#[derive(Debug, Default, Clone)]
pub struct SimulatedBars;

#[async_trait]
impl DataSource for SimulatedBars {
    async fn fetch(&self, params: &Params, tick: u64) -> Result<Value, SourceError> {
        let symbol = required_str(params, "symbol")?;
        let resolution = required_str(params, "resolution")?;

        let base = base_price(symbol);
        let phase = tick as f64 * 0.35;
        let open = base * (1.0 + 0.01 * phase.sin());
        let close = base * (1.0 + 0.01 * (phase + 0.35).sin());
        let spread = base * 0.002 * (1.0 + (phase * 1.7).cos().abs());

        Ok(json!({
            "symbol": symbol,
            "resolution": resolution,
            "time": Utc::now().timestamp_millis(),
            "open": round_cents(open),
            "high": round_cents(open.max(close) + spread),
            "low": round_cents(open.min(close) - spread),
            "close": round_cents(close),
            "volume": 1_000 + (tick * 37) % 900,
        }))
    }
}

/// Top-of-book quotes for the `quotes` route; param `symbol`.
#[derive(Debug, Default, Clone)]
pub struct SimulatedQuotes;

#[async_trait]
impl DataSource for SimulatedQuotes {
    async fn fetch(&self, params: &Params, tick: u64) -> Result<Value, SourceError> {
        let symbol = required_str(params, "symbol")?;

        let mid = base_price(symbol) * (1.0 + 0.005 * (tick as f64 * 0.5).sin());
        let half_spread = 0.01 + 0.01 * (tick % 3) as f64;

        Ok(json!({
            "symbol": symbol,
            "time": Utc::now().timestamp_millis(),
            "bid": round_cents(mid - half_spread),
            "ask": round_cents(mid + half_spread),
        }))
    }
}
