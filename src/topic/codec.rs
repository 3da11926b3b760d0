use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

use crate::utils::error::{EngineError, Result};

/// Separator between the route and the canonical parameter JSON.
pub const ROUTE_SEPARATOR: char = ':';

/// `JSON.stringify` switches to exponent notation outside `[1e-7, 1e21)`.
const PLAIN_MAX_DIGITS: i32 = 21;
const PLAIN_MIN_EXPONENT: i32 = -6;

/// A single scalar subscription parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

/// Parameter mapping; a `BTreeMap` keeps keys in byte-wise order.
pub type Params = BTreeMap<String, ParamValue>;

/// Canonical topic identifier, `"{route}:{canonical-json}"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topic(String);

impl Topic {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Route prefix of the topic.
    pub fn route(&self) -> &str {
        self.0
            .split_once(ROUTE_SEPARATOR)
            .map_or(self.0.as_str(), |(route, _)| route)
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for Topic {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for Topic {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl ParamValue {
    /// Converts one JSON value, rejecting anything that is not a finite scalar.
    pub fn from_json(key: &str, value: &Value) -> Result<Self> {
        match value {
            Value::String(s) => Ok(ParamValue::Str(s.clone())),
            Value::Bool(b) => Ok(ParamValue::Bool(*b)),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(ParamValue::Int(i))
                } else if let Some(f) = n.as_f64() {
                    Ok(ParamValue::Float(f))
                } else {
                    Err(EngineError::invalid_parameter(key, "number out of range"))
                }
            }
            Value::Null => Err(EngineError::invalid_parameter(key, "null is not allowed")),
            Value::Array(_) => Err(EngineError::invalid_parameter(key, "arrays are not allowed")),
            Value::Object(_) => Err(EngineError::invalid_parameter(key, "objects are not allowed")),
        }
    }

    /// Appends the canonical JSON text of the value. Numbers are written
    /// exactly as `JSON.stringify` writes them, so `1.0` and `1` share a topic.
    fn write_canonical(&self, key: &str, out: &mut String) -> Result<()> {
        match self {
            ParamValue::Str(s) => out.push_str(&serde_json::to_string(s)?),
            ParamValue::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
            ParamValue::Int(i) => out.push_str(&i.to_string()),
            ParamValue::Float(f) => {
                if !f.is_finite() {
                    return Err(EngineError::invalid_parameter(key, "non-finite number"));
                }
                write_js_number(*f, out);
            }
        }
        Ok(())
    }
}

/// ECMAScript `Number::toString` for a finite double: shortest round-trip
/// digits, plain notation for `1e-7 <= |x| < 1e21`, otherwise `d.ddde±x`.
fn write_js_number(f: f64, out: &mut String) {
    // also covers -0
    if f == 0.0 {
        out.push('0');
        return;
    }
    if f < 0.0 {
        out.push('-');
    }

    // `{:e}` gives the shortest digits that round-trip, e.g. `1.5e17`
    let sci = format!("{:e}", f.abs());
    let (mantissa, exponent) = sci.split_once('e').unwrap_or((sci.as_str(), "0"));
    let digits: String = mantissa.chars().filter(|c| *c != '.').collect();
    let k = digits.len() as i32;
    // decimal point position: value = 0.<digits> * 10^n
    let n = exponent.parse::<i32>().unwrap_or(0) + 1;

    if k <= n && n <= PLAIN_MAX_DIGITS {
        out.push_str(&digits);
        out.extend(std::iter::repeat_n('0', (n - k) as usize));
    } else if 0 < n && n <= PLAIN_MAX_DIGITS {
        let (int, frac) = digits.split_at(n as usize);
        out.push_str(int);
        out.push('.');
        out.push_str(frac);
    } else if PLAIN_MIN_EXPONENT < n && n <= 0 {
        out.push_str("0.");
        out.extend(std::iter::repeat_n('0', n.unsigned_abs() as usize));
        out.push_str(&digits);
    } else {
        let (lead, rest) = digits.split_at(1);
        out.push_str(lead);
        if !rest.is_empty() {
            out.push('.');
            out.push_str(rest);
        }
        let e = n - 1;
        out.push('e');
        out.push(if e < 0 { '-' } else { '+' });
        out.push_str(&e.unsigned_abs().to_string());
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::Str(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        ParamValue::Str(value)
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        ParamValue::Int(value)
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        ParamValue::Float(value)
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        ParamValue::Bool(value)
    }
}

impl From<&ParamValue> for Value {
    fn from(value: &ParamValue) -> Self {
        match value {
            ParamValue::Str(s) => Value::String(s.clone()),
            ParamValue::Int(i) => Value::Number((*i).into()),
            ParamValue::Float(f) => Number::from_f64(*f).map_or(Value::Null, Value::Number),
            ParamValue::Bool(b) => Value::Bool(*b),
        }
    }
}

/// Parses a raw wire payload into `Params`. `null` means no parameters.
pub fn params_from_json(value: &Value) -> Result<Params> {
    match value {
        Value::Null => Ok(Params::new()),
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| Ok((k.clone(), ParamValue::from_json(k, v)?)))
            .collect(),
        other => Err(EngineError::invalid_parameter(
            "",
            format!("expected a parameter object, got {other}"),
        )),
    }
}

/// Turns params back into a JSON object, e.g. for a wire payload.
pub fn params_to_json(params: &Params) -> Value {
    Value::Object(
        params
            .iter()
            .map(|(k, v)| (k.clone(), Value::from(v)))
            .collect::<Map<String, Value>>(),
    )
}

/// Routes are used as the topic prefix and as the `type` prefix on the wire.
pub fn validate_route(route: &str) -> Result<()> {
    if route.is_empty() || route.contains('.') || route.contains(ROUTE_SEPARATOR) {
        return Err(EngineError::InvalidRoute(route.to_string()));
    }
    Ok(())
}

/// Encodes a route and its parameters into a canonical topic.
pub fn encode(route: &str, params: &Params) -> Result<Topic> {
    validate_route(route)?;

    // Params iterates in key order; the object is written by hand so the
    // output does not depend on how serde_json::Map orders its entries.
    let mut topic = String::with_capacity(route.len() + 2 + params.len() * 16);
    topic.push_str(route);
    topic.push(ROUTE_SEPARATOR);
    topic.push('{');
    for (i, (key, value)) in params.iter().enumerate() {
        if i > 0 {
            topic.push(',');
        }
        topic.push_str(&serde_json::to_string(key)?);
        topic.push(':');
        value.write_canonical(key, &mut topic)?;
    }
    topic.push('}');

    Ok(Topic(topic))
}

/// Encodes straight from a JSON payload, as received on the wire.
pub fn encode_json(route: &str, params: &Value) -> Result<Topic> {
    encode(route, &params_from_json(params)?)
}

/// Splits a topic back into its route and parameters.
pub fn decode(topic: &str) -> Result<(String, Params)> {
    let (route, json) = topic
        .split_once(ROUTE_SEPARATOR)
        .ok_or_else(|| EngineError::MalformedTopic(topic.to_string()))?;
    validate_route(route).map_err(|_| EngineError::MalformedTopic(topic.to_string()))?;

    let value: Value =
        serde_json::from_str(json).map_err(|_| EngineError::MalformedTopic(topic.to_string()))?;
    if !value.is_object() {
        return Err(EngineError::MalformedTopic(topic.to_string()));
    }
    let params = params_from_json(&value)?;

    Ok((route.to_string(), params))
}
