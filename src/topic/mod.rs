//! Canonical topic identifiers.
//!
//! A topic is derived from a route name and a flat parameter mapping. Both the
//! server and any consumer compute it independently, so the encoding must be
//! byte-identical for set-equal parameter mappings regardless of insertion
//! order: `bars:{"resolution":"1","symbol":"AAPL"}`.

pub mod codec;

pub use codec::{
    ParamValue, Params, Topic, decode, encode, encode_json, params_from_json, params_to_json,
    validate_route,
};

#[cfg(test)]
mod tests;
