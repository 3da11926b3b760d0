use super::codec::{ParamValue, Params, ROUTE_SEPARATOR};
use super::{decode, encode, encode_json, validate_route};
use crate::utils::error::EngineError;
use serde_json::json;

fn params(pairs: &[(&str, ParamValue)]) -> Params {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

#[test]
fn test_encode_sorts_keys() {
    let topic = encode(
        "bars",
        &params(&[("symbol", "AAPL".into()), ("resolution", "1".into())]),
    )
    .unwrap();
    assert_eq!(topic.as_str(), r#"bars:{"resolution":"1","symbol":"AAPL"}"#);
    assert_eq!(topic.route(), "bars");
}

#[test]
fn test_encode_is_independent_of_insertion_order() {
    // serde_json::json! objects keep their own ordering; both must converge
    let a = encode_json("bars", &json!({"symbol": "AAPL", "resolution": "1"})).unwrap();
    let b = encode_json("bars", &json!({"resolution": "1", "symbol": "AAPL"})).unwrap();
    assert_eq!(a, b);
    assert_eq!(a.as_str(), r#"bars:{"resolution":"1","symbol":"AAPL"}"#);
}

#[test]
fn test_encode_scalar_formats() {
    let topic = encode_json(
        "orders",
        &json!({"live": true, "limit": 10, "ratio": 0.25, "whole": 2.0, "neg": -3}),
    )
    .unwrap();
    assert_eq!(
        topic.as_str(),
        r#"orders:{"limit":10,"live":true,"neg":-3,"ratio":0.25,"whole":2}"#
    );
}

#[test]
fn test_integral_float_and_integer_share_a_topic() {
    let a = encode("bars", &params(&[("n", ParamValue::Float(1.0))])).unwrap();
    let b = encode("bars", &params(&[("n", ParamValue::Int(1))])).unwrap();
    assert_eq!(a, b);
}

#[test]
fn test_float_formatting_matches_json_stringify() {
    // expected strings are what JSON.stringify produces for the same double
    let cases: &[(f64, &str)] = &[
        (1.5, "1.5"),
        (-0.5, "-0.5"),
        (0.1, "0.1"),
        (-0.0, "0"),
        (123.456, "123.456"),
        (1e-6, "0.000001"),
        (1.5e-6, "0.0000015"),
        (1e-7, "1e-7"),
        (-2.5e-8, "-2.5e-8"),
        (9_007_199_254_740_992.0, "9007199254740992"),
        (1e16, "10000000000000000"),
        (1.5e17, "150000000000000000"),
        (123_456_789_012_345_680_000.0, "123456789012345680000"),
        (1e20, "100000000000000000000"),
        (1e21, "1e+21"),
        (1.25e22, "1.25e+22"),
        (f64::MAX, "1.7976931348623157e+308"),
        (5e-324, "5e-324"),
    ];
    for (value, expected) in cases {
        let topic = encode("bars", &params(&[("x", ParamValue::Float(*value))])).unwrap();
        assert_eq!(
            topic.as_str(),
            format!(r#"bars:{{"x":{expected}}}"#),
            "formatting {value:e}"
        );
    }
}

#[test]
fn test_wire_floats_encode_like_json_stringify() {
    let topic = encode_json("bars", &json!({"tiny": 1e-6, "big": 1e16})).unwrap();
    assert_eq!(
        topic.as_str(),
        r#"bars:{"big":10000000000000000,"tiny":0.000001}"#
    );
}

#[test]
fn test_encode_escapes_strings() {
    let topic = encode_json("news", &json!({"q": "say \"hi\"\n"})).unwrap();
    assert_eq!(topic.as_str(), r#"news:{"q":"say \"hi\"\n"}"#);
}

#[test]
fn test_encode_without_params() {
    assert_eq!(encode_json("orders", &json!(null)).unwrap().as_str(), "orders:{}");
    assert_eq!(encode_json("orders", &json!({})).unwrap().as_str(), "orders:{}");
}

#[test]
fn test_encode_rejects_non_scalar_values() {
    for bad in [json!({"a": null}), json!({"a": [1]}), json!({"a": {"b": 1}})] {
        match encode_json("bars", &bad) {
            Err(EngineError::InvalidParameter { key, .. }) => assert_eq!(key, "a"),
            other => panic!("expected InvalidParameter, got {other:?}"),
        }
    }
    assert!(matches!(
        encode_json("bars", &json!("AAPL")),
        Err(EngineError::InvalidParameter { .. })
    ));
    assert!(matches!(
        encode("bars", &params(&[("x", ParamValue::Float(f64::NAN))])),
        Err(EngineError::InvalidParameter { .. })
    ));
}

#[test]
fn test_validate_route() {
    assert!(validate_route("bars").is_ok());
    assert!(validate_route("").is_err());
    assert!(validate_route("bars.v2").is_err());
    assert!(validate_route(&format!("a{ROUTE_SEPARATOR}b")).is_err());
}

#[test]
fn test_decode_inverts_encode() {
    let original = params(&[
        ("symbol", "MSFT".into()),
        ("resolution", "5".into()),
        ("extended", true.into()),
    ]);
    let topic = encode("bars", &original).unwrap();
    let (route, decoded) = decode(topic.as_str()).unwrap();
    assert_eq!(route, "bars");
    assert_eq!(decoded, original);
}

#[test]
fn test_decode_rejects_malformed_topics() {
    for bad in ["bars", "bars:[1]", "bars:{not json}", ":{}"] {
        assert!(
            matches!(decode(bad), Err(EngineError::MalformedTopic(_))),
            "{bad} should be malformed"
        );
    }
}
