//! Property tests for signing and replay protection.

use chrono::{TimeZone, Utc};
use courier_core::SigningSecret;
use courier_signing::{codec, replay};
use proptest::prelude::*;
use serde_json::{json, Value};

fn json_value() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| json!(n)),
        "[ -~]{0,16}".prop_map(Value::String),
        "\\PC{0,8}".prop_map(Value::String),
    ];

    leaf.prop_recursive(3, 24, 4, |inner| {
        prop_oneof![
            proptest::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            proptest::collection::btree_map("[a-z/]{1,6}", inner, 0..4)
                .prop_map(|map| Value::Object(map.into_iter().collect())),
        ]
    })
}

// HMAC zero-pads short keys, so keys differing only in trailing zero bytes
// are equivalent. Non-zero bytes keep distinct vectors distinct keys.
fn secret() -> impl Strategy<Value = Vec<u8>> {
    proptest::collection::vec(1u8..=255, 1..48)
}

proptest! {
    #[test]
    fn sign_then_verify_round_trips(payload in json_value(), key in secret()) {
        let secret = SigningSecret::new(key);
        let signature = codec::sign(&payload, &secret).unwrap();
        prop_assert!(codec::verify(&payload, &signature, &secret));
    }

    #[test]
    fn different_secret_fails(payload in json_value(), a in secret(), b in secret()) {
        prop_assume!(a != b);
        let signature = codec::sign(&payload, &SigningSecret::new(a)).unwrap();
        prop_assert!(!codec::verify(&payload, &signature, &SigningSecret::new(b)));
    }

    #[test]
    fn verify_never_panics_on_garbage(payload in json_value(), signature in "\\PC{0,80}") {
        let _ = codec::verify(&payload, &signature, &SigningSecret::from("s3cr3t"));
    }

    #[test]
    fn freshness_matches_absolute_difference(
        now_secs in 0i64..4_000_000_000,
        offset in -10_000i64..10_000,
        tolerance in 0u64..5_000,
    ) {
        let now = Utc.timestamp_opt(now_secs, 0).unwrap();
        let expected = offset.unsigned_abs() <= tolerance;
        prop_assert_eq!(replay::is_fresh(now_secs + offset, tolerance, now), expected);
    }
}
