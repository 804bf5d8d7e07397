#![no_main]

//! Inbound callback verification must never panic, whatever the body and
//! headers contain, and must never accept a signature it did not produce.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use courier_core::{Clock, SigningSecret, Subscription, TestClock};
use courier_signing::{codec, InboundVerifier, OsSecretGenerator, SecretRotationManager};
use libfuzzer_sys::fuzz_target;
use serde_json::Value;

fuzz_target!(|data: &[u8]| {
    // Layout: [split][signature bytes][timestamp bytes | body bytes]
    let Some((&split, rest)) = data.split_first() else {
        return;
    };
    let split = usize::from(split).min(rest.len());
    let (signature, tail) = rest.split_at(split);
    let mid = tail.len() / 4;
    let (timestamp, body) = tail.split_at(mid);

    let clock: Arc<dyn Clock> = Arc::new(TestClock::new());
    let rotation = SecretRotationManager::new(clock.clone(), Arc::new(OsSecretGenerator));
    let verifier = InboundVerifier::new(Duration::from_secs(300), rotation, clock.clone());
    let subscription = Subscription::new(
        "fuzz",
        "https://example.com/hook",
        SigningSecret::from("whsec_fuzz"),
        vec!["fuzz.event".to_string()],
        Utc::now(),
    );

    let Ok(payload) = serde_json::from_slice::<Value>(body) else {
        return;
    };
    let signature = String::from_utf8_lossy(signature);
    let timestamp = String::from_utf8_lossy(timestamp);

    let accepted = verifier
        .validate_inbound(&payload, Some(&signature), Some(&timestamp), &subscription)
        .unwrap_or(false);

    if accepted {
        let expected = codec::sign(&payload, &subscription.secret).unwrap_or_default();
        let presented = signature.trim();
        let presented = presented.strip_prefix("sha256=").unwrap_or(presented);
        assert_eq!(presented.to_ascii_lowercase(), expected);
    }

    // A signature we produced ourselves with a fresh timestamp always verifies.
    if let Ok(own) = codec::sign(&payload, &subscription.secret) {
        let now = clock.now().timestamp().to_string();
        let verified = verifier.validate_inbound(&payload, Some(&own), Some(&now), &subscription);
        assert!(matches!(verified, Ok(true)));
    }
});
