//! Benchmarks for the signing hot path.
//!
//! Every delivery attempt canonicalizes and signs its payload, and every
//! inbound callback canonicalizes and verifies against up to two secrets.

use std::{hint::black_box, sync::Arc, time::Duration};

use chrono::Utc;
use courier_core::{Clock, SigningSecret, Subscription, TestClock};
use courier_signing::{canonical, codec, InboundVerifier, OsSecretGenerator, SecretRotationManager};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::{json, Value};

fn payload(items: usize) -> Value {
    let lines: Vec<Value> = (0..items)
        .map(|n| json!({"sku": format!("sku_{n}"), "qty": n % 7, "price": 1999, "tags": ["a", "b"]}))
        .collect();
    json!({"event": "order.created", "order": {"id": "ord_1", "lines": lines}})
}

fn bench_sign(c: &mut Criterion) {
    let secret = SigningSecret::from("whsec_benchmark");
    let mut group = c.benchmark_group("sign");

    for items in [1, 10, 100, 1000] {
        let value = payload(items);
        let size = canonical::to_vec(&value).map_or(0, |bytes| bytes.len());
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("canonical", items), &value, |b, value| {
            b.iter(|| canonical::to_vec(black_box(value)));
        });
        group.bench_with_input(BenchmarkId::new("sign", items), &value, |b, value| {
            b.iter(|| codec::sign(black_box(value), &secret));
        });
    }

    group.finish();
}

fn bench_verify_inbound(c: &mut Criterion) {
    let clock = TestClock::new();
    let shared: Arc<dyn Clock> = Arc::new(clock.clone());
    let rotation = SecretRotationManager::new(shared.clone(), Arc::new(OsSecretGenerator));
    let verifier = InboundVerifier::new(Duration::from_secs(300), rotation.clone(), shared);

    let mut sub = Subscription::new(
        "bench",
        "https://example.com/hook",
        SigningSecret::from("whsec_old"),
        vec!["order.created".to_string()],
        Utc::now(),
    );
    let value = payload(10);
    let old_signature = codec::sign(&value, &sub.secret).unwrap_or_default();
    let single = sub.clone();
    rotation.rotate(&mut sub, 7).ok();
    let timestamp = clock.now().timestamp().to_string();

    let mut group = c.benchmark_group("verify_inbound");

    group.bench_function("current_secret", |b| {
        let signature = codec::sign(&value, &single.secret).unwrap_or_default();
        b.iter(|| {
            verifier.validate_inbound(
                black_box(&value),
                Some(&signature),
                Some(&timestamp),
                &single,
            )
        });
    });

    group.bench_function("previous_secret_in_grace", |b| {
        b.iter(|| {
            verifier.validate_inbound(black_box(&value), Some(&old_signature), Some(&timestamp), &sub)
        });
    });

    group.bench_function("stale_timestamp", |b| {
        let stale = (clock.now().timestamp() - 3600).to_string();
        b.iter(|| {
            verifier.validate_inbound(black_box(&value), Some(&old_signature), Some(&stale), &sub)
        });
    });

    group.finish();
}

criterion_group!(benches, bench_sign, bench_verify_inbound);
criterion_main!(benches);
