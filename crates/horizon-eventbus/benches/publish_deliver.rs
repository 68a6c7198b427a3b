//! Benchmarks for the envelope codec and publish+deliver throughput.
//!
//! Delivery runs over the in-memory broker, so the numbers measure the
//! bus itself: encoding, partitioning, the consume loop and dispatch.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use horizon_eventbus::{handler_fn, BusOptions, EventBus, EventEnvelope, InMemoryBroker, Matcher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const BATCH: usize = 100;

fn sample_envelope(aggregate_id: &str, version: u64) -> EventEnvelope {
    EventEnvelope::new(
        "OrderCreated",
        "Order",
        aggregate_id,
        version,
        r#"{"customer":"c-42","lines":[{"sku":"A-1","qty":2},{"sku":"B-7","qty":1}]}"#,
    )
    .unwrap()
    .with_context(r#"{"correlation_id":"5f0c2a"}"#)
    .unwrap()
}

fn bench_codec(c: &mut Criterion) {
    let envelope = sample_envelope("order-1", 7);
    let encoded = envelope.encode();

    let mut group = c.benchmark_group("envelope");
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("encode", |b| b.iter(|| black_box(&envelope).encode()));
    group.bench_function("decode", |b| {
        b.iter(|| EventEnvelope::decode(black_box(&encoded)).unwrap())
    });
    group.finish();
}

fn bench_publish_deliver(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();

    let delivered = Arc::new(AtomicUsize::new(0));
    let sent = AtomicUsize::new(0);
    let bus = rt.block_on(async {
        let broker = InMemoryBroker::new();
        let options = BusOptions {
            poll_timeout: Duration::from_millis(10),
            ..BusOptions::default()
        };
        let bus = EventBus::with_transport(Arc::new(broker), "bench", options)
            .await
            .unwrap();

        let counter = delivered.clone();
        bus.add_handler(
            Matcher::Any,
            handler_fn("counter", move |_envelope| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                }
            }),
        )
        .await
        .unwrap();
        bus
    });

    let envelopes: Vec<EventEnvelope> = (0..BATCH)
        .map(|i| sample_envelope(&format!("order-{}", i % 16), i as u64))
        .collect();

    let mut group = c.benchmark_group("bus");
    group.throughput(Throughput::Elements(BATCH as u64));

    group.bench_function("publish", |b| {
        b.iter(|| {
            rt.block_on(async {
                for envelope in &envelopes {
                    bus.publish(envelope).await.unwrap();
                }
                sent.fetch_add(BATCH, Ordering::Relaxed);
            })
        })
    });

    group.bench_function("publish_deliver", |b| {
        b.iter(|| {
            rt.block_on(async {
                let target = sent.fetch_add(BATCH, Ordering::Relaxed) + BATCH;
                for envelope in &envelopes {
                    bus.publish(envelope).await.unwrap();
                }
                while delivered.load(Ordering::Relaxed) < target {
                    tokio::task::yield_now().await;
                }
            })
        })
    });

    group.finish();
    rt.block_on(bus.close()).unwrap();
}

criterion_group!(benches, bench_codec, bench_publish_deliver);
criterion_main!(benches);
