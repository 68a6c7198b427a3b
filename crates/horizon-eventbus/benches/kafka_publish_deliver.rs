//! Publish and publish+deliver throughput against a live Kafka broker.
//!
//! Run with:
//! ```bash
//! KAFKA_BROKER_HOST=localhost:9092 \
//!   cargo bench -p horizon-eventbus --features integration --bench kafka_publish_deliver
//! ```

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use horizon_eventbus::{handler_fn, BusOptions, EventBus, EventEnvelope, KafkaConfig, Matcher};
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const BATCH: usize = 100;

fn broker_host() -> String {
    std::env::var("KAFKA_BROKER_HOST").unwrap_or_else(|_| "localhost:9092".to_string())
}

fn sample_envelope(aggregate_id: &str, version: u64) -> EventEnvelope {
    EventEnvelope::new(
        "OrderCreated",
        "Order",
        aggregate_id,
        version,
        r#"{"customer":"c-42","lines":[{"sku":"A-1","qty":2}]}"#,
    )
    .unwrap()
}

fn bench_kafka_publish_deliver(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();

    let delivered = Arc::new(AtomicUsize::new(0));
    let sent = AtomicUsize::new(0);
    let application_id = format!("bench-{:08x}", rand::thread_rng().gen::<u32>());

    let bus = rt.block_on(async {
        let bus = EventBus::with_kafka(
            KafkaConfig::new(broker_host()),
            application_id,
            BusOptions::default(),
        )
        .await
        .unwrap();
        bus.wait_until_ready(Duration::from_secs(30)).await.unwrap();

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

    let mut group = c.benchmark_group("kafka");
    group.throughput(Throughput::Elements(BATCH as u64));
    group.sample_size(10);
    group.measurement_time(Duration::from_secs(20));

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
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            })
        })
    });

    group.finish();
    rt.block_on(bus.close()).unwrap();
}

criterion_group!(benches, bench_kafka_publish_deliver);
criterion_main!(benches);
