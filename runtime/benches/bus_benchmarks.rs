//! Hot-path benchmarks for the bus.
//!
//! - Envelope stamping and JSON encoding of a domain event
//! - Decoding an inbound body back into an envelope
//! - Deferred publish into a request outbox
//! - Retry delay computation and topic matching
//!
//! Run with: `cargo bench -p courier-runtime`

#![allow(missing_docs)] // Benchmarks don't need extensive docs
#![allow(clippy::expect_used)] // Benchmarks can use expect for setup

use courier_core::environment::Clock;
use courier_core::{DomainEvent, Envelope, RequestContext};
use courier_runtime::{EventBus, PublishOptions, ServerConfig, delay_for};
use courier_testing::{InMemoryBroker, broker::topic_matches, test_clock};
use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use std::sync::Arc;

fn order_created() -> DomainEvent {
    DomainEvent::at("OrderCreated", test_clock().now())
        .with("order_id", 42)
        .with("customer", "c-7")
        .with("total_cents", 129_900)
}

fn bench_envelope(c: &mut Criterion) {
    let mut group = c.benchmark_group("envelope");
    group.throughput(Throughput::Elements(1));

    let event = order_created();
    let ctx = RequestContext::with_trace_id("bench-trace").with_field("user_id", 7);
    let fields = vec!["user_id".to_string()];

    group.bench_function("stamp_and_encode", |b| {
        b.iter(|| {
            let envelope =
                Envelope::for_event(black_box(&event), &ctx, &fields).expect("event encodes");
            black_box(envelope.to_json().expect("envelope encodes"))
        });
    });

    let body = Envelope::for_event(&event, &ctx, &fields)
        .and_then(|e| e.to_json())
        .expect("envelope encodes");
    group.bench_function("decode", |b| {
        b.iter(|| black_box(Envelope::from_body(black_box(body.as_bytes()))));
    });

    group.finish();
}

fn bench_outbox(c: &mut Criterion) {
    let broker = InMemoryBroker::new();
    let bus = EventBus::builder()
        .connector("memory", broker.connector())
        .server("default", ServerConfig::new("memory", "memory://bench", "bench"))
        .clock(Arc::new(test_clock()))
        .build()
        .expect("bus builds");
    let event = order_created();

    c.bench_function("outbox/publish_10_then_reset", |b| {
        b.iter(|| {
            let ctx = bus.new_context();
            for _ in 0..10 {
                bus.publish(Some(&ctx), &event, PublishOptions::default())
                    .expect("publish succeeds");
            }
            black_box(ctx.reset())
        });
    });
}

fn bench_routing(c: &mut Criterion) {
    let mut group = c.benchmark_group("routing");

    group.bench_function("delay_for", |b| {
        b.iter(|| {
            for attempt in 0..16 {
                black_box(delay_for(black_box(attempt)));
            }
        });
    });

    group.bench_function("topic_matches", |b| {
        b.iter(|| {
            black_box(topic_matches(
                black_box("order.*.#"),
                black_box("order.eu.created.v2"),
            ))
        });
    });

    group.finish();
}

criterion_group!(benches, bench_envelope, bench_outbox, bench_routing);
criterion_main!(benches);
