//! Integration tests for consumers, delayed retry and the request outbox.
//!
//! Retry copies travel through the in-memory broker exactly as they would
//! through RabbitMQ: published to the retry exchange with a TTL, parked in
//! the retry queue, then dead-lettered back to the handler's queue.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

mod common;

use common::{
    EXCHANGE, RETRY_EXCHANGE, Recorder, bus, bus_with, default_manager, eventually, failing,
    flaky, server_config, wait_for_state,
};
use courier_core::envelope::{EVENT_NAME_HEADER, OCCUR_ON_HEADER, TRACE_ID_HEADER};
use courier_core::{DomainEvent, Envelope, RequestContext, typed};
use courier_runtime::{
    BusConfig, BusSettings, ConnectionState, DeliveryMode, EventBus, PublishOptions, RetryLimit,
    Subscription,
};
use courier_testing::{InMemoryBroker, test_clock};
use courier_core::environment::Clock;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

const HANDLER: &str = "orders::on_order_created";
const QUEUE: &str = "orders.on_order_created";

fn order_created() -> DomainEvent {
    DomainEvent::at("OrderCreated", test_clock().now()).with("order_id", 1)
}

async fn running(bus: &EventBus, broker: &InMemoryBroker, queues: &[&str]) {
    bus.start().unwrap();
    wait_for_state(&default_manager(bus), ConnectionState::Running).await;
    for queue in queues {
        eventually("consumer", || broker.consumer_count(queue) == 1).await;
    }
}

// ============================================================================
// Publishing and the outbox
// ============================================================================

#[tokio::test(start_paused = true)]
async fn committed_event_is_published_once_with_headers() {
    let broker = InMemoryBroker::new();
    let bus = bus(&broker);
    running(&bus, &broker, &[]).await;

    let ctx = RequestContext::with_trace_id("abc-123");
    bus.publish(Some(&ctx), &order_created(), PublishOptions::default())
        .unwrap();
    assert_eq!(ctx.pending(), 1);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(broker.publications().is_empty());

    assert_eq!(bus.commit(&ctx), 1);
    eventually("publish", || broker.publications_to(EXCHANGE).len() == 1).await;
    tokio::time::sleep(Duration::from_secs(5)).await;

    let publications = broker.publications();
    assert_eq!(publications.len(), 1);
    let published = &publications[0];
    assert_eq!(published.routing_key, "OrderCreated");

    let envelope = published.envelope();
    assert_eq!(envelope.headers.len(), 3);
    assert_eq!(envelope.header(TRACE_ID_HEADER), Some(&json!("abc-123")));
    assert_eq!(envelope.header(EVENT_NAME_HEADER), Some(&json!("OrderCreated")));
    assert_eq!(
        envelope.header(OCCUR_ON_HEADER),
        Some(&json!("2025-01-01T00:00:00.000Z"))
    );
    assert_eq!(envelope.payload["event_name"], json!("OrderCreated"));
    assert_eq!(envelope.payload["order_id"], json!(1));
}

#[tokio::test(start_paused = true)]
async fn uncommitted_outbox_is_never_published() {
    let broker = InMemoryBroker::new();
    let bus = bus(&broker);
    running(&bus, &broker, &[]).await;

    let ctx = bus.new_context();
    bus.publish(Some(&ctx), &order_created(), PublishOptions::default())
        .unwrap();
    bus.publish(Some(&ctx), &order_created(), PublishOptions::default())
        .unwrap();
    assert_eq!(ctx.reset(), 2);
    drop(ctx);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(broker.publications().is_empty());
}

#[tokio::test(start_paused = true)]
async fn immediate_publish_skips_the_outbox() {
    let broker = InMemoryBroker::new();
    let bus = bus(&broker);
    running(&bus, &broker, &[]).await;

    let ctx = bus.new_context();
    bus.publish(Some(&ctx), &order_created(), PublishOptions::immediate())
        .unwrap();
    bus.publish_message(None, "AuditLogged", &json!({"who": "alice"}), PublishOptions::default())
        .unwrap();
    assert_eq!(ctx.pending(), 0);

    eventually("publish", || broker.publications_to(EXCHANGE).len() == 2).await;
    let audit = broker.publications_to(EXCHANGE)[1].envelope();
    assert_eq!(audit.payload, json!({"who": "alice"}));
    assert_eq!(audit.event_name(), Some("AuditLogged"));
    assert_eq!(
        audit.header(OCCUR_ON_HEADER),
        Some(&json!("2025-01-01T00:00:00.000Z"))
    );
}

#[tokio::test(start_paused = true)]
async fn commit_preserves_enqueue_order() {
    let broker = InMemoryBroker::new();
    let bus = bus(&broker);
    running(&bus, &broker, &[]).await;

    let ctx = bus.new_context();
    for name in ["First", "Second", "Third"] {
        bus.publish(Some(&ctx), &DomainEvent::new(name), PublishOptions::default())
            .unwrap();
    }
    bus.commit(&ctx);

    eventually("publish", || broker.publications_to(EXCHANGE).len() == 3).await;
    let order: Vec<String> = broker
        .publications()
        .into_iter()
        .map(|p| p.routing_key)
        .collect();
    assert_eq!(order, vec!["First", "Second", "Third"]);
}

// ============================================================================
// Dispatch
// ============================================================================

#[tokio::test(start_paused = true)]
async fn handler_receives_trace_id_and_allowed_context_fields() {
    let broker = InMemoryBroker::new();
    let bus = bus_with(
        &broker,
        server_config(),
        BusSettings::default().with_context_field("user_id"),
    );
    let recorder = Recorder::default();
    bus.subscribe("default", Subscription::new("OrderCreated", HANDLER, flaky(&recorder, 0)))
        .unwrap();
    running(&bus, &broker, &[QUEUE]).await;

    let ctx = RequestContext::with_trace_id("t-1")
        .with_field("user_id", "u-1")
        .with_field("secret", "s");
    bus.publish(Some(&ctx), &order_created(), PublishOptions::default())
        .unwrap();
    bus.commit(&ctx);

    eventually("delivery", || recorder.len() == 1).await;
    let call = &recorder.calls()[0];
    assert_eq!(call.ctx.trace_id(), "t-1");
    assert_eq!(call.ctx.field("user_id"), Some(json!("u-1")));
    assert_eq!(call.ctx.field("secret"), None);
    assert_eq!(call.envelope.header("X-USER-ID"), Some(&json!("u-1")));
    assert_eq!(call.envelope.header("X-SECRET"), None);

    eventually("ack", || broker.acks() == 1).await;
    assert!(broker.publications_to(RETRY_EXCHANGE).is_empty());
}

#[tokio::test(start_paused = true)]
async fn never_retry_acks_once_and_drops() {
    let broker = InMemoryBroker::new();
    let bus = bus(&broker);
    let recorder = Recorder::default();
    bus.subscribe(
        "default",
        Subscription::new("OrderCreated", HANDLER, failing(&recorder)).max_retry(0),
    )
    .unwrap();
    running(&bus, &broker, &[QUEUE]).await;

    bus.publish(None, &order_created(), PublishOptions::default())
        .unwrap();

    eventually("ack", || broker.acks() == 1).await;
    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(recorder.len(), 1);
    assert_eq!(broker.acks(), 1);
    assert!(broker.publications_to(RETRY_EXCHANGE).is_empty());
    assert_eq!(broker.queue_depth(QUEUE), 0);
}

#[tokio::test(start_paused = true)]
async fn failed_attempts_retry_with_backoff_then_commit() {
    let broker = InMemoryBroker::new();
    let bus = bus(&broker);
    let recorder = Recorder::default();

    let publisher = bus.clone();
    let calls = recorder.clone();
    let handler = move |ctx: RequestContext, envelope: Envelope| {
        let attempt = calls.record(&ctx, &envelope);
        let result = publisher
            .publish(
                Some(&ctx),
                &DomainEvent::new("OrderShipped").with("attempt", attempt),
                PublishOptions::default(),
            )
            .map_err(anyhow::Error::from)
            .and_then(|()| {
                if attempt <= 2 {
                    Err(anyhow::anyhow!("attempt {attempt} failed"))
                } else {
                    Ok(())
                }
            });
        std::future::ready(result)
    };
    bus.subscribe(
        "default",
        Subscription::new("OrderCreated", HANDLER, handler).max_retry(2),
    )
    .unwrap();
    running(&bus, &broker, &[QUEUE]).await;

    let ctx = RequestContext::with_trace_id("abc-123");
    bus.publish(Some(&ctx), &order_created(), PublishOptions::immediate())
        .unwrap();

    eventually("third attempt", || recorder.len() == 3).await;
    eventually("shipped", || broker.publications_to(EXCHANGE).len() == 2).await;
    eventually("acks", || broker.acks() == 3).await;

    let retries = broker.publications_to(RETRY_EXCHANGE);
    assert_eq!(retries.len(), 2);
    let original = broker.publications_to(EXCHANGE)[0].body.clone();
    for (retry, (count, delay_ms)) in retries.iter().zip([(1, 2000), (2, 4000)]) {
        assert_eq!(retry.routing_key, QUEUE);
        assert_eq!(retry.headers.get("x-retry-count"), Some(&json!(count)));
        assert_eq!(retry.expiration, Some(Duration::from_millis(delay_ms)));
        assert_eq!(retry.body, original);
    }

    let calls = recorder.calls();
    let first_gap = calls[1].at - calls[0].at;
    let second_gap = calls[2].at - calls[1].at;
    assert!(first_gap >= Duration::from_secs(2) && first_gap < Duration::from_secs(3));
    assert!(second_gap >= Duration::from_secs(4) && second_gap < Duration::from_secs(5));
    assert!(calls.iter().all(|c| c.ctx.trace_id() == "abc-123"));

    // Only the successful attempt's outbox reached the broker.
    let shipped = broker.publications_to(EXCHANGE)[1].envelope();
    assert_eq!(shipped.event_name(), Some("OrderShipped"));
    assert_eq!(shipped.payload["attempt"], json!(3));
    assert_eq!(shipped.trace_id(), Some("abc-123"));

    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(recorder.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_are_dropped() {
    let broker = InMemoryBroker::new();
    let bus = bus(&broker);
    let recorder = Recorder::default();
    bus.subscribe(
        "default",
        Subscription::new("OrderCreated", HANDLER, failing(&recorder)).max_retry(1),
    )
    .unwrap();
    running(&bus, &broker, &[QUEUE]).await;

    bus.publish(None, &order_created(), PublishOptions::default())
        .unwrap();

    eventually("second attempt", || recorder.len() == 2).await;
    eventually("acks", || broker.acks() == 2).await;
    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(recorder.len(), 2);
    assert_eq!(broker.publications_to(RETRY_EXCHANGE).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn unlimited_retries_keep_doubling_the_delay() {
    let broker = InMemoryBroker::new();
    let bus = bus(&broker);
    let recorder = Recorder::default();
    bus.subscribe("default", Subscription::new("OrderCreated", HANDLER, failing(&recorder)))
        .unwrap();
    running(&bus, &broker, &[QUEUE]).await;

    bus.publish(None, &order_created(), PublishOptions::default())
        .unwrap();

    eventually("four attempts", || recorder.len() >= 4).await;
    let delays: Vec<Option<Duration>> = broker
        .publications_to(RETRY_EXCHANGE)
        .iter()
        .take(3)
        .map(|p| p.expiration)
        .collect();
    assert_eq!(
        delays,
        vec![
            Some(Duration::from_secs(2)),
            Some(Duration::from_secs(4)),
            Some(Duration::from_secs(8)),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn handler_timeout_cancels_context_and_discards_outbox() {
    let broker = InMemoryBroker::new();
    let bus = bus(&broker);
    let seen: Arc<Mutex<Option<RequestContext>>> = Arc::default();

    let slot = Arc::clone(&seen);
    let publisher = bus.clone();
    let handler = move |ctx: RequestContext, _envelope: Envelope| {
        *slot.lock().unwrap() = Some(ctx.clone());
        let publisher = publisher.clone();
        async move {
            publisher.publish(Some(&ctx), &DomainEvent::new("Never"), PublishOptions::default())?;
            std::future::pending::<()>().await;
            Ok::<(), anyhow::Error>(())
        }
    };
    bus.subscribe(
        "default",
        Subscription::new("OrderCreated", HANDLER, handler)
            .timeout(Duration::from_secs(1))
            .max_retry(0),
    )
    .unwrap();
    running(&bus, &broker, &[QUEUE]).await;

    let sent_at = Instant::now();
    bus.publish(None, &order_created(), PublishOptions::default())
        .unwrap();

    eventually("ack", || broker.acks() == 1).await;
    assert!(sent_at.elapsed() >= Duration::from_secs(1));
    let ctx = seen.lock().unwrap().clone().unwrap();
    assert!(ctx.is_cancelled());
    assert_eq!(ctx.pending(), 0);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(broker.publications_to(EXCHANGE).len(), 1);
}

async fn explode() -> anyhow::Result<()> {
    panic!("handler exploded")
}

#[tokio::test(start_paused = true)]
async fn panicking_handler_is_treated_as_failure() {
    let broker = InMemoryBroker::new();
    let bus = bus(&broker);
    let recorder = Recorder::default();
    let calls = recorder.clone();
    let handler = move |ctx: RequestContext, envelope: Envelope| {
        calls.record(&ctx, &envelope);
        explode()
    };
    bus.subscribe(
        "default",
        Subscription::new("OrderCreated", HANDLER, handler).max_retry(1),
    )
    .unwrap();
    running(&bus, &broker, &[QUEUE]).await;

    bus.publish(None, &order_created(), PublishOptions::default())
        .unwrap();

    eventually("acks", || broker.acks() == 2).await;
    assert_eq!(recorder.len(), 2);
    assert_eq!(broker.publications_to(RETRY_EXCHANGE).len(), 1);
}

#[derive(Debug, Deserialize)]
struct Shipment {
    #[allow(dead_code)]
    tracking_number: String,
}

#[tokio::test(start_paused = true)]
async fn unconvertible_payload_fails_the_delivery() {
    let broker = InMemoryBroker::new();
    let bus = bus(&broker);
    let invoked = Arc::new(Mutex::new(0_usize));
    let counter = Arc::clone(&invoked);
    bus.subscribe(
        "default",
        Subscription::new(
            "OrderCreated",
            HANDLER,
            typed(move |_ctx: RequestContext, _shipment: Shipment| {
                *counter.lock().unwrap() += 1;
                std::future::ready(Ok::<(), anyhow::Error>(()))
            }),
        )
        .max_retry(0),
    )
    .unwrap();
    running(&bus, &broker, &[QUEUE]).await;

    bus.publish(None, &order_created(), PublishOptions::default())
        .unwrap();

    eventually("ack", || broker.acks() == 1).await;
    assert_eq!(*invoked.lock().unwrap(), 0);
}

// ============================================================================
// Delivery modes
// ============================================================================

#[tokio::test(start_paused = true)]
async fn work_mode_instances_share_one_queue() {
    let broker = InMemoryBroker::new();
    let first = Recorder::default();
    let second = Recorder::default();

    let bus_a = bus(&broker);
    let bus_b = bus(&broker);
    let a = bus_a
        .subscribe("default", Subscription::new("OrderCreated", HANDLER, flaky(&first, 0)))
        .unwrap();
    let b = bus_b
        .subscribe("default", Subscription::new("OrderCreated", HANDLER, flaky(&second, 0)))
        .unwrap();
    assert_eq!(a.queue_name(), QUEUE);
    assert_eq!(a.queue_name(), b.queue_name());

    bus_a.start().unwrap();
    bus_b.start().unwrap();
    eventually("consumers", || broker.consumer_count(QUEUE) == 2).await;
    assert!(broker.queue_options(QUEUE).unwrap().durable);

    bus_a
        .publish(None, &order_created(), PublishOptions::default())
        .unwrap();

    eventually("ack", || broker.acks() == 1).await;
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(first.len() + second.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn broadcast_mode_delivers_to_every_instance() {
    let broker = InMemoryBroker::new();
    let first = Recorder::default();
    let second = Recorder::default();

    let bus_a = bus(&broker);
    let bus_b = bus(&broker);
    let a = bus_a
        .subscribe(
            "default",
            Subscription::new("OrderCreated", HANDLER, flaky(&first, 0))
                .mode(DeliveryMode::Broadcast),
        )
        .unwrap();
    let b = bus_b
        .subscribe(
            "default",
            Subscription::new("OrderCreated", HANDLER, flaky(&second, 0))
                .mode(DeliveryMode::Broadcast),
        )
        .unwrap();
    assert_ne!(a.queue_name(), b.queue_name());

    bus_a.start().unwrap();
    bus_b.start().unwrap();
    eventually("consumers", || {
        broker.consumer_count(&a.queue_name()) == 1 && broker.consumer_count(&b.queue_name()) == 1
    })
    .await;
    assert!(broker.queue_options(&a.queue_name()).unwrap().exclusive);

    bus_a
        .publish(None, &order_created(), PublishOptions::default())
        .unwrap();

    eventually("both delivered", || first.len() == 1 && second.len() == 1).await;
    eventually("acks", || broker.acks() == 2).await;
}

#[tokio::test(start_paused = true)]
async fn consumers_restart_after_reconnect() {
    let broker = InMemoryBroker::new();
    let bus = bus_with(
        &broker,
        server_config().with_reconnect_delay(Duration::from_secs(1)),
        BusSettings::default(),
    );
    let work = Recorder::default();
    let fanout = Recorder::default();
    bus.subscribe("default", Subscription::new("OrderCreated", HANDLER, flaky(&work, 0)))
        .unwrap();
    let broadcast = bus
        .subscribe(
            "default",
            Subscription::new("OrderCreated", "orders::audit", flaky(&fanout, 0))
                .mode(DeliveryMode::Broadcast),
        )
        .unwrap();
    let manager = default_manager(&bus);
    running(&bus, &broker, &[QUEUE]).await;
    eventually("broadcast consumer", || {
        broker.consumer_count(&broadcast.queue_name()) == 1
    })
    .await;
    let old_broadcast_queue = broadcast.queue_name();

    broker.sever_connections();
    wait_for_state(&manager, ConnectionState::Closed).await;
    assert_eq!(broker.consumer_count(QUEUE), 0);
    assert!(!broker.queue_names().contains(&old_broadcast_queue));

    wait_for_state(&manager, ConnectionState::Running).await;
    eventually("work consumer", || broker.consumer_count(QUEUE) == 1).await;
    eventually("broadcast consumer", || {
        broadcast.queue_name() != old_broadcast_queue
            && broker.consumer_count(&broadcast.queue_name()) == 1
    })
    .await;

    bus.publish(None, &order_created(), PublishOptions::default())
        .unwrap();
    eventually("deliveries", || work.len() == 1 && fanout.len() == 1).await;
}

#[tokio::test(start_paused = true)]
async fn subscribing_while_running_starts_immediately() {
    let broker = InMemoryBroker::new();
    let bus = bus(&broker);
    running(&bus, &broker, &[]).await;

    let recorder = Recorder::default();
    bus.subscribe("default", Subscription::new("OrderCreated", HANDLER, flaky(&recorder, 0)))
        .unwrap();
    eventually("consumer", || broker.consumer_count(QUEUE) == 1).await;

    bus.publish(None, &order_created(), PublishOptions::default())
        .unwrap();
    eventually("delivery", || recorder.len() == 1).await;
}

// ============================================================================
// Configuration
// ============================================================================

#[tokio::test(start_paused = true)]
async fn bus_built_from_toml_applies_bus_wide_defaults() {
    let config = BusConfig::from_toml_str(
        r#"
        context_when_delivery = ["user_id"]
        event_handle_timeout = 2.5
        event_max_retry = 0

        [servers.default]
        server = "memory"
        url = "memory://localhost"
        exchange = "orders"
        "#,
    )
    .unwrap();
    let broker = InMemoryBroker::new();
    let connectors = HashMap::from([("memory".to_string(), broker.connector())]);
    let bus = EventBus::from_config(&config, &connectors).unwrap();

    let recorder = Recorder::default();
    let consumer = bus
        .subscribe("default", Subscription::new("OrderCreated", HANDLER, failing(&recorder)))
        .unwrap();
    assert_eq!(consumer.timeout(), Duration::from_millis(2500));
    assert_eq!(consumer.retry_limit(), RetryLimit::Limited(0));
    assert_eq!(bus.settings().context_fields, vec!["user_id".to_string()]);

    running(&bus, &broker, &[QUEUE]).await;
    bus.publish(None, &order_created(), PublishOptions::default())
        .unwrap();
    eventually("ack", || broker.acks() == 1).await;
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(broker.publications_to(RETRY_EXCHANGE).is_empty());
    assert!(
        bus.subscribe("audit", Subscription::new("A", "h", failing(&recorder)))
            .is_err()
    );
}
