//! Shared fixtures for the runtime integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use courier_core::{Envelope, RequestContext};
use courier_runtime::{BusSettings, ConnectionManager, ConnectionState, EventBus, ServerConfig};
use courier_testing::{InMemoryBroker, init_test_tracing, test_clock};
use std::future::Ready;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

pub const URL: &str = "memory://localhost";
pub const EXCHANGE: &str = "orders";
pub const RETRY_EXCHANGE: &str = "orders_retry_exchange";
pub const RETRY_QUEUE: &str = "orders_retry_queue";

pub fn server_config() -> ServerConfig {
    ServerConfig::new("memory", URL, EXCHANGE)
}

pub fn bus_with(broker: &InMemoryBroker, config: ServerConfig, settings: BusSettings) -> EventBus {
    init_test_tracing();
    EventBus::builder()
        .connector("memory", broker.connector())
        .server("default", config)
        .settings(settings)
        .clock(Arc::new(test_clock()))
        .build()
        .unwrap()
}

pub fn bus(broker: &InMemoryBroker) -> EventBus {
    bus_with(broker, server_config(), BusSettings::default())
}

pub fn default_manager(bus: &EventBus) -> ConnectionManager {
    bus.lookup_server("default").unwrap()
}

/// Wait (in virtual time) until the manager reaches `state`.
pub async fn wait_for_state(manager: &ConnectionManager, state: ConnectionState) {
    let mut changes = manager.state_changes();
    tokio::time::timeout(Duration::from_secs(600), changes.wait_for(|s| *s == state))
        .await
        .unwrap_or_else(|_| panic!("manager never reached {state}"))
        .map(|_| ())
        .expect("state channel closed");
}

/// Poll `condition` every 10ms of virtual time for up to 10 minutes.
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..60_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// One handler invocation.
#[derive(Clone)]
pub struct Call {
    pub ctx: RequestContext,
    pub envelope: Envelope,
    pub at: Instant,
}

/// Records every handler invocation.
#[derive(Clone, Default)]
pub struct Recorder {
    calls: Arc<Mutex<Vec<Call>>>,
}

impl Recorder {
    /// Record a call and return its 1-based attempt number.
    pub fn record(&self, ctx: &RequestContext, envelope: &Envelope) -> usize {
        let mut calls = self.calls.lock().unwrap();
        calls.push(Call {
            ctx: ctx.clone(),
            envelope: envelope.clone(),
            at: Instant::now(),
        });
        calls.len()
    }

    pub fn len(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }
}

/// Handler that fails its first `failures` attempts and then succeeds.
pub fn flaky(
    recorder: &Recorder,
    failures: usize,
) -> impl Fn(RequestContext, Envelope) -> Ready<anyhow::Result<()>> + Send + Sync + 'static {
    let recorder = recorder.clone();
    move |ctx: RequestContext, envelope: Envelope| {
        let attempt = recorder.record(&ctx, &envelope);
        std::future::ready(if attempt <= failures {
            Err(anyhow::anyhow!("attempt {attempt} failed"))
        } else {
            Ok(())
        })
    }
}

/// Handler that never succeeds.
pub fn failing(
    recorder: &Recorder,
) -> impl Fn(RequestContext, Envelope) -> Ready<anyhow::Result<()>> + Send + Sync + 'static {
    flaky(recorder, usize::MAX)
}
