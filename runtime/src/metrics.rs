//! Prometheus metrics for observability and monitoring.
//!
//! Every metric carries a `server` label naming the logical broker server.
//! Consumer metrics also carry the `queue` label.
//!
//! # Example
//!
//! ```rust,no_run
//! use courier_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! // Scrape output
//! let _text = server.render();
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, gauge, histogram};

/// Metric names.
pub mod names {
    /// Messages successfully published by the outbound publisher.
    pub const MESSAGES_PUBLISHED: &str = "courier_messages_published_total";
    /// Failed or timed-out publish attempts.
    pub const PUBLISH_ERRORS: &str = "courier_publish_errors_total";
    /// Messages re-appended to the tail of the outbound queue.
    pub const PUBLISH_REQUEUED: &str = "courier_publish_requeued_total";
    /// Messages parked in the dead letter queue.
    pub const PUBLISH_DEAD_LETTERED: &str = "courier_publish_dead_lettered_total";
    /// Outbound messages still queued when the publisher stopped.
    pub const PUBLISH_DROPPED: &str = "courier_publish_dropped_total";
    /// Deliveries handled successfully.
    pub const MESSAGES_CONSUMED: &str = "courier_messages_consumed_total";
    /// Handler errors, panics and timeouts.
    pub const HANDLER_FAILURES: &str = "courier_handler_failures_total";
    /// Retry copies published to the retry exchange.
    pub const RETRIES_SCHEDULED: &str = "courier_retries_scheduled_total";
    /// Failed deliveries dropped after exhausting retries.
    pub const MESSAGES_DROPPED: &str = "courier_messages_dropped_total";
    /// Connection attempts after a failure.
    pub const RECONNECTS: &str = "courier_reconnects_total";
    /// Handler execution time.
    pub const HANDLER_DURATION: &str = "courier_handler_duration_seconds";
}

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics exporter.
///
/// Installs the global recorder; [`render`](Self::render) produces the text
/// exposition format for the embedding application's `/metrics` endpoint.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Address the embedding application serves metrics on (used for logging)
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Register metric descriptions and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed.
    ///
    /// # Note
    ///
    /// A recorder that is already installed (e.g., in tests) is not an error.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!(addr = %self.addr, "Metrics recorder installed");
                Ok(())
            },
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!(
                        "Metrics recorder already initialized, skipping re-initialization"
                    );
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            },
        }
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if the recorder was not installed by this server.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

fn register_metrics() {
    describe_counter!(
        names::MESSAGES_PUBLISHED,
        "Total number of messages published to the broker"
    );
    describe_counter!(
        names::PUBLISH_ERRORS,
        "Total number of failed or timed-out publish attempts"
    );
    describe_counter!(
        names::PUBLISH_REQUEUED,
        "Total number of messages re-appended to the outbound queue"
    );
    describe_counter!(
        names::PUBLISH_DEAD_LETTERED,
        "Total number of outbound messages parked in the dead letter queue"
    );
    describe_counter!(
        names::PUBLISH_DROPPED,
        "Total number of outbound messages dropped when the publisher stopped"
    );
    describe_counter!(
        names::MESSAGES_CONSUMED,
        "Total number of deliveries handled successfully"
    );
    describe_counter!(
        names::HANDLER_FAILURES,
        "Total number of handler errors, panics and timeouts"
    );
    describe_counter!(
        names::RETRIES_SCHEDULED,
        "Total number of delayed retries scheduled"
    );
    describe_counter!(
        names::MESSAGES_DROPPED,
        "Total number of failed deliveries dropped after exhausting retries"
    );
    describe_counter!(names::RECONNECTS, "Total number of reconnect attempts");
    describe_histogram!(names::HANDLER_DURATION, "Time taken by message handlers");
}

/// Publisher metrics recorder.
pub struct PublisherMetrics;

impl PublisherMetrics {
    /// Record a successful publish.
    pub fn record_published(server: &str) {
        counter!(names::MESSAGES_PUBLISHED, "server" => server.to_string()).increment(1);
    }

    /// Record a failed publish attempt.
    pub fn record_error(server: &str) {
        counter!(names::PUBLISH_ERRORS, "server" => server.to_string()).increment(1);
    }

    /// Record a message re-appended to the queue tail.
    pub fn record_requeued(server: &str) {
        counter!(names::PUBLISH_REQUEUED, "server" => server.to_string()).increment(1);
    }

    /// Record a message parked in the dead letter queue.
    pub fn record_dead_lettered(server: &str) {
        counter!(names::PUBLISH_DEAD_LETTERED, "server" => server.to_string()).increment(1);
    }

    /// Record messages left unpublished when the publisher stopped.
    pub fn record_dropped(server: &str, count: u64) {
        counter!(names::PUBLISH_DROPPED, "server" => server.to_string()).increment(count);
    }
}

/// Consumer metrics recorder.
pub struct ConsumerMetrics;

impl ConsumerMetrics {
    /// Record the handler run time.
    pub fn record_duration(server: &str, queue: &str, duration: Duration) {
        histogram!(
            names::HANDLER_DURATION,
            "server" => server.to_string(),
            "queue" => queue.to_string()
        )
        .record(duration.as_secs_f64());
    }

    /// Record a successfully handled delivery.
    pub fn record_consumed(server: &str, queue: &str) {
        counter!(
            names::MESSAGES_CONSUMED,
            "server" => server.to_string(),
            "queue" => queue.to_string()
        )
        .increment(1);
    }

    /// Record a handler failure.
    pub fn record_failure(server: &str, queue: &str) {
        counter!(
            names::HANDLER_FAILURES,
            "server" => server.to_string(),
            "queue" => queue.to_string()
        )
        .increment(1);
    }

    /// Record a scheduled retry.
    pub fn record_retry(server: &str, queue: &str) {
        counter!(
            names::RETRIES_SCHEDULED,
            "server" => server.to_string(),
            "queue" => queue.to_string()
        )
        .increment(1);
    }

    /// Record a delivery dropped after exhausting retries.
    pub fn record_dropped(server: &str, queue: &str) {
        counter!(
            names::MESSAGES_DROPPED,
            "server" => server.to_string(),
            "queue" => queue.to_string()
        )
        .increment(1);
    }
}

/// Connection metrics recorder.
pub struct ConnectionMetrics;

impl ConnectionMetrics {
    /// Record a reconnect attempt.
    pub fn record_reconnect(server: &str) {
        counter!(names::RECONNECTS, "server" => server.to_string()).increment(1);
    }
}
