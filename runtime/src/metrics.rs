//! Prometheus metrics for observability.
//!
//! This module provides metric collection shared by every transport crate:
//! - Publish/consume throughput and latency
//! - Circuit breaker state
//! - Retry attempts
//!
//! # Example
//!
//! ```rust,no_run
//! use relaybus_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

// Re-export metrics macros for use in other crates.
pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
    /// Failed to bind HTTP server
    #[error("Failed to bind metrics server: {0}")]
    Bind(#[from] std::io::Error),
}

/// Prometheus metrics server.
///
/// Exposes metrics on an HTTP endpoint for Prometheus scraping.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Initialize metrics and start the HTTP server.
    ///
    /// # Errors
    ///
    /// Returns an error if the metrics exporter cannot be installed or the
    /// server cannot bind.
    ///
    /// # Note
    ///
    /// If a metrics recorder is already installed (e.g. in tests), this will
    /// fail with `MetricsError::Install`. In production, ensure this is only
    /// called once.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!(
                    addr = %self.addr,
                    "Metrics server started - available at http://{}/metrics",
                    self.addr
                );
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if the server hasn't been started.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    describe_counter!(
        "relaybus_messages_published_total",
        "Total number of messages published"
    );
    describe_counter!(
        "relaybus_messages_consumed_total",
        "Total number of messages successfully consumed"
    );
    describe_counter!(
        "relaybus_publish_errors_total",
        "Total number of publish errors"
    );
    describe_counter!(
        "relaybus_consume_errors_total",
        "Total number of consumer dispatch failures"
    );
    describe_counter!(
        "relaybus_deadlettered_total",
        "Total number of messages routed to a dead-letter destination"
    );
    describe_histogram!(
        "relaybus_publish_duration_seconds",
        "Time taken to publish a message, including retries"
    );
    describe_histogram!(
        "relaybus_dispatch_duration_seconds",
        "Time taken to run a consumer's dispatcher against one message"
    );

    describe_gauge!(
        "relaybus_circuit_breaker_state",
        "Current circuit breaker state (0=closed, 1=half-open, 2=open)"
    );
    describe_counter!(
        "relaybus_circuit_breaker_calls_total",
        "Total number of calls through a circuit breaker"
    );
    describe_counter!(
        "relaybus_circuit_breaker_successes_total",
        "Total number of successful calls"
    );
    describe_counter!(
        "relaybus_circuit_breaker_failures_total",
        "Total number of failed calls"
    );
    describe_counter!(
        "relaybus_circuit_breaker_rejections_total",
        "Total number of rejected calls (circuit open)"
    );

    describe_counter!(
        "relaybus_retry_attempts_total",
        "Total number of retry attempts"
    );
    describe_counter!(
        "relaybus_retry_successes_total",
        "Total number of operations that succeeded after at least one retry"
    );
    describe_counter!(
        "relaybus_retry_exhausted_total",
        "Total number of operations that exhausted their retry budget"
    );
}

/// Publish/consume throughput and latency metrics recorder.
pub struct BusMetrics;

impl BusMetrics {
    /// Record a successful publish.
    pub fn record_publish(duration: Duration) {
        counter!("relaybus_messages_published_total").increment(1);
        histogram!("relaybus_publish_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a publish error.
    pub fn record_publish_error() {
        counter!("relaybus_publish_errors_total").increment(1);
    }

    /// Record a successfully dispatched consume.
    pub fn record_consume(duration: Duration) {
        counter!("relaybus_messages_consumed_total").increment(1);
        histogram!("relaybus_dispatch_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a consumer dispatch failure.
    pub fn record_consume_error() {
        counter!("relaybus_consume_errors_total").increment(1);
    }

    /// Record a message routed to a dead-letter destination.
    pub fn record_deadlettered() {
        counter!("relaybus_deadlettered_total").increment(1);
    }
}

/// Circuit breaker metrics recorder.
pub struct CircuitBreakerMetrics;

impl CircuitBreakerMetrics {
    /// Record circuit breaker state. 0 = Closed, 1 = `HalfOpen`, 2 = Open.
    pub fn record_state(state: f64) {
        gauge!("relaybus_circuit_breaker_state").set(state);
    }

    /// Record a call attempt.
    pub fn record_call() {
        counter!("relaybus_circuit_breaker_calls_total").increment(1);
    }

    /// Record a successful call.
    pub fn record_success() {
        counter!("relaybus_circuit_breaker_successes_total").increment(1);
    }

    /// Record a failed call.
    pub fn record_failure() {
        counter!("relaybus_circuit_breaker_failures_total").increment(1);
    }

    /// Record a rejected call (circuit open).
    pub fn record_rejection() {
        counter!("relaybus_circuit_breaker_rejections_total").increment(1);
    }
}

/// Retry metrics recorder.
pub struct RetryMetrics;

impl RetryMetrics {
    /// Record a retry attempt.
    pub fn record_attempt() {
        counter!("relaybus_retry_attempts_total").increment(1);
    }

    /// Record a successful retry.
    pub fn record_success() {
        counter!("relaybus_retry_successes_total").increment(1);
    }

    /// Record exhausted retries.
    pub fn record_exhausted() {
        counter!("relaybus_retry_exhausted_total").increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_metrics_server_creation() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let server = MetricsServer::new(addr);
        assert!(server.handle().is_none());
    }

    #[tokio::test]
    async fn test_metrics_server_start() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let mut server = MetricsServer::new(addr);
        let result = server.start();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_bus_metrics_render() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let mut server = MetricsServer::new(addr);
        server.start().unwrap();

        BusMetrics::record_publish(Duration::from_millis(50));
        BusMetrics::record_consume(Duration::from_millis(20));

        if let Some(rendered) = server.render() {
            assert!(rendered.contains("relaybus_messages_published_total"));
            assert!(rendered.contains("relaybus_messages_consumed_total"));
        }
    }

    #[tokio::test]
    async fn test_circuit_breaker_metrics() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let mut server = MetricsServer::new(addr);
        server.start().unwrap();

        CircuitBreakerMetrics::record_state(0.0);
        CircuitBreakerMetrics::record_call();
        CircuitBreakerMetrics::record_success();

        if let Some(rendered) = server.render() {
            assert!(rendered.contains("relaybus_circuit_breaker_state"));
            assert!(rendered.contains("relaybus_circuit_breaker_calls_total"));
        }
    }
}
