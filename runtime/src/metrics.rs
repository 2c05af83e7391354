//! Prometheus metrics for the consumer loop and the producer engine.
//!
//! Counters are recorded through the [`metrics`] facade and are no-ops until
//! a recorder is installed. [`MetricsServer`] installs the Prometheus one.
//!
//! # Example
//!
//! ```rust,no_run
//! use relaykit_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! // Hand `server.render()` to whatever serves /metrics
//! # Ok(())
//! # }
//! ```

use metrics::describe_counter;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use thiserror::Error;

/// Messages read by a consumer, labelled by `topic`.
pub const CONSUMER_MESSAGES_TOTAL: &str = "relaykit_consumer_messages_total";
/// Middleware or handler failures, labelled by `topic`.
pub const CONSUMER_HANDLER_FAILURES_TOTAL: &str = "relaykit_consumer_handler_failures_total";
/// Failed explicit offset commits.
pub const CONSUMER_COMMIT_FAILURES_TOTAL: &str = "relaykit_consumer_commit_failures_total";
/// Sends retried after a full local queue.
pub const PRODUCER_RETRIES_TOTAL: &str = "relaykit_producer_retries_total";
/// Sends abandoned after the retry budget ran out.
pub const PRODUCER_TIMEOUTS_TOTAL: &str = "relaykit_producer_timeouts_total";
/// Events seen by the event dispatcher, labelled by `outcome`.
pub const PRODUCER_DELIVERY_EVENTS_TOTAL: &str = "relaykit_producer_delivery_events_total";
/// Shared-stream events dropped because the stream was full.
pub use relaykit_redpanda::producer::EVENTS_DROPPED_TOTAL as PRODUCER_EVENTS_DROPPED_TOTAL;

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus recorder for relaykit metrics.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// `addr` is where the caller serves the rendered output; it is only
    /// used for logging.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Register metric descriptions and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::Install`] if the recorder cannot be installed
    /// for a reason other than one already being present.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!(addr = %self.addr, "Metrics recorder installed");
                Ok(())
            },
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            },
        }
    }

    /// Render current metrics in Prometheus text format.
    ///
    /// Returns `None` if the recorder was not installed by this server.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

fn register_metrics() {
    describe_counter!(CONSUMER_MESSAGES_TOTAL, "Total number of messages read by consumers");
    describe_counter!(
        CONSUMER_HANDLER_FAILURES_TOTAL,
        "Total number of messages whose middleware or handler failed"
    );
    describe_counter!(
        CONSUMER_COMMIT_FAILURES_TOTAL,
        "Total number of failed offset commits"
    );
    describe_counter!(
        PRODUCER_RETRIES_TOTAL,
        "Total number of sends retried because the local queue was full"
    );
    describe_counter!(
        PRODUCER_TIMEOUTS_TOTAL,
        "Total number of sends abandoned after exhausting retries"
    );
    describe_counter!(
        PRODUCER_DELIVERY_EVENTS_TOTAL,
        "Total number of producer events dispatched, by outcome"
    );
    describe_counter!(
        PRODUCER_EVENTS_DROPPED_TOTAL,
        "Total number of producer events dropped because the event stream was full"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_is_none_before_start() {
        let server = MetricsServer::new(SocketAddr::from(([127, 0, 0, 1], 9090)));
        assert!(server.render().is_none());
    }

    #[test]
    fn metric_names_are_prefixed() {
        for name in [
            CONSUMER_MESSAGES_TOTAL,
            CONSUMER_HANDLER_FAILURES_TOTAL,
            CONSUMER_COMMIT_FAILURES_TOTAL,
            PRODUCER_RETRIES_TOTAL,
            PRODUCER_TIMEOUTS_TOTAL,
            PRODUCER_DELIVERY_EVENTS_TOTAL,
            PRODUCER_EVENTS_DROPPED_TOTAL,
        ] {
            assert!(name.starts_with("relaykit_"), "{name}");
            assert!(name.ends_with("_total"), "{name}");
        }
    }
}
