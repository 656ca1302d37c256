//! Prometheus metrics for the jsplay sandbox.
//!
//! This module is only compiled when the `metrics` feature is enabled.

use std::time::Duration;

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

/// Label set for execution metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    /// `success` or a fault kind such as `timeout` or `runtime`.
    pub outcome: String,
}

/// Execution counters and timings.
pub struct SandboxMetrics {
    /// Total number of executions by outcome.
    pub executions_total: Family<OutcomeLabels, Counter>,
    /// Execution duration in seconds by outcome.
    pub execution_duration_seconds: Family<OutcomeLabels, Histogram>,
}

impl SandboxMetrics {
    /// Create the metrics and register them with `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let executions_total = Family::default();
        registry.register(
            "jsplay_executions",
            "Total sandbox executions",
            executions_total.clone(),
        );

        let execution_duration_seconds =
            Family::<OutcomeLabels, Histogram>::new_with_constructor(|| {
                Histogram::new([0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0].into_iter())
            });
        registry.register(
            "jsplay_execution_duration_seconds",
            "Sandbox execution duration",
            execution_duration_seconds.clone(),
        );

        Self {
            executions_total,
            execution_duration_seconds,
        }
    }

    /// Record one finished execution.
    pub fn record_execution(&self, outcome: &str, elapsed: Duration) {
        let labels = OutcomeLabels {
            outcome: outcome.to_string(),
        };
        self.executions_total.get_or_create(&labels).inc();
        self.execution_duration_seconds
            .get_or_create(&labels)
            .observe(elapsed.as_secs_f64());
    }
}
