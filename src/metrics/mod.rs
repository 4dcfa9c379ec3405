//! Metrics sink interface
//!
//! Every component reports through [`MetricsSink`]. Calls are fire-and-forget:
//! implementations must not block for long and must never fail into the
//! caller. Backends are out of scope; the crate ships an in-memory sink (used
//! by tests and the end-of-run summary), a tracing sink and a no-op sink.

mod memory;

pub use memory::{HistogramSummary, InMemoryMetrics, MetricsSnapshot};

/// Tag list attached to a sample, e.g. `&[("domain", "example.com")]`
pub type Tags<'a> = &'a [(&'a str, &'a str)];

/// Metric names emitted by the orchestration core
pub mod names {
    pub const FRONTIER_DEPTH: &str = "frontier.depth";
    pub const TASK_SUBMITTED: &str = "task.submitted";
    pub const TASK_DUPLICATE: &str = "task.duplicate";
    pub const TASK_DISPATCHED: &str = "task.dispatched";
    pub const TASK_RETRIED: &str = "task.retried";
    pub const TASK_DONE: &str = "task.done";
    pub const TASK_ABANDONED: &str = "task.abandoned";
    pub const TASK_DISCARDED: &str = "task.discarded";
    pub const FETCH_LATENCY_MS: &str = "fetch.latency_ms";
    pub const FETCH_ERROR: &str = "fetch.error";
    pub const BUDGET_WAIT_MS: &str = "budget.wait_ms";
    pub const CIRCUIT_OPENED: &str = "circuit.opened";
    pub const CIRCUIT_CLOSED: &str = "circuit.closed";
    pub const CIRCUIT_PROBE: &str = "circuit.probe";
    pub const PROXY_COOLDOWN: &str = "proxy.cooldown";
    pub const PROXY_UNAVAILABLE: &str = "proxy.unavailable";
    pub const WORKERS_BUSY: &str = "workers.busy";
}

/// Passive counters, histograms and gauges consumed by all components
pub trait MetricsSink: Send + Sync {
    fn increment(&self, name: &str, tags: Tags<'_>);

    fn observe(&self, name: &str, value: f64, tags: Tags<'_>);

    fn gauge(&self, name: &str, value: f64, tags: Tags<'_>);
}

/// Discards every sample
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn increment(&self, _name: &str, _tags: Tags<'_>) {}

    fn observe(&self, _name: &str, _value: f64, _tags: Tags<'_>) {}

    fn gauge(&self, _name: &str, _value: f64, _tags: Tags<'_>) {}
}

/// Emits every sample as a trace-level event under the `metrics` target
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn increment(&self, name: &str, tags: Tags<'_>) {
        tracing::trace!(target: "metrics", "count {} {}", name, format_tags(tags));
    }

    fn observe(&self, name: &str, value: f64, tags: Tags<'_>) {
        tracing::trace!(target: "metrics", "observe {}={} {}", name, value, format_tags(tags));
    }

    fn gauge(&self, name: &str, value: f64, tags: Tags<'_>) {
        tracing::trace!(target: "metrics", "gauge {}={} {}", name, value, format_tags(tags));
    }
}

/// Fans every sample out to several sinks
pub struct FanoutMetrics {
    sinks: Vec<std::sync::Arc<dyn MetricsSink>>,
}

impl FanoutMetrics {
    pub fn new(sinks: Vec<std::sync::Arc<dyn MetricsSink>>) -> Self {
        Self { sinks }
    }
}

impl MetricsSink for FanoutMetrics {
    fn increment(&self, name: &str, tags: Tags<'_>) {
        for sink in &self.sinks {
            sink.increment(name, tags);
        }
    }

    fn observe(&self, name: &str, value: f64, tags: Tags<'_>) {
        for sink in &self.sinks {
            sink.observe(name, value, tags);
        }
    }

    fn gauge(&self, name: &str, value: f64, tags: Tags<'_>) {
        for sink in &self.sinks {
            sink.gauge(name, value, tags);
        }
    }
}

/// Renders tags as `k=v,k=v` sorted by key, so equal tag sets format equally
pub(crate) fn format_tags(tags: Tags<'_>) -> String {
    let mut sorted: Vec<_> = tags.to_vec();
    sorted.sort_unstable();
    sorted
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}
