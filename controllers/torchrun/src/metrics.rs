//! Prometheus metrics of the reconcile loops.

use crate::error::ControllerError;
use prometheus::{Encoder, HistogramOpts, HistogramTimer, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};

/// Reconcile counters and timings, registered in a private registry.
pub struct Metrics {
    registry: Registry,
    reconcile_total: IntCounterVec,
    reconcile_duration_seconds: HistogramVec,
    terminal_failures_total: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self, ControllerError> {
        let registry = Registry::new();

        let reconcile_total = IntCounterVec::new(
            Opts::new("torchrun_controller_reconcile_total", "Reconciliations by kind and result"),
            &["kind", "result"],
        )?;
        let reconcile_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "torchrun_controller_reconcile_duration_seconds",
                "Duration of a reconciliation in seconds",
            )
            .buckets(prometheus::exponential_buckets(0.005, 2.0, 12)?),
            &["kind"],
        )?;
        let terminal_failures_total = IntCounterVec::new(
            Opts::new(
                "torchrun_controller_terminal_failures_total",
                "Objects moved to a terminal failure, by reason",
            ),
            &["reason"],
        )?;

        registry.register(Box::new(reconcile_total.clone()))?;
        registry.register(Box::new(reconcile_duration_seconds.clone()))?;
        registry.register(Box::new(terminal_failures_total.clone()))?;

        Ok(Self {
            registry,
            reconcile_total,
            reconcile_duration_seconds,
            terminal_failures_total,
        })
    }

    /// Starts timing one reconciliation; the duration is recorded when the
    /// timer is dropped or observed.
    #[must_use]
    pub fn start_reconcile(&self, kind: &str) -> HistogramTimer {
        self.reconcile_duration_seconds.with_label_values(&[kind]).start_timer()
    }

    pub fn record_reconcile(&self, kind: &str, result: &str) {
        self.reconcile_total.with_label_values(&[kind, result]).inc();
    }

    pub fn record_terminal_failure(&self, reason: &str) {
        self.terminal_failures_total.with_label_values(&[reason]).inc();
    }

    /// Encodes all metrics in the Prometheus text format.
    pub fn encode(&self) -> Result<String, ControllerError> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| ControllerError::Metrics(prometheus::Error::Msg(e.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_are_encoded() {
        let metrics = Metrics::new().unwrap();
        metrics.record_reconcile("TorchrunJob", "success");
        metrics.record_reconcile("TorchrunJob", "error");
        metrics.record_terminal_failure("QueueNotFound");
        metrics.start_reconcile("TorchrunQueue").observe_duration();

        let encoded = metrics.encode().unwrap();
        assert!(encoded.contains(r#"torchrun_controller_reconcile_total{kind="TorchrunJob",result="success"} 1"#));
        assert!(encoded.contains(r#"torchrun_controller_terminal_failures_total{reason="QueueNotFound"} 1"#));
        assert!(encoded.contains("torchrun_controller_reconcile_duration_seconds_count{kind=\"TorchrunQueue\"} 1"));
    }

    #[test]
    fn test_registries_are_independent() {
        let first = Metrics::new().unwrap();
        let second = Metrics::new().unwrap();
        first.record_terminal_failure("SyncFailed");
        assert!(!second.encode().unwrap().contains("SyncFailed"));
    }
}
