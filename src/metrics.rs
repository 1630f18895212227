//! Bridge metrics collection and exposition.
//!
//! One [`BridgeMetrics`] is shared by an environment and every thread-safe
//! function created from it, so the counters are atomics that may be bumped
//! from any thread.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of the bridge counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeStats {
    /// References created
    pub references_created: u64,
    /// References explicitly deleted
    pub references_deleted: u64,
    /// Native finalizers that ran
    pub finalizers_run: u64,
    /// Engine exceptions moved into the pending-exception slot
    pub exceptions_captured: u64,
    /// Thread-safe function calls handed to the executor
    pub tsfn_calls_dispatched: u64,
    /// Thread-safe function calls that reached the context thread
    pub tsfn_calls_executed: u64,
    /// Thread-safe functions torn down
    pub tsfns_finalized: u64,
    /// Environment cleanup hooks run
    pub cleanup_hooks_run: u64,
}

impl BridgeStats {
    /// References created and not yet deleted
    pub fn live_references(&self) -> u64 {
        self.references_created
            .saturating_sub(self.references_deleted)
    }
}

/// Counters for one environment
#[derive(Debug, Default)]
pub struct BridgeMetrics {
    references_created: AtomicU64,
    references_deleted: AtomicU64,
    finalizers_run: AtomicU64,
    exceptions_captured: AtomicU64,
    tsfn_calls_dispatched: AtomicU64,
    tsfn_calls_executed: AtomicU64,
    tsfns_finalized: AtomicU64,
    cleanup_hooks_run: AtomicU64,
}

impl BridgeMetrics {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn reference_created(&self) {
        self.references_created.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn reference_deleted(&self) {
        self.references_deleted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn finalizer_ran(&self) {
        self.finalizers_run.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn exception_captured(&self) {
        self.exceptions_captured.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn tsfn_call_dispatched(&self) {
        self.tsfn_calls_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn tsfn_call_executed(&self) {
        self.tsfn_calls_executed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn tsfn_finalized(&self) {
        self.tsfns_finalized.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn cleanup_hooks_ran(&self, count: u64) {
        self.cleanup_hooks_run.fetch_add(count, Ordering::Relaxed);
    }

    /// Copy the current counter values
    pub fn snapshot(&self) -> BridgeStats {
        BridgeStats {
            references_created: self.references_created.load(Ordering::Relaxed),
            references_deleted: self.references_deleted.load(Ordering::Relaxed),
            finalizers_run: self.finalizers_run.load(Ordering::Relaxed),
            exceptions_captured: self.exceptions_captured.load(Ordering::Relaxed),
            tsfn_calls_dispatched: self.tsfn_calls_dispatched.load(Ordering::Relaxed),
            tsfn_calls_executed: self.tsfn_calls_executed.load(Ordering::Relaxed),
            tsfns_finalized: self.tsfns_finalized.load(Ordering::Relaxed),
            cleanup_hooks_run: self.cleanup_hooks_run.load(Ordering::Relaxed),
        }
    }

    /// Reset all counters
    pub fn reset(&self) {
        for counter in [
            &self.references_created,
            &self.references_deleted,
            &self.finalizers_run,
            &self.exceptions_captured,
            &self.tsfn_calls_dispatched,
            &self.tsfn_calls_executed,
            &self.tsfns_finalized,
            &self.cleanup_hooks_run,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    /// Export Prometheus-format metrics
    pub fn to_prometheus(&self) -> String {
        let stats = self.snapshot();
        let mut output = String::new();

        output.push_str("# HELP napi_bridge_references_total References by lifecycle event\n");
        output.push_str("# TYPE napi_bridge_references_total counter\n");
        output.push_str(&format!(
            "napi_bridge_references_total{{event=\"created\"}} {}\n",
            stats.references_created
        ));
        output.push_str(&format!(
            "napi_bridge_references_total{{event=\"deleted\"}} {}\n",
            stats.references_deleted
        ));

        output.push_str("\n# HELP napi_bridge_finalizers_total Native finalizers run\n");
        output.push_str("# TYPE napi_bridge_finalizers_total counter\n");
        output.push_str(&format!("napi_bridge_finalizers_total {}\n", stats.finalizers_run));

        output.push_str("\n# HELP napi_bridge_exceptions_total Engine exceptions captured\n");
        output.push_str("# TYPE napi_bridge_exceptions_total counter\n");
        output.push_str(&format!(
            "napi_bridge_exceptions_total {}\n",
            stats.exceptions_captured
        ));

        output.push_str("\n# HELP napi_bridge_tsfn_calls_total Thread-safe function calls\n");
        output.push_str("# TYPE napi_bridge_tsfn_calls_total counter\n");
        output.push_str(&format!(
            "napi_bridge_tsfn_calls_total{{stage=\"dispatched\"}} {}\n",
            stats.tsfn_calls_dispatched
        ));
        output.push_str(&format!(
            "napi_bridge_tsfn_calls_total{{stage=\"executed\"}} {}\n",
            stats.tsfn_calls_executed
        ));

        output.push_str(
            "\n# HELP napi_bridge_tsfn_finalized_total Thread-safe functions torn down\n",
        );
        output.push_str("# TYPE napi_bridge_tsfn_finalized_total counter\n");
        output.push_str(&format!(
            "napi_bridge_tsfn_finalized_total {}\n",
            stats.tsfns_finalized
        ));

        output.push_str("\n# HELP napi_bridge_cleanup_hooks_total Environment cleanup hooks run\n");
        output.push_str("# TYPE napi_bridge_cleanup_hooks_total counter\n");
        output.push_str(&format!(
            "napi_bridge_cleanup_hooks_total {}\n",
            stats.cleanup_hooks_run
        ));

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_counts() {
        let metrics = BridgeMetrics::new();
        metrics.reference_created();
        metrics.reference_created();
        metrics.reference_deleted();
        metrics.cleanup_hooks_ran(3);

        let stats = metrics.snapshot();
        assert_eq!(stats.references_created, 2);
        assert_eq!(stats.live_references(), 1);
        assert_eq!(stats.cleanup_hooks_run, 3);
    }

    #[test]
    fn test_reset() {
        let metrics = BridgeMetrics::new();
        metrics.finalizer_ran();
        metrics.tsfn_call_dispatched();
        metrics.reset();
        assert_eq!(metrics.snapshot(), BridgeStats::default());
    }

    #[test]
    fn test_prometheus_export() {
        let metrics = BridgeMetrics::new();
        metrics.exception_captured();
        metrics.tsfn_call_executed();

        let output = metrics.to_prometheus();
        assert!(output.contains("# TYPE napi_bridge_references_total counter"));
        assert!(output.contains("napi_bridge_exceptions_total 1"));
        assert!(output.contains("napi_bridge_tsfn_calls_total{stage=\"executed\"} 1"));
    }

    #[test]
    fn test_stats_serialization() {
        let stats = BridgeMetrics::new().snapshot();
        let json = serde_json::to_string(&stats).unwrap();
        assert!(json.contains("tsfnCallsDispatched"));
    }
}
