//! Metrics for route synchronization
//!
//! Instruments are registered against the global meter, which is a no-op
//! until telemetry installs an OTLP meter provider.

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;

static METER: Lazy<Meter> = Lazy::new(|| global::meter("vm-route-forge"));

/// Counter of VM keys enqueued because kernel state diverged from the cache
///
/// Labels:
/// - `watcher`: netlink, periodic
pub static DRIFT_DETECTED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("route_forge_drift_detected_total")
        .with_description("VM keys enqueued after a kernel route diverged from the address cache")
        .with_unit("{keys}")
        .build()
});

/// Counter of per-key reconciliations
///
/// Labels:
/// - `result`: converged, requeued, error
pub static RECONCILE_TOTAL: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("route_forge_reconcile_total")
        .with_description("Route reconciliations by outcome")
        .with_unit("{reconciliations}")
        .build()
});

/// Histogram of per-key reconciliation duration
pub static RECONCILE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("route_forge_reconcile_duration_seconds")
        .with_description("Duration of a single VM route reconciliation in seconds")
        .with_unit("s")
        .build()
});

/// Record one drift detection for `watcher`
pub fn record_drift(watcher: &'static str) {
    DRIFT_DETECTED.add(1, &[KeyValue::new("watcher", watcher)]);
}

/// Record the outcome and duration of one reconciliation
pub fn record_reconcile(result: &'static str, seconds: f64) {
    RECONCILE_TOTAL.add(1, &[KeyValue::new("result", result)]);
    RECONCILE_DURATION.record(seconds, &[KeyValue::new("result", result)]);
}
