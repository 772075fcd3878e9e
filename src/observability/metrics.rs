//! Storage operation metrics.
//!
//! Emitted through the `metrics` facade. The library installs no recorder;
//! a host application that wants these series installs its own exporter.

use std::time::Duration;

/// Counter of facade operations, labelled by backend, operation and status.
pub const OPERATIONS_TOTAL: &str = "vectormem_operations_total";

/// Histogram of facade operation latency in seconds.
pub const OPERATION_DURATION_SECONDS: &str = "vectormem_operation_duration_seconds";

/// Counter of resilience-layer retries.
pub const RETRIES_TOTAL: &str = "vectormem_retries_total";

/// Records one completed operation.
///
/// For streamed operations the duration covers opening the stream, not
/// draining it.
pub fn record_operation(
    backend: &'static str,
    operation: &'static str,
    status: &'static str,
    elapsed: Duration,
) {
    metrics::counter!(
        OPERATIONS_TOTAL,
        "backend" => backend,
        "operation" => operation,
        "status" => status
    )
    .increment(1);
    metrics::histogram!(
        OPERATION_DURATION_SECONDS,
        "backend" => backend,
        "operation" => operation
    )
    .record(elapsed.as_secs_f64());
}

/// Records a retry attempt made by the resilience layer.
pub fn record_retry(backend: &'static str, operation: &'static str) {
    metrics::counter!(
        RETRIES_TOTAL,
        "backend" => backend,
        "operation" => operation
    )
    .increment(1);
}
