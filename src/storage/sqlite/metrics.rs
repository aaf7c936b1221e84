//! Operation metrics for the `SQLite` stores.

use std::time::Instant;

/// Records the count and latency of a store operation.
///
/// Emits `dedup_storage_operations_total` and
/// `dedup_storage_operation_duration_ms`, both labelled by store, operation
/// and status (`success` or `error`).
pub fn record_operation_metrics(
    store: &'static str,
    operation: &'static str,
    start: Instant,
    status: &'static str,
) {
    metrics::counter!(
        "dedup_storage_operations_total",
        "store" => store,
        "operation" => operation,
        "status" => status
    )
    .increment(1);
    metrics::histogram!(
        "dedup_storage_operation_duration_ms",
        "store" => store,
        "operation" => operation,
        "status" => status
    )
    .record(start.elapsed().as_secs_f64() * 1000.0);
}

/// Records metrics for `result` and passes it through.
pub fn observe<T>(
    store: &'static str,
    operation: &'static str,
    start: Instant,
    result: crate::Result<T>,
) -> crate::Result<T> {
    let status = if result.is_ok() { "success" } else { "error" };
    record_operation_metrics(store, operation, start, status);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn test_observe_passes_result_through() {
        let ok = observe("suspicions", "get", Instant::now(), Ok(3));
        assert_eq!(ok.ok(), Some(3));

        let err: crate::Result<()> = observe(
            "suspicions",
            "get",
            Instant::now(),
            Err(Error::Conflict("x".to_string())),
        );
        assert!(matches!(err, Err(Error::Conflict(_))));
    }
}
