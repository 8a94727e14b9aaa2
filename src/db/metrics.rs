//! Metrics recording for database primitives.

use super::DbStatus;
use std::time::Instant;

/// Records metrics for one primitive call.
///
/// This function records two metrics:
/// 1. `db_statements_total` - Counter by kind and status
/// 2. `db_statement_duration_ms` - Histogram by kind
///
/// # Arguments
///
/// * `kind` - Primitive name (e.g., "execute", "select", "commit")
/// * `start` - Operation start time from `Instant::now()`
/// * `status` - Outcome of the call
pub fn record_statement(kind: &'static str, start: Instant, status: DbStatus) {
    metrics::counter!(
        "db_statements_total",
        "kind" => kind,
        "status" => status.as_str()
    )
    .increment(1);
    metrics::histogram!(
        "db_statement_duration_ms",
        "kind" => kind
    )
    .record(start.elapsed().as_secs_f64() * 1000.0);
}

/// Records one reconnect attempt.
pub fn record_reconnect(outcome: DbStatus) {
    metrics::counter!("db_reconnects_total", "status" => outcome.as_str()).increment(1);
}

/// Records a successful id range reservation.
pub fn record_ids_reserved(table: &str, count: u64) {
    metrics::counter!("db_ids_reserved_total", "table" => table.to_string()).increment(count);
}

/// Records rows written by a bulk insert.
pub fn record_rows_inserted(table: &str, rows: usize) {
    metrics::counter!("db_rows_inserted_total", "table" => table.to_string()).increment(rows as u64);
}
