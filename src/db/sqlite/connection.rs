//! Connection setup and error classification for the embedded engine.

use crate::db::{DriverError, ErrorCode};
use rusqlite::Connection;
use std::time::Duration;

/// Default lock wait before a statement reports the database busy.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Applies connection pragmas.
///
/// - WAL journal so readers do not block the writer
/// - NORMAL synchronous mode
/// - `busy_timeout` so lock contention waits instead of failing at once
///
/// In-memory databases silently keep their `memory` journal mode.
pub fn configure_connection(conn: &Connection, busy_timeout: Duration) {
    // journal_mode returns the new mode as a row; the value is not needed.
    let _ = conn.pragma_update(None, "journal_mode", "WAL");
    let _ = conn.pragma_update(None, "synchronous", "NORMAL");
    let _ = conn.busy_timeout(busy_timeout);
}

/// Classifies an engine error.
///
/// Lock contention that outlived the busy timeout is transient; everything
/// else is a statement or configuration error.
pub fn classify(err: &rusqlite::Error, code: ErrorCode) -> DriverError {
    match err {
        rusqlite::Error::SqliteFailure(failure, message) => {
            let message = message.clone().unwrap_or_else(|| failure.to_string());
            match failure.code {
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked => {
                    DriverError::down(code, message)
                },
                _ => DriverError::fail(code, message),
            }
        },
        other => DriverError::fail(code, other.to_string()),
    }
}
