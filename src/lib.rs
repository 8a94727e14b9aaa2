//! # dbhigh
//!
//! Persistence-resilience layer for a monitoring backend.
//!
//! dbhigh sits between application logic and a relational storage engine and
//! keeps storage access engine-agnostic while surviving transient outages.
//!
//! ## Features
//!
//! - Single physical connection per worker with reconnect policy ([`db::Connection`])
//! - Transactions with down-detection, rollback-on-failure and read-only waits
//! - Collision-free identifier ranges from a shared `ids` ledger ([`ids::IdAllocator`])
//! - `IN`-list condition builder that respects engine expression ceilings
//! - Schema-validated bulk inserts with overflow flushing ([`sql::BulkInsert`])
//! - Pluggable drivers: `SQLite` (always), PostgreSQL (feature `postgres`)
//!
//! ## Example
//!
//! ```rust,ignore
//! use dbhigh::config::DbConfig;
//! use dbhigh::db::{ConnectMode, Connection, SqliteDriver};
//! use dbhigh::ids::IdAllocator;
//! use dbhigh::schema::catalog::default_registry;
//! use dbhigh::sql::{BulkInsert, DbValue};
//! use std::sync::Arc;
//!
//! let registry = Arc::new(default_registry());
//! let mut conn = Connection::new(Box::new(SqliteDriver::new()), DbConfig::sqlite("zabbix.db"));
//! conn.connect(ConnectMode::RetryOrExit)?;
//!
//! let ids = IdAllocator::new(Arc::clone(&registry));
//! let mut insert = BulkInsert::prepare(&registry, "hosts", &["hostid", "host", "name"])?;
//! insert.add_row(vec![DbValue::Id(0), DbValue::from("web-01"), DbValue::from("Web 01")])?;
//! insert.autoincrement("hostid")?;
//!
//! conn.begin()?;
//! insert.execute(&mut conn, &ids)?;
//! conn.commit()?;
//! ```

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(missing_docs)]
#![forbid(unsafe_code)]
// multiple_crate_versions is inherently crate-level (detects duplicate transitive dependencies).
#![allow(clippy::multiple_crate_versions)]

use thiserror::Error as ThisError;

// Module declarations
pub mod config;
pub mod db;
pub mod ids;
pub mod observability;
pub mod schema;
pub mod sql;

// Re-exports for convenience
pub use config::{DbConfig, DbHighConfig};
pub use db::{ConnectMode, Connection, DbStatus, Dialect, Driver};
pub use ids::{IdAllocator, MAX_ID};
pub use schema::{Field, FieldFlags, FieldType, SchemaRegistry, Table};
pub use sql::{BulkInsert, DbValue};

/// Error type for dbhigh operations.
///
/// Uses `thiserror` for automatic `Display` and `Error` trait implementations.
///
/// # Error Variant Triggers
///
/// | Variant | Raised When |
/// |---------|-------------|
/// | `Down` | Connection lost or database read-only, surfaced only by `*_once` calls and inside transactions |
/// | `Statement` | Malformed SQL, constraint violations, statements skipped in a failed transaction |
/// | `Config` | Invalid TLS combination, empty parameters, unknown engine |
/// | `Schema` | Unknown table or field, value tag mismatch, bad auto-increment field |
/// | `IdSpaceExhausted` | Record ids reached [`MAX_ID`] |
/// | `ConnectFatal` | Connect failed in a mode that does not retry |
/// | `NestedTransaction` | `begin` called while a transaction is active |
/// | `InvalidInput` | Bad base64 blob payloads, non-finite floats |
/// | `OperationFailed` | I/O errors, runtime setup, exporter installation |
#[derive(Debug, ThisError)]
pub enum Error {
    /// The database is transiently unreachable.
    ///
    /// Raised when:
    /// - A `*_once` primitive hits a dropped connection
    /// - A statement inside an active transaction hits a dropped connection;
    ///   the transaction is marked failed and must be retried by the caller
    #[error("database is down: {0}")]
    Down(String),

    /// A statement failed and will not be retried.
    #[error("statement '{operation}' failed ({code}): {cause}")]
    Statement {
        /// The kind of statement (`execute`, `select`, `commit`, ...).
        operation: String,
        /// Classified driver error code.
        code: db::ErrorCode,
        /// The underlying cause.
        cause: String,
    },

    /// Configuration is invalid.
    ///
    /// Raised when:
    /// - A TLS parameter is set to an empty string
    /// - The TLS connect mode is unknown, or a verify mode lacks a CA file
    /// - Only part of the certificate/key/CA triple is configured
    /// - The configured engine name is not recognised
    #[error("configuration error: {0}")]
    Config(String),

    /// The schema catalog does not match the request.
    #[error("schema error: {0}")]
    Schema(String),

    /// The identifier space of a table is exhausted.
    #[error("maximum number of id's exceeded [table:{table}, idname:{field}, maxid:{id}]")]
    IdSpaceExhausted {
        /// Table name.
        table: String,
        /// Record id field.
        field: String,
        /// Current maximum record id.
        id: u64,
    },

    /// Connecting failed in a mode that gives up.
    #[error("cannot connect to the database: {0}")]
    ConnectFatal(String),

    /// `begin` was called with a transaction already active.
    #[error("nested transaction detected")]
    NestedTransaction,

    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// An operation failed.
    ///
    /// Raised when:
    /// - Filesystem I/O errors occur (config, log files)
    /// - Async runtime construction fails
    /// - Metrics exporter installation fails
    #[error("operation '{operation}' failed: {cause}")]
    OperationFailed {
        /// The operation that failed.
        operation: String,
        /// The underlying cause.
        cause: String,
    },
}

impl Error {
    /// Returns `true` for deploy-time defects that should terminate the process.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::Schema(_) | Self::IdSpaceExhausted { .. } | Self::ConnectFatal(_)
        )
    }

    /// Returns `true` if the error reports a transiently unavailable database.
    #[must_use]
    pub const fn is_down(&self) -> bool {
        matches!(self, Self::Down(_))
    }
}

/// Result type alias for dbhigh operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::InvalidInput("test error".to_string());
        assert_eq!(err.to_string(), "invalid input: test error");

        let err = Error::OperationFailed {
            operation: "test".to_string(),
            cause: "failed".to_string(),
        };
        assert_eq!(err.to_string(), "operation 'test' failed: failed");

        let err = Error::IdSpaceExhausted {
            table: "hosts".to_string(),
            field: "hostid".to_string(),
            id: 7,
        };
        assert_eq!(
            err.to_string(),
            "maximum number of id's exceeded [table:hosts, idname:hostid, maxid:7]"
        );
    }

    #[test]
    fn test_error_classification() {
        assert!(Error::Config("x".to_string()).is_fatal());
        assert!(Error::Schema("x".to_string()).is_fatal());
        assert!(Error::ConnectFatal("x".to_string()).is_fatal());
        assert!(!Error::Down("x".to_string()).is_fatal());
        assert!(!Error::NestedTransaction.is_fatal());
        assert!(Error::Down("x".to_string()).is_down());
        assert!(!Error::InvalidInput("x".to_string()).is_down());
    }
}
