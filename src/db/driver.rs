//! Engine driver interface.
//!
//! A [`Driver`] owns one physical connection and speaks the engine's wire
//! protocol. It classifies every failure as either [`DbStatus::Down`]
//! (transient, the connection layer reconnects and retries) or
//! [`DbStatus::Fail`] (the statement is wrong and must not be retried).

use super::Dialect;
use crate::config::DbConfig;
use std::collections::VecDeque;

/// Outcome of a primitive database operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DbStatus {
    /// The operation succeeded.
    #[default]
    Ok,
    /// The database is transiently unreachable or read-only.
    Down,
    /// The operation failed and must not be retried.
    Fail,
}

impl DbStatus {
    /// Returns the lowercase status name used in logs and metrics labels.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Down => "down",
            Self::Fail => "fail",
        }
    }
}

impl std::fmt::Display for DbStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classified driver error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ErrorCode {
    /// No error recorded.
    #[default]
    None,
    /// Connecting failed.
    Connect,
    /// The server only accepts read-only transactions (failover replica).
    ReadOnly,
    /// A data-modifying statement failed.
    Execute,
    /// A query failed.
    Select,
    /// Begin, commit or rollback failed.
    Transaction,
}

impl ErrorCode {
    /// Returns the lowercase code name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Connect => "connect",
            Self::ReadOnly => "read_only",
            Self::Execute => "execute",
            Self::Select => "select",
            Self::Transaction => "transaction",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified driver failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverError {
    /// `Down` or `Fail`.
    pub status: DbStatus,
    /// Error code.
    pub code: ErrorCode,
    /// Engine error message.
    pub message: String,
}

impl DriverError {
    /// Creates a transient failure.
    #[must_use]
    pub fn down(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: DbStatus::Down,
            code,
            message: message.into(),
        }
    }

    /// Creates a permanent failure.
    #[must_use]
    pub fn fail(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: DbStatus::Fail,
            code,
            message: message.into(),
        }
    }

    /// Returns `true` for transient failures.
    #[must_use]
    pub fn is_down(&self) -> bool {
        self.status == DbStatus::Down
    }
}

impl std::fmt::Display for DriverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for DriverError {}

/// A row of nullable text columns.
pub type Row = Vec<Option<String>>;

/// Buffered query result.
///
/// Rows are fetched in order; the result is released when dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultSet {
    columns: Vec<String>,
    rows: VecDeque<Row>,
}

impl ResultSet {
    /// Creates a result set.
    #[must_use]
    pub fn new(columns: Vec<String>, rows: Vec<Row>) -> Self {
        Self {
            columns,
            rows: rows.into(),
        }
    }

    /// Returns the column names.
    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Fetches the next row.
    pub fn fetch(&mut self) -> Option<Row> {
        self.rows.pop_front()
    }

    /// Number of rows not yet fetched.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns `true` if no rows remain.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Keeps at most `n` remaining rows.
    pub fn truncate(&mut self, n: usize) {
        self.rows.truncate(n);
    }
}

impl Iterator for ResultSet {
    type Item = Row;

    fn next(&mut self) -> Option<Row> {
        self.fetch()
    }
}

/// An engine binding for one physical connection.
pub trait Driver: Send {
    /// Returns the SQL dialect of this engine.
    fn dialect(&self) -> Dialect;

    /// Opens the connection.
    ///
    /// # Errors
    ///
    /// `Down` when the server is unreachable, `Fail` on configuration or
    /// authentication errors.
    fn connect(&mut self, config: &DbConfig) -> Result<(), DriverError>;

    /// Closes the connection. Safe to call when not connected.
    fn close(&mut self);

    /// Returns `true` while a connection is open.
    fn is_connected(&self) -> bool;

    /// Executes one or more statements, returning the number of affected rows.
    ///
    /// # Errors
    ///
    /// `Down` when the connection dropped, `Fail` on statement errors.
    fn execute(&mut self, sql: &str) -> Result<u64, DriverError>;

    /// Runs a query and buffers its rows.
    ///
    /// # Errors
    ///
    /// `Down` when the connection dropped, `Fail` on statement errors.
    fn select(&mut self, sql: &str) -> Result<ResultSet, DriverError>;

    /// Starts a transaction.
    ///
    /// # Errors
    ///
    /// `Down` or `Fail` as for [`Driver::execute`].
    fn begin(&mut self) -> Result<(), DriverError>;

    /// Commits the current transaction.
    ///
    /// # Errors
    ///
    /// `Down` or `Fail` as for [`Driver::execute`].
    fn commit(&mut self) -> Result<(), DriverError>;

    /// Rolls back the current transaction.
    ///
    /// # Errors
    ///
    /// `Down` or `Fail` as for [`Driver::execute`].
    fn rollback(&mut self) -> Result<(), DriverError>;
}

impl<D: Driver + ?Sized> Driver for Box<D> {
    fn dialect(&self) -> Dialect {
        (**self).dialect()
    }

    fn connect(&mut self, config: &DbConfig) -> Result<(), DriverError> {
        (**self).connect(config)
    }

    fn close(&mut self) {
        (**self).close();
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn execute(&mut self, sql: &str) -> Result<u64, DriverError> {
        (**self).execute(sql)
    }

    fn select(&mut self, sql: &str) -> Result<ResultSet, DriverError> {
        (**self).select(sql)
    }

    fn begin(&mut self) -> Result<(), DriverError> {
        (**self).begin()
    }

    fn commit(&mut self) -> Result<(), DriverError> {
        (**self).commit()
    }

    fn rollback(&mut self) -> Result<(), DriverError> {
        (**self).rollback()
    }
}
