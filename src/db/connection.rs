//! Connection controller.
//!
//! A [`Connection`] owns the single physical connection of a worker. Every
//! retrying primitive (`execute`, `select`, `begin`, ...) follows the same
//! policy when the driver reports the database as down:
//!
//! ```text
//! primitive -> Down -> close -> connect(Retry) -> primitive
//!                                                   |
//!                                  Down: log, sleep wait_down, loop
//! ```
//!
//! Inside an active transaction a `Down` is not retried: the transaction is
//! marked failed and the caller retries the whole transaction (see
//! [`Connection::transaction`]).

use super::metrics::{record_reconnect, record_statement};
use super::{DbStatus, Dialect, Driver, DriverError, ErrorCode, ResultSet};
use crate::config::DbConfig;
use crate::{Error, Result};
use std::thread;
use std::time::{Duration, Instant};

/// Longest statement prefix included in log events.
const LOG_SQL_PREFIX: usize = 512;

/// Connect policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectMode {
    /// Try once and return the outcome.
    Once,
    /// Retry while the database is down; a permanent failure is fatal.
    ///
    /// Used at startup, where a bad configuration must stop the process.
    RetryOrExit,
    /// Retry while the database is down; a permanent failure is fatal.
    ///
    /// Used to re-establish a connection that worked before.
    Retry,
}

/// The single database connection of a worker.
pub struct Connection {
    pub(super) driver: Box<dyn Driver>,
    pub(super) config: DbConfig,
    pub(super) dialect: Dialect,
    pub(super) txn_level: u8,
    pub(super) txn_error: DbStatus,
    pub(super) txn_end_status: DbStatus,
    pub(super) last_error: Option<DriverError>,
    pub(super) connection_failure: bool,
    managed: bool,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("dialect", &self.dialect)
            .field("connected", &self.driver.is_connected())
            .field("txn_level", &self.txn_level)
            .field("txn_error", &self.txn_error)
            .field("txn_end_status", &self.txn_end_status)
            .field("last_error", &self.last_error)
            .field("connection_failure", &self.connection_failure)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Creates an unconnected connection.
    #[must_use]
    pub fn new(driver: Box<dyn Driver>, config: DbConfig) -> Self {
        let dialect = driver.dialect();
        Self {
            driver,
            config,
            dialect,
            txn_level: 0,
            txn_error: DbStatus::Ok,
            txn_end_status: DbStatus::Ok,
            last_error: None,
            connection_failure: false,
            managed: false,
        }
    }

    /// Returns the SQL dialect of the driver.
    #[must_use]
    pub const fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &DbConfig {
        &self.config
    }

    /// Returns the reconnect pause.
    #[must_use]
    pub const fn wait_down(&self) -> Duration {
        self.config.wait_down
    }

    /// Returns the overflow flush threshold in bytes.
    #[must_use]
    pub const fn max_overflow_sql_size(&self) -> usize {
        self.config.max_overflow_sql_size
    }

    /// Returns `true` while the driver holds an open connection.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.driver.is_connected()
    }

    /// Returns the transaction nesting level (0 or 1).
    #[must_use]
    pub const fn txn_level(&self) -> u8 {
        self.txn_level
    }

    /// Returns `true` while a transaction is active.
    #[must_use]
    pub const fn in_transaction(&self) -> bool {
        self.txn_level > 0
    }

    /// Returns the error status of the active transaction.
    #[must_use]
    pub const fn txn_error(&self) -> DbStatus {
        self.txn_error
    }

    /// Returns `true` if the active transaction has been marked failed.
    #[must_use]
    pub fn txn_failed(&self) -> bool {
        self.txn_level > 0 && self.txn_error != DbStatus::Ok
    }

    /// Returns how the last transaction ended.
    #[must_use]
    pub const fn txn_end_status(&self) -> DbStatus {
        self.txn_end_status
    }

    /// Returns the last driver error.
    #[must_use]
    pub const fn last_error(&self) -> Option<&DriverError> {
        self.last_error.as_ref()
    }

    /// Returns the code of the last driver error.
    #[must_use]
    pub fn last_error_code(&self) -> ErrorCode {
        self.last_error.as_ref().map_or(ErrorCode::None, |e| e.code)
    }

    /// Returns `true` after a failed connect until a connect succeeds.
    #[must_use]
    pub const fn connection_failure(&self) -> bool {
        self.connection_failure
    }

    /// Returns `true` if the connection is owned by a pool.
    #[must_use]
    pub const fn is_managed(&self) -> bool {
        self.managed
    }

    /// Connects according to `mode`.
    ///
    /// # Errors
    ///
    /// - `Once`: [`Error::Down`] or [`Error::Statement`] on failure.
    /// - `Retry`, `RetryOrExit`: [`Error::ConnectFatal`] on a permanent
    ///   failure; transient failures are retried every `wait_down`.
    pub fn connect(&mut self, mode: ConnectMode) -> Result<()> {
        tracing::debug!(?mode, engine = %self.dialect, "connecting to the database");

        loop {
            let start = Instant::now();
            match self.driver.connect(&self.config) {
                Ok(()) => {
                    record_statement("connect", start, DbStatus::Ok);
                    break;
                },
                Err(e) => {
                    record_statement("connect", start, e.status);
                    self.last_error = Some(e.clone());

                    if mode == ConnectMode::Once {
                        return Err(driver_error("connect", e));
                    }
                    if e.status == DbStatus::Fail {
                        tracing::error!(error = %e, "Cannot connect to the database. Exiting...");
                        return Err(Error::ConnectFatal(e.message));
                    }

                    tracing::warn!(
                        wait_secs = self.wait_down().as_secs(),
                        error = %e,
                        "database is down: reconnecting in {} seconds",
                        self.wait_down().as_secs()
                    );
                    self.connection_failure = true;
                    record_reconnect(DbStatus::Down);
                    thread::sleep(self.wait_down());
                },
            }
        }

        if self.connection_failure {
            tracing::warn!("database connection re-established");
            record_reconnect(DbStatus::Ok);
            self.connection_failure = false;
        }
        Ok(())
    }

    /// Closes the connection. Safe to call when not connected.
    ///
    /// An open transaction is discarded.
    pub fn close(&mut self) {
        if self.txn_level > 0 {
            tracing::warn!("closing connection with an open transaction");
            self.txn_level = 0;
            self.txn_end_status = DbStatus::Fail;
            self.txn_error = DbStatus::Ok;
        }
        self.driver.close();
    }

    /// Runs `op`, reconnecting and retrying while the database is down.
    ///
    /// Inside a transaction the first `Down` is returned to the caller.
    pub(super) fn retry_while_down<T>(
        &mut self,
        mut op: impl FnMut(&mut Self) -> Result<T>,
    ) -> Result<T> {
        let mut result = op(self);

        while matches!(result, Err(Error::Down(_))) && self.txn_level == 0 {
            self.close();
            self.connect(ConnectMode::Retry)?;

            result = op(self);
            if matches!(result, Err(Error::Down(_))) {
                tracing::warn!(
                    wait_secs = self.wait_down().as_secs(),
                    "database is down: retrying in {} seconds",
                    self.wait_down().as_secs()
                );
                self.connection_failure = true;
                thread::sleep(self.wait_down());
            }
        }

        result
    }

    /// Executes a statement, retrying while the database is down.
    ///
    /// Returns the number of affected rows.
    ///
    /// # Errors
    ///
    /// [`Error::Statement`] on statement failure or inside a failed
    /// transaction; [`Error::Down`] inside a transaction.
    pub fn execute(&mut self, sql: &str) -> Result<u64> {
        self.retry_while_down(|conn| conn.execute_once(sql))
    }

    /// Executes a statement once.
    ///
    /// # Errors
    ///
    /// [`Error::Down`] when the database is down, [`Error::Statement`]
    /// otherwise.
    pub fn execute_once(&mut self, sql: &str) -> Result<u64> {
        self.check_txn_usable("execute", sql)?;

        let start = Instant::now();
        let result = self.driver.execute(sql);
        self.observe("execute", sql, start, result.as_ref().err());
        result.map_err(|e| self.statement_failed("execute", sql, e))
    }

    /// Runs a query, retrying while the database is down.
    ///
    /// # Errors
    ///
    /// As for [`Connection::execute`].
    pub fn select(&mut self, sql: &str) -> Result<ResultSet> {
        self.retry_while_down(|conn| conn.select_once(sql))
    }

    /// Runs a query once.
    ///
    /// # Errors
    ///
    /// As for [`Connection::execute_once`].
    pub fn select_once(&mut self, sql: &str) -> Result<ResultSet> {
        self.check_txn_usable("select", sql)?;

        let start = Instant::now();
        let result = self.driver.select(sql);
        self.observe("select", sql, start, result.as_ref().err());
        result.map_err(|e| self.statement_failed("select", sql, e))
    }

    /// Runs a query returning at most `n` rows, retrying while down.
    ///
    /// # Errors
    ///
    /// As for [`Connection::execute`].
    pub fn select_n(&mut self, sql: &str, n: usize) -> Result<ResultSet> {
        let limited = self.dialect.limit(sql, n);
        let mut rows = self.select(&limited)?;
        rows.truncate(n);
        Ok(rows)
    }

    fn check_txn_usable(&self, kind: &str, sql: &str) -> Result<()> {
        if self.txn_failed() {
            tracing::debug!(
                kind,
                sql = truncate_sql(sql),
                "ignoring query within failed transaction"
            );
            return Err(Error::Statement {
                operation: kind.to_string(),
                code: ErrorCode::Transaction,
                cause: "transaction already failed".to_string(),
            });
        }
        Ok(())
    }

    fn observe(&self, kind: &'static str, sql: &str, start: Instant, error: Option<&DriverError>) {
        let status = error.map_or(DbStatus::Ok, |e| e.status);
        record_statement(kind, start, status);

        if let Some(threshold) = self.config.log_slow_queries {
            let elapsed = start.elapsed();
            if elapsed > threshold {
                tracing::warn!(
                    elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                    sql = truncate_sql(sql),
                    "slow query"
                );
            }
        }
    }

    /// Records a driver failure and converts it.
    ///
    /// Inside a transaction any failure marks the transaction failed.
    pub(super) fn statement_failed(&mut self, kind: &str, sql: &str, e: DriverError) -> Error {
        if self.txn_level > 0 && self.txn_error == DbStatus::Ok {
            tracing::debug!(kind, "setting transaction as failed");
            self.txn_error = e.status;
        }

        match e.status {
            DbStatus::Down => {
                tracing::warn!(kind, error = %e, sql = truncate_sql(sql), "database is down");
            },
            _ => tracing::error!(kind, error = %e, sql = truncate_sql(sql), "query failed"),
        }

        self.last_error = Some(e.clone());
        driver_error(kind, e)
    }
}

/// Converts a driver failure to a crate error.
pub(super) fn driver_error(kind: &str, e: DriverError) -> Error {
    match e.status {
        DbStatus::Down => Error::Down(e.message),
        _ => Error::Statement {
            operation: kind.to_string(),
            code: e.code,
            cause: e.message,
        },
    }
}

fn truncate_sql(sql: &str) -> &str {
    super::dialect::truncate_utf8(sql, Some(LOG_SQL_PREFIX), None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::fault::{FaultDriver, Injected};
    use crate::db::sqlite::SqliteDriver;

    fn memory_config() -> DbConfig {
        DbConfig::sqlite(":memory:").with_wait_down(Duration::from_millis(1))
    }

    fn faulty() -> (Connection, crate::db::fault::FaultHandle) {
        let driver = FaultDriver::new(SqliteDriver::new());
        let handle = driver.handle();
        (Connection::new(Box::new(driver), memory_config()), handle)
    }

    #[test]
    fn test_connect_once_and_close_idempotent() {
        let mut conn = Connection::new(Box::new(SqliteDriver::new()), memory_config());
        assert!(!conn.is_connected());
        conn.connect(ConnectMode::Once).unwrap();
        assert!(conn.is_connected());
        conn.close();
        conn.close();
        assert!(!conn.is_connected());
    }

    #[test]
    fn test_connect_retries_while_down() {
        let (mut conn, faults) = faulty();
        faults.push_connect(Injected::Down);
        faults.push_connect(Injected::Down);
        conn.connect(ConnectMode::Retry).unwrap();
        assert!(conn.is_connected());
        assert!(!conn.connection_failure());
        assert_eq!(faults.connect_attempts(), 3);
    }

    #[test]
    fn test_connect_once_reports_down() {
        let (mut conn, faults) = faulty();
        faults.push_connect(Injected::Down);
        assert!(matches!(conn.connect(ConnectMode::Once), Err(Error::Down(_))));
        assert_eq!(conn.last_error_code(), ErrorCode::Connect);
    }

    #[test]
    fn test_connect_fatal_modes() {
        let (mut conn, faults) = faulty();
        faults.push_connect(Injected::Fail);
        assert!(matches!(
            conn.connect(ConnectMode::Retry),
            Err(Error::ConnectFatal(_))
        ));

        faults.push_connect(Injected::Fail);
        let err = conn.connect(ConnectMode::RetryOrExit).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(faults.connect_attempts(), 2);
    }

    #[test]
    fn test_retry_or_exit_waits_out_outages() {
        let (mut conn, faults) = faulty();
        faults.push_connect(Injected::Down);
        faults.push_connect(Injected::Down);
        conn.connect(ConnectMode::RetryOrExit).unwrap();
        assert!(conn.is_connected());
        assert!(!conn.connection_failure());
        assert_eq!(faults.connect_attempts(), 3);
    }

    #[test]
    fn test_execute_reconnects_when_down() {
        let (mut conn, faults) = faulty();
        conn.connect(ConnectMode::Once).unwrap();
        conn.execute("create table t (v integer)").unwrap();
        faults.push_statement(Injected::Down);
        faults.push_statement(Injected::Down);

        // :memory: databases do not survive a reconnect, so probe with a
        // statement that needs no schema.
        let rows = conn.select("select 42").unwrap();
        assert_eq!(rows.len(), 1);
        assert!(faults.connect_attempts() >= 3);
        assert!(!conn.connection_failure());
    }

    #[test]
    fn test_outage_on_file_database_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let driver = FaultDriver::new(SqliteDriver::new());
        let faults = driver.handle();
        let config = DbConfig::sqlite(dir.path().join("outage.db")).with_wait_down(Duration::ZERO);
        let mut conn = Connection::new(Box::new(driver), config);
        conn.connect(ConnectMode::Once).unwrap();
        conn.execute("create table t (v integer)").unwrap();

        faults.push_statement(Injected::Down);
        assert_eq!(conn.execute("insert into t values (1)").unwrap(), 1);
        assert_eq!(faults.connect_attempts(), 2);
        assert!(faults.saw(&crate::db::fault::Call::Close));
        assert!(!conn.connection_failure());
        assert_eq!(conn.select("select v from t").unwrap().len(), 1);
    }

    #[test]
    fn test_execute_once_does_not_retry() {
        let (mut conn, faults) = faulty();
        conn.connect(ConnectMode::Once).unwrap();
        faults.push_statement(Injected::Down);
        assert!(matches!(conn.execute_once("select 1"), Err(Error::Down(_))));
        assert_eq!(faults.connect_attempts(), 1);
    }

    #[test]
    fn test_statement_failure_is_not_retried() {
        let mut conn = Connection::new(Box::new(SqliteDriver::new()), memory_config());
        conn.connect(ConnectMode::Once).unwrap();
        let err = conn.execute("insert into missing values (1)").unwrap_err();
        assert!(matches!(
            err,
            Error::Statement {
                code: ErrorCode::Execute,
                ..
            }
        ));
        assert!(conn.last_error().is_some());
    }

    #[test]
    fn test_select_n_limits_rows() {
        let mut conn = Connection::new(Box::new(SqliteDriver::new()), memory_config());
        conn.connect(ConnectMode::Once).unwrap();
        conn.execute("create table t (v integer)").unwrap();
        conn.execute("insert into t values (1);\ninsert into t values (2);\ninsert into t values (3);\n")
            .unwrap();
        let rows: Vec<_> = conn.select_n("select v from t order by v", 2).unwrap().collect();
        assert_eq!(
            rows,
            vec![vec![Some("1".to_string())], vec![Some("2".to_string())]]
        );
    }

    #[test]
    fn test_truncate_sql_for_logs() {
        let long = "x".repeat(LOG_SQL_PREFIX * 2);
        assert_eq!(truncate_sql(&long).len(), LOG_SQL_PREFIX);
        assert_eq!(truncate_sql("select 1"), "select 1");
    }
}
