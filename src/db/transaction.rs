//! Transaction controller.
//!
//! A connection is either idle (level 0) or inside one transaction
//! (level 1). Any failure inside the transaction marks it failed; further
//! statements are skipped and the eventual `commit` rolls back instead.

use super::connection::Connection;
use super::metrics::record_statement;
use super::{ConnectMode, DbStatus, ErrorCode};
use crate::{Error, Result};
use std::thread;
use std::time::Instant;

impl Connection {
    /// Starts a transaction, reconnecting while the database is down.
    ///
    /// # Errors
    ///
    /// [`Error::NestedTransaction`] if a transaction is already active;
    /// [`Error::Statement`] if the engine refuses to start one.
    pub fn begin(&mut self) -> Result<()> {
        if self.txn_level > 0 {
            tracing::error!(
                txn_level = self.txn_level,
                "nested transaction detected"
            );
            return Err(Error::NestedTransaction);
        }

        self.retry_while_down(Self::begin_once)
    }

    fn begin_once(&mut self) -> Result<()> {
        let start = Instant::now();
        let result = self.driver.begin();
        record_statement("begin", start, status_of(&result));

        match result {
            Ok(()) => {
                self.txn_level = 1;
                self.txn_error = DbStatus::Ok;
                Ok(())
            },
            Err(e) => Err(self.statement_failed("begin", "begin", e)),
        }
    }

    /// Commits the active transaction.
    ///
    /// A failed transaction, or a commit the engine rejects, is rolled back
    /// instead. Returns the transaction end status.
    ///
    /// # Errors
    ///
    /// [`Error::Statement`] if no transaction is active; errors from the
    /// reconnect after a failed rollback.
    pub fn commit(&mut self) -> Result<DbStatus> {
        if self.txn_level == 0 {
            tracing::error!("commit called without an active transaction");
            return Err(Error::Statement {
                operation: "commit".to_string(),
                code: ErrorCode::Transaction,
                cause: "no active transaction".to_string(),
            });
        }

        if self.txn_error == DbStatus::Ok {
            let start = Instant::now();
            let result = self.driver.commit();
            record_statement("commit", start, status_of(&result));

            match result {
                Ok(()) => {
                    self.txn_level = 0;
                    self.txn_end_status = DbStatus::Ok;
                    return Ok(DbStatus::Ok);
                },
                Err(e) => {
                    let err = self.statement_failed("commit", "commit", e);
                    tracing::debug!(error = %err, "commit rejected");
                },
            }
        }

        tracing::debug!("commit called on failed transaction, doing a rollback instead");
        self.rollback()?;
        Ok(self.txn_end_status)
    }

    /// Rolls back the active transaction.
    ///
    /// If the engine cannot roll back, the connection is reset. After a
    /// transaction failed on a read-only server, waits before returning so
    /// the caller does not spin against a replica.
    ///
    /// # Errors
    ///
    /// [`Error::ConnectFatal`] if the connection cannot be re-established.
    pub fn rollback(&mut self) -> Result<()> {
        if self.txn_level == 0 {
            tracing::warn!("rollback called without an active transaction");
            return Ok(());
        }

        let end_status = self.txn_error;
        let start = Instant::now();
        let result = self.driver.rollback();
        record_statement("rollback", start, status_of(&result));

        self.txn_level = 0;
        self.txn_error = DbStatus::Ok;
        self.txn_end_status = end_status;

        match result {
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "cannot perform transaction rollback, connection will be reset"
                );
                self.last_error = Some(e);
                self.close();
                self.txn_end_status = if end_status == DbStatus::Ok {
                    DbStatus::Fail
                } else {
                    end_status
                };
                self.connect(ConnectMode::Retry)
            },
            Ok(()) => {
                if end_status == DbStatus::Down && self.last_error_code() == ErrorCode::ReadOnly {
                    tracing::error!(
                        wait_secs = self.wait_down().as_secs(),
                        "database is read-only: waiting for {} seconds",
                        self.wait_down().as_secs()
                    );
                    thread::sleep(self.wait_down());
                }
                Ok(())
            },
        }
    }

    /// Commits when `success` is set, rolls back otherwise.
    ///
    /// Returns `true` only if the transaction was committed.
    ///
    /// # Errors
    ///
    /// As for [`Connection::commit`] and [`Connection::rollback`].
    pub fn end(&mut self, success: bool) -> Result<bool> {
        if success {
            return Ok(self.commit()? == DbStatus::Ok);
        }
        self.rollback()?;
        Ok(false)
    }

    /// Runs `body` inside a transaction, replaying it while the database
    /// goes down mid-transaction.
    ///
    /// `body` may run more than once and must not keep state across runs
    /// other than what it re-reads from the database.
    ///
    /// # Errors
    ///
    /// The error returned by `body`; [`Error::Statement`] if the commit
    /// failed permanently.
    pub fn transaction<T>(&mut self, mut body: impl FnMut(&mut Self) -> Result<T>) -> Result<T> {
        loop {
            self.begin()?;

            match body(self) {
                Ok(value) => match self.commit()? {
                    DbStatus::Ok => return Ok(value),
                    DbStatus::Down => {
                        tracing::warn!("transaction interrupted by database outage, replaying");
                    },
                    DbStatus::Fail => {
                        return Err(Error::Statement {
                            operation: "commit".to_string(),
                            code: self.last_error_code(),
                            cause: self
                                .last_error()
                                .map_or_else(|| "transaction failed".to_string(), |e| e.message.clone()),
                        });
                    },
                },
                Err(e) => {
                    if self.in_transaction() {
                        self.rollback()?;
                    }
                    if self.txn_end_status != DbStatus::Down {
                        return Err(e);
                    }
                    tracing::warn!(error = %e, "transaction interrupted by database outage, replaying");
                },
            }
        }
    }
}

fn status_of<T>(result: &std::result::Result<T, super::DriverError>) -> DbStatus {
    result.as_ref().map_or_else(|e| e.status, |_| DbStatus::Ok)
}
