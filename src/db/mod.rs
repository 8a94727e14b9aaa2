//! Database access layer.
//!
//! A [`Connection`] drives one engine [`Driver`] and adds the resilience
//! policy on top of it: reconnecting while the database is down, marking
//! transactions failed, and replaying work after an outage.
//!
//! # Engines
//!
//! | Engine | Driver | Feature |
//! |--------|--------|---------|
//! | SQLite | [`SqliteDriver`] | always |
//! | PostgreSQL | `PostgresDriver` | `postgres` |
//! | MySQL, Oracle | supplied by the application | - |
//!
//! Every engine has a [`Dialect`] for escaping and SQL generation, so SQL
//! can be rendered for engines without a bundled driver.

mod connection;
mod dialect;
mod driver;
#[cfg(any(test, feature = "testing"))]
mod fault;
pub mod introspect;
mod metrics;
#[cfg(feature = "postgres")]
mod postgresql;
pub mod sqlite;
mod transaction;

pub use connection::{ConnectMode, Connection};
pub use dialect::{Dialect, LIKE_ESCAPE_CHAR, truncate_utf8};
pub(crate) use dialect::push_u64;
pub use driver::{DbStatus, Driver, DriverError, ErrorCode, ResultSet, Row};
#[cfg(any(test, feature = "testing"))]
pub use fault::{Call, FaultDriver, FaultHandle, Injected};
pub(crate) use metrics::{record_ids_reserved, record_rows_inserted};
#[cfg(feature = "postgres")]
pub use postgresql::{PostgresDriver, classify as classify_postgres, pg_config};
pub use sqlite::SqliteDriver;

/// Creates the bundled driver for `dialect`.
///
/// # Errors
///
/// [`crate::Error::Config`] if no driver for the engine is built in.
pub fn driver_for(dialect: Dialect) -> crate::Result<Box<dyn Driver>> {
    match dialect {
        Dialect::Sqlite => Ok(Box::new(SqliteDriver::new())),
        #[cfg(feature = "postgres")]
        Dialect::PostgreSql => Ok(Box::new(PostgresDriver::new())),
        other => Err(crate::Error::Config(format!(
            "no built-in driver for database engine \"{other}\""
        ))),
    }
}

/// Opens a connection for `config` with the bundled driver.
///
/// # Errors
///
/// As for [`driver_for`] and [`Connection::connect`].
pub fn open(config: crate::config::DbConfig, mode: ConnectMode) -> crate::Result<Connection> {
    config.validate()?;
    let mut conn = Connection::new(driver_for(config.engine)?, config);
    conn.connect(mode)?;
    Ok(conn)
}
