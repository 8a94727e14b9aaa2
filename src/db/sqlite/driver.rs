use super::connection::{DEFAULT_BUSY_TIMEOUT, classify, configure_connection};
use crate::config::DbConfig;
use crate::db::{Dialect, Driver, DriverError, ErrorCode, ResultSet, Row};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rusqlite::Connection;
use rusqlite::types::ValueRef;
use std::time::Duration;

const MEMORY_PATH: &str = ":memory:";

/// Driver for an embedded database file.
#[derive(Debug)]
pub struct SqliteDriver {
    conn: Option<Connection>,
    busy_timeout: Duration,
}

impl Default for SqliteDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl SqliteDriver {
    /// Creates an unconnected driver.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            conn: None,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }

    /// Sets how long a statement waits on a locked database.
    #[must_use]
    pub const fn with_busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.busy_timeout = busy_timeout;
        self
    }

    fn open(&self, code: ErrorCode) -> Result<&Connection, DriverError> {
        self.conn
            .as_ref()
            .ok_or_else(|| DriverError::down(code, "connection is closed"))
    }

    fn total_changes(conn: &Connection) -> Result<u64, DriverError> {
        conn.query_row("select total_changes()", [], |row| row.get::<_, i64>(0))
            .map(|n| u64::try_from(n).unwrap_or(0))
            .map_err(|e| classify(&e, ErrorCode::Execute))
    }

    fn batch(&self, sql: &str, code: ErrorCode) -> Result<(), DriverError> {
        self.open(code)?
            .execute_batch(sql)
            .map_err(|e| classify(&e, code))
    }
}

impl Driver for SqliteDriver {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn connect(&mut self, config: &DbConfig) -> Result<(), DriverError> {
        let conn = if config.name == MEMORY_PATH {
            Connection::open_in_memory()
        } else {
            Connection::open(&config.name)
        }
        .map_err(|e| classify(&e, ErrorCode::Connect))?;

        configure_connection(&conn, self.busy_timeout);
        tracing::debug!(path = %config.name, "opened database file");
        self.conn = Some(conn);
        Ok(())
    }

    fn close(&mut self) {
        if let Some(conn) = self.conn.take()
            && let Err((_, e)) = conn.close()
        {
            tracing::warn!(error = %e, "error closing database file");
        }
    }

    fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    fn execute(&mut self, sql: &str) -> Result<u64, DriverError> {
        let conn = self.open(ErrorCode::Execute)?;
        let before = Self::total_changes(conn)?;
        conn.execute_batch(sql)
            .map_err(|e| classify(&e, ErrorCode::Execute))?;
        Ok(Self::total_changes(conn)?.saturating_sub(before))
    }

    fn select(&mut self, sql: &str) -> Result<ResultSet, DriverError> {
        let conn = self.open(ErrorCode::Select)?;
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| classify(&e, ErrorCode::Select))?;
        let columns: Vec<String> = stmt.column_names().iter().map(ToString::to_string).collect();
        let width = columns.len();

        let mut rows = stmt
            .query([])
            .map_err(|e| classify(&e, ErrorCode::Select))?;
        let mut buffered = Vec::new();
        while let Some(row) = rows.next().map_err(|e| classify(&e, ErrorCode::Select))? {
            let mut values: Row = Vec::with_capacity(width);
            for index in 0..width {
                let value = row
                    .get_ref(index)
                    .map_err(|e| classify(&e, ErrorCode::Select))?;
                values.push(value_to_text(value));
            }
            buffered.push(values);
        }

        Ok(ResultSet::new(columns, buffered))
    }

    fn begin(&mut self) -> Result<(), DriverError> {
        self.batch("begin immediate", ErrorCode::Transaction)
    }

    fn commit(&mut self) -> Result<(), DriverError> {
        self.batch("commit", ErrorCode::Transaction)
    }

    fn rollback(&mut self) -> Result<(), DriverError> {
        self.batch("rollback", ErrorCode::Transaction)
    }
}

/// Renders a column value as text; blobs come back base64 encoded.
fn value_to_text(value: ValueRef<'_>) -> Option<String> {
    match value {
        ValueRef::Null => None,
        ValueRef::Integer(i) => Some(i.to_string()),
        ValueRef::Real(f) => Some(f.to_string()),
        ValueRef::Text(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Some(STANDARD.encode(bytes)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DbStatus;

    fn connected() -> SqliteDriver {
        let mut driver = SqliteDriver::new();
        driver.connect(&DbConfig::sqlite(MEMORY_PATH)).unwrap();
        driver
    }

    #[test]
    fn test_execute_counts_changes() {
        let mut driver = connected();
        assert_eq!(driver.execute("create table t (v integer)").unwrap(), 0);
        assert_eq!(
            driver
                .execute("insert into t values (1),(2);\ninsert into t values (3);\n")
                .unwrap(),
            3
        );
        assert_eq!(driver.execute("update t set v=v+1 where v>1").unwrap(), 2);
    }

    #[test]
    fn test_select_renders_text() {
        let mut driver = connected();
        driver
            .execute("create table t (i integer, r real, s text, b blob, n text)")
            .unwrap();
        driver
            .execute("insert into t values (-7, 1.5, 'x', x'0102', null)")
            .unwrap();
        let mut rows = driver.select("select i, r, s, b, n from t").unwrap();
        assert_eq!(rows.columns(), ["i", "r", "s", "b", "n"]);
        assert_eq!(
            rows.fetch().unwrap(),
            vec![
                Some("-7".to_string()),
                Some("1.5".to_string()),
                Some("x".to_string()),
                Some("AQI=".to_string()),
                None,
            ]
        );
    }

    #[test]
    fn test_closed_connection_is_down() {
        let mut driver = connected();
        driver.close();
        driver.close();
        assert!(!driver.is_connected());
        let err = driver.execute("select 1").unwrap_err();
        assert_eq!(err.status, DbStatus::Down);
    }

    #[test]
    fn test_transaction_rollback() {
        let mut driver = connected();
        driver.execute("create table t (v integer)").unwrap();
        driver.begin().unwrap();
        driver.execute("insert into t values (1)").unwrap();
        driver.rollback().unwrap();
        assert!(driver.select("select v from t").unwrap().is_empty());
    }

    #[test]
    fn test_commit_without_begin_fails() {
        let mut driver = connected();
        let err = driver.commit().unwrap_err();
        assert_eq!(err.status, DbStatus::Fail);
        assert_eq!(err.code, ErrorCode::Transaction);
    }

    #[test]
    fn test_connect_to_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut driver = SqliteDriver::new();
        let config = DbConfig::sqlite(dir.path());
        let err = driver.connect(&config).and_then(|()| driver.execute("create table t (v integer)"));
        assert!(err.is_err());
    }
}
