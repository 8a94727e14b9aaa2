//! Statement buffers that flush once they grow past a size threshold.
//!
//! Callers append complete statements (or multi-row `insert` rows ending in
//! `,`) to a `String` and call [`execute_overflowed_sql`] after each append.
//! The buffer is executed and cleared as soon as it exceeds
//! [`Connection::max_overflow_sql_size`]; [`flush_overflowed_sql`] executes
//! whatever is left.

use super::add_condition;
use crate::Result;
use crate::db::Connection;

/// Maximum ids in one statement built by [`prepare_multiple_query`].
pub const MULTIPLE_QUERY_CHUNK: usize = 950;

/// Executes `sql` if it holds anything.
///
/// # Errors
///
/// Propagates the execute error.
pub fn flush_overflowed_sql(conn: &mut Connection, sql: &str) -> Result<()> {
    if sql.is_empty() {
        return Ok(());
    }
    conn.execute(sql).map(|_| ())
}

/// Executes and clears `sql` once it exceeds the overflow threshold.
///
/// On multi-row dialects a trailing row delimiter `,` is turned into a
/// statement terminator first. The buffer is cleared even when execution
/// fails.
///
/// # Errors
///
/// Propagates the execute error.
pub fn execute_overflowed_sql(conn: &mut Connection, sql: &mut String) -> Result<()> {
    if sql.len() <= conn.max_overflow_sql_size() {
        return Ok(());
    }
    if conn.dialect().supports_multirow_insert() && sql.ends_with(',') {
        sql.pop();
        sql.push_str(";\n");
    }
    let result = conn.execute(sql).map(|_| ());
    sql.clear();
    result
}

/// Appends `query` with an id condition for every chunk of `ids`.
///
/// Each chunk of at most [`MULTIPLE_QUERY_CHUNK`] ids becomes one statement.
/// The buffer is flushed through [`execute_overflowed_sql`] as it grows; the
/// remainder is left in `sql` for the caller.
///
/// # Errors
///
/// Stops at the first failed flush.
pub fn prepare_multiple_query(
    conn: &mut Connection,
    query: &str,
    field: &str,
    ids: &[u64],
    sql: &mut String,
) -> Result<()> {
    for chunk in ids.chunks(MULTIPLE_QUERY_CHUNK) {
        sql.push_str(query);
        add_condition(sql, field, chunk, conn.dialect());
        sql.push_str(";\n");
        execute_overflowed_sql(conn, sql)?;
    }
    Ok(())
}

/// Runs `query` restricted to `ids`, chunked as by [`prepare_multiple_query`].
///
/// ```rust,ignore
/// execute_multiple_query(&mut conn, "delete from items where", "itemid", &itemids)?;
/// ```
///
/// # Errors
///
/// Propagates the first execute error.
pub fn execute_multiple_query(conn: &mut Connection, query: &str, field: &str, ids: &[u64]) -> Result<()> {
    let mut sql = String::with_capacity(1024);
    prepare_multiple_query(conn, query, field, ids, &mut sql)?;
    flush_overflowed_sql(conn, &sql)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DbConfig;
    use crate::db::{Call, ConnectMode, FaultDriver, FaultHandle, Injected, SqliteDriver};

    fn connection(overflow: usize) -> (Connection, FaultHandle) {
        let driver = FaultDriver::new(SqliteDriver::new());
        let handle = driver.handle();
        let config = DbConfig::sqlite(":memory:").with_max_overflow_sql_size(overflow);
        let mut conn = Connection::new(Box::new(driver), config);
        conn.connect(ConnectMode::Once).unwrap();
        conn.execute("create table t (id integer primary key, v integer)").unwrap();
        handle.clear_calls();
        (conn, handle)
    }

    fn executed(handle: &FaultHandle) -> usize {
        handle
            .calls()
            .iter()
            .filter(|c| matches!(c, Call::Execute(_)))
            .count()
    }

    #[test]
    fn test_below_threshold_is_kept() {
        let (mut conn, handle) = connection(1024);
        let mut sql = "insert into t (id) values (1);\n".to_string();
        execute_overflowed_sql(&mut conn, &mut sql).unwrap();
        assert!(!sql.is_empty());
        assert_eq!(executed(&handle), 0);

        flush_overflowed_sql(&mut conn, &sql).unwrap();
        assert_eq!(executed(&handle), 1);
        flush_overflowed_sql(&mut conn, "").unwrap();
        assert_eq!(executed(&handle), 1);
    }

    #[test]
    fn test_over_threshold_executes_and_clears() {
        let (mut conn, handle) = connection(1024);
        let mut sql = String::new();
        for id in 1..=100 {
            sql.push_str(&format!("insert into t (id) values ({id});\n"));
            execute_overflowed_sql(&mut conn, &mut sql).unwrap();
        }
        flush_overflowed_sql(&mut conn, &sql).unwrap();
        assert!(executed(&handle) > 1);

        let mut rows = conn.select("select count(*) from t").unwrap();
        assert_eq!(rows.fetch().unwrap()[0].as_deref(), Some("100"));
    }

    #[test]
    fn test_failed_flush_clears_buffer() {
        let (mut conn, handle) = connection(1024);
        handle.push_statement(Injected::Fail);
        let mut sql = "x".repeat(2000);
        assert!(execute_overflowed_sql(&mut conn, &mut sql).is_err());
        assert!(sql.is_empty());
    }

    #[test]
    fn test_execute_multiple_query_chunks() {
        let (mut conn, handle) = connection(262_144);
        let mut sql = String::new();
        for id in 1..=2000 {
            sql.push_str(&format!("insert into t (id, v) values ({id}, 0);\n"));
        }
        conn.execute(&sql).unwrap();
        handle.clear_calls();

        let ids: Vec<u64> = (1..=2000).collect();
        execute_multiple_query(&mut conn, "update t set v=1 where", "id", &ids).unwrap();

        let calls = handle.calls();
        let Some(Call::Execute(statement)) = calls.first() else {
            panic!("expected one execute, got {calls:?}");
        };
        assert_eq!(statement.matches("update t set v=1 where").count(), 3);

        let mut rows = conn.select("select count(*) from t where v=1").unwrap();
        assert_eq!(rows.fetch().unwrap()[0].as_deref(), Some("2000"));
    }

    #[test]
    fn test_execute_multiple_query_empty() {
        let (mut conn, handle) = connection(1024);
        execute_multiple_query(&mut conn, "delete from t where", "id", &[]).unwrap();
        assert_eq!(executed(&handle), 0);
    }
}
