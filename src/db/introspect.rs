//! Catalog introspection and row locking helpers.
//!
//! All helpers go through the retrying [`Connection::select`], so they
//! survive outages outside a transaction like any other query.

use super::connection::Connection;
use super::dialect::LIKE_ESCAPE_CHAR;
use crate::schema::SchemaRegistry;
use crate::schema::catalog::{
    FLAG_DISCOVERY_PROTOTYPE, HOST_STATUS_MONITORED, HOST_STATUS_NOT_MONITORED,
    HOST_STATUS_TEMPLATE,
};
use crate::sql::condition::add_condition;
use crate::{Error, Result};

fn exists(conn: &mut Connection, sql: &str) -> Result<bool> {
    Ok(!conn.select(sql)?.is_empty())
}

/// Returns `true` if `table` exists.
pub fn table_exists(conn: &mut Connection, table: &str) -> Result<bool> {
    let sql = conn
        .dialect()
        .table_exists_sql(table, conn.config().schema_or_default());
    exists(conn, &sql)
}

/// Returns `true` if `table` has a column named `field`.
pub fn field_exists(conn: &mut Connection, table: &str, field: &str) -> Result<bool> {
    let sql = conn
        .dialect()
        .field_exists_sql(table, field, conn.config().schema_or_default());
    exists(conn, &sql)
}

/// Returns `true` if `table` has an index named `index`.
pub fn index_exists(conn: &mut Connection, table: &str, index: &str) -> Result<bool> {
    let sql = conn
        .dialect()
        .index_exists_sql(table, index, conn.config().schema_or_default());
    exists(conn, &sql)
}

/// Returns `true` if `table` has a primary key.
pub fn pk_exists(conn: &mut Connection, table: &str) -> Result<bool> {
    let sql = conn
        .dialect()
        .pk_exists_sql(table, conn.config().schema_or_default());
    exists(conn, &sql)
}

/// Returns `true` if `table` has a trigger named `trigger`.
pub fn trigger_exists(conn: &mut Connection, table: &str, trigger: &str) -> Result<bool> {
    let sql = conn
        .dialect()
        .trigger_exists_sql(table, trigger, conn.config().schema_or_default());
    exists(conn, &sql)
}

/// Runs `sql` and returns the first column of every row as a sorted id list.
///
/// Null values are skipped.
///
/// # Errors
///
/// [`Error::InvalidInput`] if a value is not an unsigned integer.
pub fn select_ids(conn: &mut Connection, sql: &str) -> Result<Vec<u64>> {
    let mut ids = Vec::new();
    for row in conn.select(sql)? {
        let Some(value) = row.into_iter().next().flatten() else {
            continue;
        };
        let id = value
            .parse::<u64>()
            .map_err(|_| Error::InvalidInput(format!("not an id: \"{value}\"")))?;
        ids.push(id);
    }
    ids.sort_unstable();
    Ok(ids)
}

fn warn_outside_transaction(conn: &Connection, operation: &str) {
    if !conn.in_transaction() {
        tracing::debug!(operation, "row lock requested outside of transaction");
    }
}

/// Locks one row by record id, optionally also matching `add` as
/// `(field, value)`.
///
/// Returns `false` if no such row exists.
///
/// # Errors
///
/// [`Error::Schema`] for an unknown table or a table without a record id.
pub fn lock_record(
    conn: &mut Connection,
    registry: &SchemaRegistry,
    table: &str,
    id: u64,
    add: Option<(&str, u64)>,
) -> Result<bool> {
    warn_outside_transaction(conn, "lock_record");
    let recid = registry.require_table(table)?.require_recid()?;

    let mut sql = format!("select null from {table} where {recid}={id}");
    if let Some((field, value)) = add {
        sql.push_str(&format!(" and {field}={value}"));
    }
    sql.push_str(conn.dialect().for_update());

    exists(conn, &sql)
}

/// Locks every listed row by record id.
///
/// Returns `true` if at least one row was locked.
///
/// # Errors
///
/// [`Error::Schema`] for an unknown table or a table without a record id.
pub fn lock_records(
    conn: &mut Connection,
    registry: &SchemaRegistry,
    table: &str,
    ids: &[u64],
) -> Result<bool> {
    warn_outside_transaction(conn, "lock_records");
    let recid = registry.require_table(table)?.require_recid()?;
    if ids.is_empty() {
        return Ok(false);
    }

    let mut sql = format!("select null from {table} where");
    add_condition(&mut sql, recid, ids, conn.dialect());
    sql.push_str(conn.dialect().for_update());

    exists(conn, &sql)
}

/// Locks rows matching `field` and narrows `ids` to the ones that exist.
///
/// `ids` must be sorted. Returns `true` if any row was locked.
pub fn lock_ids(conn: &mut Connection, table: &str, field: &str, ids: &mut Vec<u64>) -> Result<bool> {
    if ids.is_empty() {
        return Ok(false);
    }
    warn_outside_transaction(conn, "lock_ids");

    let mut sql = format!("select {field} from {table} where");
    add_condition(&mut sql, field, ids, conn.dialect());
    sql.push_str(" order by ");
    sql.push_str(field);
    sql.push_str(conn.dialect().for_update());

    let locked = select_ids(conn, &sql)?;
    ids.retain(|id| locked.binary_search(id).is_ok());
    Ok(!ids.is_empty())
}

/// Returns `sample` if no host uses it as `field`, otherwise the first free
/// `sample_N` with `N >= 2`.
///
/// Host prototypes are ignored.
///
/// # Errors
///
/// [`Error::InvalidInput`] for an empty sample; [`Error::Schema`] if `field`
/// is not a `hosts` column.
pub fn unique_name_by_sample(
    conn: &mut Connection,
    registry: &SchemaRegistry,
    sample: &str,
    field: &str,
) -> Result<String> {
    if sample.is_empty() {
        return Err(Error::InvalidInput("host name sample is empty".to_string()));
    }
    registry.require_field("hosts", field)?;

    let dialect = conn.dialect();
    let sql = format!(
        "select {field} from hosts where {field} like '{}%' escape '{LIKE_ESCAPE_CHAR}' and flags<>{FLAG_DISCOVERY_PROTOTYPE} and status in ({HOST_STATUS_MONITORED},{HOST_STATUS_NOT_MONITORED},{HOST_STATUS_TEMPLATE})",
        dialect.escape_like_pattern(sample)
    );

    let mut full_match = false;
    let mut taken = Vec::new();
    for row in conn.select(&sql)? {
        let Some(name) = row.into_iter().next().flatten() else {
            continue;
        };
        let Some(rest) = name.strip_prefix(sample) else {
            continue;
        };
        if rest.is_empty() {
            full_match = true;
            continue;
        }
        if let Some(n) = rest.strip_prefix('_').and_then(parse_uint) {
            taken.push(n);
        }
    }

    if !full_match {
        return Ok(sample.to_string());
    }

    taken.sort_unstable();
    let mut num: u64 = 2;
    for n in taken {
        if num < n {
            break;
        }
        if num == n {
            num += 1;
        }
    }

    tracing::debug!(sample, num, "generated unique host name");
    Ok(format!("{sample}_{num}"))
}

fn parse_uint(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}
