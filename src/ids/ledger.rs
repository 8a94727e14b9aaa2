use crate::db::{Connection, ResultSet};
use crate::{Error, Result};

/// Storage operations behind the id allocator.
///
/// `table` and `field` are registry names, never user input.
pub trait LedgerStore {
    /// Returns `true` while the ambient transaction is active and failed.
    fn txn_failed(&self) -> bool;

    /// Reads `nextid` of the ledger row, `None` if the row is absent.
    fn read_next_id(&mut self, table: &str, field: &str) -> Result<Option<u64>>;

    /// Returns the largest `field` value in `table` within `[min, max]`.
    fn max_record_id(&mut self, table: &str, field: &str, min: u64, max: u64) -> Result<Option<u64>>;

    /// Inserts the ledger row; `false` if the engine rejected it.
    fn insert_ledger(&mut self, table: &str, field: &str, next_id: u64) -> Result<bool>;

    /// Increments `nextid` by one.
    fn bump_ledger(&mut self, table: &str, field: &str) -> Result<()>;

    /// Increments `nextid` by `count`.
    fn advance_ledger(&mut self, table: &str, field: &str, count: u64) -> Result<()>;

    /// Deletes the ledger row.
    fn delete_ledger(&mut self, table: &str, field: &str) -> Result<()>;
}

fn first_u64(mut rows: ResultSet) -> Result<Option<u64>> {
    let Some(value) = rows.fetch().and_then(|row| row.into_iter().next().flatten()) else {
        return Ok(None);
    };
    value
        .parse::<u64>()
        .map(Some)
        .map_err(|_| Error::InvalidInput(format!("not an id: \"{value}\"")))
}

/// Reads a ledger value.
///
/// Anything that is not an unsigned 64-bit number (negative, fractional or
/// garbage) maps to `u64::MAX`, so the allocator treats the row as out of
/// range and reseeds it.
fn ledger_value(rows: ResultSet) -> Option<u64> {
    let value = rows.into_iter().next()?.into_iter().next()??;
    Some(value.trim().parse::<u64>().unwrap_or_else(|_| {
        tracing::warn!(value = %value, "id ledger holds an invalid value");
        u64::MAX
    }))
}

fn row_filter(table: &str, field: &str) -> String {
    format!("table_name='{table}' and field_name='{field}'")
}

impl LedgerStore for Connection {
    fn txn_failed(&self) -> bool {
        Self::txn_failed(self)
    }

    fn read_next_id(&mut self, table: &str, field: &str) -> Result<Option<u64>> {
        let rows = self.select(&format!(
            "select nextid from ids where {}",
            row_filter(table, field)
        ))?;
        Ok(ledger_value(rows))
    }

    fn max_record_id(&mut self, table: &str, field: &str, min: u64, max: u64) -> Result<Option<u64>> {
        let rows = self.select(&format!(
            "select max({field}) from {table} where {field} between {min} and {max}"
        ))?;
        first_u64(rows)
    }

    fn insert_ledger(&mut self, table: &str, field: &str, next_id: u64) -> Result<bool> {
        match self.execute(&format!(
            "insert into ids (table_name,field_name,nextid) values ('{table}','{field}',{next_id})"
        )) {
            Ok(_) => Ok(true),
            Err(Error::Statement { cause, .. }) => {
                tracing::debug!(table, field, cause, "id ledger row insert rejected");
                Ok(false)
            },
            Err(e) => Err(e),
        }
    }

    fn bump_ledger(&mut self, table: &str, field: &str) -> Result<()> {
        self.execute(&format!(
            "update ids set nextid=nextid+1 where {}",
            row_filter(table, field)
        ))
        .map(|_| ())
    }

    fn advance_ledger(&mut self, table: &str, field: &str, count: u64) -> Result<()> {
        self.execute(&format!(
            "update ids set nextid=nextid+{count} where {}",
            row_filter(table, field)
        ))
        .map(|_| ())
    }

    fn delete_ledger(&mut self, table: &str, field: &str) -> Result<()> {
        self.execute(&format!("delete from ids where {}", row_filter(table, field)))
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DbConfig;
    use crate::db::{ConnectMode, FaultDriver, Injected, SqliteDriver};
    use crate::ids::IdAllocator;
    use crate::schema::catalog::default_registry;
    use crate::schema::ddl::bootstrap;
    use std::sync::Arc;
    use std::time::Duration;
    use test_case::test_case;

    fn bootstrapped() -> Connection {
        let mut conn = Connection::new(Box::new(SqliteDriver::new()), DbConfig::sqlite(":memory:"));
        conn.connect(ConnectMode::Once).unwrap();
        bootstrap(&mut conn, &default_registry()).unwrap();
        conn
    }

    #[test]
    fn test_connection_ledger_round() {
        let mut conn = bootstrapped();
        assert_eq!(conn.read_next_id("hosts", "hostid").unwrap(), None);
        assert!(conn.insert_ledger("hosts", "hostid", 10).unwrap());
        assert!(!conn.insert_ledger("hosts", "hostid", 10).unwrap());
        conn.bump_ledger("hosts", "hostid").unwrap();
        conn.advance_ledger("hosts", "hostid", 5).unwrap();
        assert_eq!(conn.read_next_id("hosts", "hostid").unwrap(), Some(16));
        conn.delete_ledger("hosts", "hostid").unwrap();
        assert_eq!(conn.read_next_id("hosts", "hostid").unwrap(), None);
    }

    #[test]
    fn test_max_record_id_bounds() {
        let mut conn = bootstrapped();
        assert_eq!(conn.max_record_id("hosts", "hostid", 0, 100).unwrap(), None);
        conn.execute("insert into hosts (hostid, host, status, flags) values (7, 'a', 0, 0);\ninsert into hosts (hostid, host, status, flags) values (500, 'b', 0, 0);\n")
            .unwrap();
        assert_eq!(conn.max_record_id("hosts", "hostid", 0, 100).unwrap(), Some(7));
    }

    #[test_case("-5" ; "negative")]
    #[test_case("-1" ; "minus one")]
    #[test_case("9223372036854775807" ; "at the ceiling")]
    #[test_case("18446744073709551615" ; "above the ceiling")]
    #[test_case("'garbage'" ; "not a number")]
    fn test_invalid_ledger_row_is_reseeded(nextid: &str) {
        let mut conn = bootstrapped();
        let ids = IdAllocator::new(Arc::new(default_registry()));
        conn.execute("insert into items (itemid,hostid,status,value_type) values (40,1,0,0)")
            .unwrap();
        conn.execute(&format!(
            "insert into ids (table_name,field_name,nextid) values ('items','itemid',{nextid})"
        ))
        .unwrap();

        assert_eq!(ids.reserve(&mut conn, "items", 3).unwrap(), 41);
        assert_eq!(conn.read_next_id("items", "itemid").unwrap(), Some(43));
        assert_eq!(ids.reserve(&mut conn, "items", 1).unwrap(), 44);
    }

    #[test]
    fn test_ledger_value_parsing() {
        let rows = |value: Option<&str>| {
            ResultSet::new(vec!["nextid".to_string()], vec![vec![value.map(str::to_string)]])
        };
        assert_eq!(ledger_value(rows(Some("12"))), Some(12));
        assert_eq!(ledger_value(rows(Some("-1"))), Some(u64::MAX));
        assert_eq!(ledger_value(rows(Some("1.5e19"))), Some(u64::MAX));
        assert_eq!(ledger_value(rows(None)), None);
        assert_eq!(ledger_value(ResultSet::default()), None);
    }

    #[test]
    fn test_reserve_inside_transaction() {
        let mut conn = bootstrapped();
        let ids = IdAllocator::new(Arc::new(default_registry()));
        conn.begin().unwrap();
        assert_eq!(ids.reserve(&mut conn, "items", 10).unwrap(), 1);
        conn.commit().unwrap();
        assert_eq!(ids.reserve(&mut conn, "items", 1).unwrap(), 11);
    }

    #[test]
    fn test_replayed_transaction_reserves_again() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(default_registry());
        let driver = FaultDriver::new(SqliteDriver::new());
        let faults = driver.handle();
        let config = DbConfig::sqlite(dir.path().join("ledger.db")).with_wait_down(Duration::ZERO);
        let mut conn = Connection::new(Box::new(driver), config);
        conn.connect(ConnectMode::Once).unwrap();
        bootstrap(&mut conn, &registry).unwrap();
        let ids = IdAllocator::new(registry);

        faults.push_commit(Injected::Down);
        let mut runs = 0;
        let first = conn
            .transaction(|conn| {
                runs += 1;
                let first = ids.reserve(conn, "items", 10)?;
                conn.execute(&format!(
                    "insert into items (itemid,hostid,status,value_type) values ({first},1,0,0)"
                ))?;
                Ok(first)
            })
            .unwrap();

        // The interrupted run was rolled back along with its ledger update.
        assert_eq!(runs, 2);
        assert_eq!(first, 1);
        assert_eq!(conn.select("select itemid from items").unwrap().len(), 1);
        assert_eq!(ids.reserve(&mut conn, "items", 1).unwrap(), 11);
    }

    #[test]
    fn test_reserve_in_failed_transaction_returns_zero() {
        let mut conn = bootstrapped();
        let ids = IdAllocator::new(Arc::new(default_registry()));
        conn.begin().unwrap();
        assert!(conn.execute("insert into missing values (1)").is_err());
        assert_eq!(ids.reserve(&mut conn, "items", 10).unwrap(), 0);
        conn.rollback().unwrap();
    }
}
