//! Schema-checked bulk inserts.
//!
//! Rows are validated against the catalog when added and rendered for the
//! connection's dialect when executed. Engines with multi-row `insert` get
//! one statement per buffer:
//!
//! ```text
//! insert into hosts (hostid,host) values (1,'a'),(2,'b');
//! ```
//!
//! others get one statement per row. The buffer is flushed whenever it grows
//! past the connection's overflow threshold.

use super::overflow::execute_overflowed_sql;
use super::sql_id_ins;
use crate::db::{Connection, Dialect, ErrorCode, push_u64};
use crate::ids::IdAllocator;
use crate::schema::{Field, FieldFlags, FieldType, SchemaRegistry, Table, escape_field_value};
use crate::{Error, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;

/// A value for one column of a bulk insert row.
///
/// The variant must match the logical type of its field; all string-like
/// types (including base64 encoded blobs) take [`DbValue::Str`].
#[derive(Debug, Clone, PartialEq)]
pub enum DbValue {
    /// `Int` column.
    Int(i32),
    /// `Uint` column.
    Uint(u64),
    /// `Id` column; zero is stored as `NULL`.
    Id(u64),
    /// `Float` column; must be finite.
    Float(f64),
    /// `Char`, `Text`, `LongText`, `Cuid` or base64 encoded `Blob` column.
    Str(String),
}

impl DbValue {
    const fn tag(&self) -> &'static str {
        match self {
            Self::Int(_) => "int",
            Self::Uint(_) => "uint",
            Self::Id(_) => "id",
            Self::Float(_) => "float",
            Self::Str(_) => "string",
        }
    }

    const fn matches(&self, field_type: FieldType) -> bool {
        match self {
            Self::Int(_) => matches!(field_type, FieldType::Int),
            Self::Uint(_) => matches!(field_type, FieldType::Uint),
            Self::Id(_) => matches!(field_type, FieldType::Id),
            Self::Float(_) => matches!(field_type, FieldType::Float),
            Self::Str(_) => field_type.is_string(),
        }
    }
}

impl From<i32> for DbValue {
    fn from(value: i32) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for DbValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for DbValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for DbValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

/// A batch of rows for one table.
///
/// # Example
///
/// ```rust,ignore
/// let mut insert = BulkInsert::prepare(&registry, "event_tag", &["eventtagid", "eventid", "tag", "value"])?;
/// for (tag, value) in tags {
///     insert.add_row(vec![DbValue::Id(0), DbValue::Id(eventid), tag.into(), value.into()])?;
/// }
/// insert.autoincrement("eventtagid")?;
/// insert.execute(&mut conn, &ids)?;
/// ```
#[derive(Debug, Clone)]
pub struct BulkInsert {
    table: Table,
    fields: Vec<Field>,
    rows: Vec<Vec<DbValue>>,
    autoincrement: Option<usize>,
    last_id: u64,
}

impl BulkInsert {
    /// Prepares an insert into `table` listing `fields` in order.
    ///
    /// # Errors
    ///
    /// [`Error::Schema`] for an unknown table or field, an empty field list,
    /// or an engine-generated `Serial` field.
    pub fn prepare(registry: &SchemaRegistry, table: &str, fields: &[&str]) -> Result<Self> {
        let table = registry.require_table(table)?;
        if fields.is_empty() {
            return Err(Error::Schema(format!(
                "no fields to insert into table \"{}\"",
                table.name
            )));
        }

        let fields = fields
            .iter()
            .map(|name| {
                let field = table.require_field(name)?;
                if field.field_type == FieldType::Serial {
                    return Err(Error::Schema(format!(
                        "table \"{}\" field \"{name}\" is generated by the database",
                        table.name
                    )));
                }
                Ok(field.clone())
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            table: table.clone(),
            fields,
            rows: Vec::new(),
            autoincrement: None,
            last_id: 0,
        })
    }

    /// Appends one row; values are listed in the prepared field order.
    ///
    /// # Errors
    ///
    /// [`Error::Schema`] when the value count or a value's variant does not
    /// match the fields. [`Error::InvalidInput`] for non-finite floats and
    /// blob values that are not valid base64.
    pub fn add_row(&mut self, values: Vec<DbValue>) -> Result<()> {
        if values.len() != self.fields.len() {
            return Err(Error::Schema(format!(
                "table \"{}\" insert expects {} values, got {}",
                self.table.name,
                self.fields.len(),
                values.len()
            )));
        }

        for (field, value) in self.fields.iter().zip(&values) {
            if !value.matches(field.field_type) {
                return Err(Error::Schema(format!(
                    "table \"{}\" field \"{}\" of type {} cannot take a {} value",
                    self.table.name,
                    field.name,
                    field.field_type,
                    value.tag()
                )));
            }
            match value {
                DbValue::Float(v) if !v.is_finite() => {
                    return Err(Error::InvalidInput(format!(
                        "field \"{}\" value {v} is not finite",
                        field.name
                    )));
                },
                DbValue::Str(s) if field.field_type == FieldType::Blob => {
                    STANDARD.decode(s).map_err(|e| {
                        Error::InvalidInput(format!("field \"{}\" is not base64: {e}", field.name))
                    })?;
                },
                _ => {},
            }
        }

        self.rows.push(values);
        Ok(())
    }

    /// Assigns `field` fresh ids from the allocator on every [`execute`].
    ///
    /// Values given for the field in [`add_row`] are overwritten.
    ///
    /// [`execute`]: Self::execute
    /// [`add_row`]: Self::add_row
    ///
    /// # Errors
    ///
    /// [`Error::Schema`] unless `field` is one of the prepared `Id` fields.
    pub fn autoincrement(&mut self, field: &str) -> Result<()> {
        let index = self
            .fields
            .iter()
            .position(|f| f.field_type == FieldType::Id && f.name == field)
            .ok_or_else(|| {
                Error::Schema(format!(
                    "table \"{}\" has no prepared id field \"{field}\"",
                    self.table.name
                ))
            })?;
        self.autoincrement = Some(index);
        Ok(())
    }

    /// Last id assigned by the most recent [`execute`](Self::execute), zero
    /// without auto-increment.
    #[must_use]
    pub const fn last_id(&self) -> u64 {
        self.last_id
    }

    /// Target table name.
    #[must_use]
    pub fn table(&self) -> &str {
        &self.table.name
    }

    /// Number of rows added.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns `true` if no rows were added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Inserts all rows.
    ///
    /// Statements already flushed are not undone when a later flush fails;
    /// run inside a transaction for all-or-nothing behaviour.
    ///
    /// # Errors
    ///
    /// Propagates execute and id reservation errors. Inside a failed
    /// transaction the id reservation is skipped and a statement error with
    /// [`ErrorCode::Transaction`] is returned.
    pub fn execute(&mut self, conn: &mut Connection, ids: &IdAllocator) -> Result<()> {
        if self.rows.is_empty() {
            return Ok(());
        }

        if let Some(index) = self.autoincrement {
            self.assign_ids(conn, ids, index)?;
        }

        let dialect = conn.dialect();
        let multirow = dialect.supports_multirow_insert();
        let (command, defaults) = self.command(dialect);

        let mut sql = String::with_capacity(16 * 1024);
        for row in &self.rows {
            if !multirow || sql.is_empty() {
                sql.push_str(&command);
            }
            for (i, (field, value)) in self.fields.iter().zip(row).enumerate() {
                sql.push(if i == 0 { '(' } else { ',' });
                render_value(&mut sql, field, value, dialect)?;
            }
            sql.push_str(&defaults);
            sql.push_str(if multirow { ")," } else { ");\n" });

            execute_overflowed_sql(conn, &mut sql)?;
        }

        if !sql.is_empty() {
            if multirow && sql.ends_with(',') {
                sql.pop();
                sql.push_str(";\n");
            }
            conn.execute(&sql)?;
        }

        tracing::debug!(table = %self.table.name, rows = self.rows.len(), "bulk insert executed");
        crate::db::record_rows_inserted(&self.table.name, self.rows.len());
        Ok(())
    }

    fn assign_ids(&mut self, conn: &mut Connection, ids: &IdAllocator, index: usize) -> Result<()> {
        let count = self.rows.len() as u64;
        let first = ids.reserve(conn, &self.table.name, count)?;
        if first == 0 {
            tracing::debug!(table = %self.table.name, "skipping id assignment within failed transaction");
            return Err(Error::Statement {
                operation: "insert".to_string(),
                code: ErrorCode::Transaction,
                cause: "transaction has failed".to_string(),
            });
        }

        for (id, row) in (first..).zip(self.rows.iter_mut()) {
            row[index] = DbValue::Id(id);
        }
        self.last_id = first + count - 1;
        Ok(())
    }

    /// Renders `insert into t (f1,f2) values ` and the trailing defaults
    /// appended to every row.
    fn command(&self, dialect: Dialect) -> (String, String) {
        let mut command = format!("insert into {} ", self.table.name);
        let mut defaults = String::new();

        for (i, field) in self.fields.iter().enumerate() {
            command.push(if i == 0 { '(' } else { ',' });
            command.push_str(&field.name);
        }

        if dialect.requires_text_defaults() {
            let omitted = self.table.fields.iter().filter(|field| {
                matches!(
                    field.field_type,
                    FieldType::Blob | FieldType::Text | FieldType::LongText | FieldType::Cuid
                ) && !self.fields.iter().any(|f| f.name == field.name)
            });
            for field in omitted {
                command.push(',');
                command.push_str(&field.name);
                defaults.push_str(",''");
            }
        }

        command.push_str(") values ");
        (command, defaults)
    }
}

fn render_value(sql: &mut String, field: &Field, value: &DbValue, dialect: Dialect) -> Result<()> {
    match value {
        DbValue::Int(v) => sql.push_str(&v.to_string()),
        DbValue::Uint(v) => push_u64(sql, *v),
        DbValue::Float(v) => sql.push_str(&format!("{v:e}")),
        DbValue::Id(v) => sql.push_str(&sql_id_ins(*v)),
        DbValue::Str(s) if field.field_type == FieldType::Blob => {
            let bytes = STANDARD
                .decode(s)
                .map_err(|e| Error::InvalidInput(format!("field \"{}\" is not base64: {e}", field.name)))?;
            if let Some(literal) = dialect.binary_literal(&bytes) {
                sql.push_str(&literal);
            } else {
                sql.push('\'');
                sql.push_str(&escape_field_value(field, s, dialect));
                sql.push('\'');
            }
        },
        DbValue::Str(s) => {
            let upper = field.flags.contains(FieldFlags::UPPER);
            sql.push_str(if upper { "upper('" } else { "'" });
            sql.push_str(&escape_field_value(field, s, dialect));
            sql.push_str(if upper { "')" } else { "'" });
        },
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DbConfig;
    use crate::db::{Call, ConnectMode, FaultDriver, FaultHandle, SqliteDriver};
    use crate::schema::catalog::default_registry;
    use crate::schema::ddl::bootstrap;
    use std::sync::Arc;

    fn bootstrapped() -> (Connection, FaultHandle, IdAllocator) {
        let registry = Arc::new(default_registry());
        let driver = FaultDriver::new(SqliteDriver::new());
        let handle = driver.handle();
        let mut conn = Connection::new(Box::new(driver), DbConfig::sqlite(":memory:"));
        conn.connect(ConnectMode::Once).unwrap();
        bootstrap(&mut conn, &registry).unwrap();
        handle.clear_calls();
        (conn, handle, IdAllocator::new(registry))
    }

    fn first_column(conn: &mut Connection, sql: &str) -> Vec<Option<String>> {
        conn.select(sql).unwrap().map(|row| row[0].clone()).collect()
    }

    #[test]
    fn test_prepare_rejects_unknown_names() {
        let registry = default_registry();
        assert!(matches!(
            BulkInsert::prepare(&registry, "nope", &["a"]),
            Err(Error::Schema(_))
        ));
        assert!(matches!(
            BulkInsert::prepare(&registry, "hosts", &["hostid", "nope"]),
            Err(Error::Schema(_))
        ));
        assert!(matches!(
            BulkInsert::prepare(&registry, "hosts", &[]),
            Err(Error::Schema(_))
        ));
        assert!(matches!(
            BulkInsert::prepare(&registry, "proxy_history", &["id", "itemid"]),
            Err(Error::Schema(_))
        ));
    }

    #[test]
    fn test_add_row_checks_values() {
        let registry = default_registry();
        let mut insert = BulkInsert::prepare(&registry, "history", &["itemid", "clock", "value", "ns"]).unwrap();

        assert!(matches!(
            insert.add_row(vec![DbValue::Id(1), DbValue::Int(0)]),
            Err(Error::Schema(_))
        ));
        assert!(matches!(
            insert.add_row(vec![DbValue::Uint(1), DbValue::Int(0), DbValue::Float(1.0), DbValue::Int(0)]),
            Err(Error::Schema(_))
        ));
        assert!(matches!(
            insert.add_row(vec![DbValue::Id(1), DbValue::Int(0), DbValue::Float(f64::NAN), DbValue::Int(0)]),
            Err(Error::InvalidInput(_))
        ));
        assert!(insert.is_empty());

        insert
            .add_row(vec![DbValue::Id(1), DbValue::Int(0), DbValue::Float(1.5), DbValue::Int(0)])
            .unwrap();
        assert_eq!(insert.len(), 1);
    }

    #[test]
    fn test_add_row_rejects_bad_base64() {
        let registry = default_registry();
        let mut insert = BulkInsert::prepare(&registry, "history_bin", &["itemid", "clock", "value", "ns"]).unwrap();
        assert!(matches!(
            insert.add_row(vec![DbValue::Id(1), DbValue::Int(0), "not base64!".into(), DbValue::Int(0)]),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_autoincrement_requires_prepared_id_field() {
        let registry = default_registry();
        let mut insert = BulkInsert::prepare(&registry, "hosts", &["hostid", "host"]).unwrap();
        assert!(matches!(insert.autoincrement("host"), Err(Error::Schema(_))));
        assert!(matches!(insert.autoincrement("proxyid"), Err(Error::Schema(_))));
        insert.autoincrement("hostid").unwrap();
    }

    #[test]
    fn test_execute_empty_is_noop() {
        let (mut conn, handle, ids) = bootstrapped();
        let mut insert = BulkInsert::prepare(ids.registry(), "hosts", &["hostid", "host"]).unwrap();
        insert.autoincrement("hostid").unwrap();
        insert.execute(&mut conn, &ids).unwrap();
        assert!(handle.calls().is_empty());
        assert_eq!(insert.last_id(), 0);
    }

    #[test]
    fn test_execute_assigns_ids() {
        let (mut conn, _handle, ids) = bootstrapped();
        let mut insert = BulkInsert::prepare(ids.registry(), "hosts", &["hostid", "host", "status", "flags"]).unwrap();
        for host in ["a", "b", "c"] {
            insert
                .add_row(vec![DbValue::Id(0), host.into(), DbValue::Int(0), DbValue::Int(0)])
                .unwrap();
        }
        insert.autoincrement("hostid").unwrap();
        insert.execute(&mut conn, &ids).unwrap();
        assert_eq!(insert.last_id(), 3);

        assert_eq!(
            first_column(&mut conn, "select hostid from hosts order by hostid"),
            vec![Some("1".to_string()), Some("2".to_string()), Some("3".to_string())]
        );
    }

    #[test]
    fn test_execute_renders_types() {
        let (mut conn, handle, ids) = bootstrapped();
        let mut insert = BulkInsert::prepare(
            ids.registry(),
            "hosts",
            &["hostid", "proxyid", "host", "status", "flags", "name_upper"],
        )
        .unwrap();
        insert
            .add_row(vec![
                DbValue::Id(7),
                DbValue::Id(0),
                "it's".into(),
                DbValue::Int(-1),
                DbValue::Int(2),
                "Web".into(),
            ])
            .unwrap();
        insert.execute(&mut conn, &ids).unwrap();

        assert!(handle.saw(&Call::Execute(
            "insert into hosts (hostid,proxyid,host,status,flags,name_upper) values (7,null,'it''s',-1,2,upper('Web'));\n"
                .to_string()
        )));
        assert_eq!(
            first_column(&mut conn, "select name_upper from hosts where proxyid is null"),
            vec![Some("WEB".to_string())]
        );
    }

    #[test]
    fn test_execute_one_statement_per_row_without_multirow() {
        let (mut conn, handle, ids) = bootstrapped();
        let mut insert = BulkInsert::prepare(ids.registry(), "history_uint", &["itemid", "clock", "value", "ns"]).unwrap();
        for clock in 0..3 {
            insert
                .add_row(vec![DbValue::Id(1), DbValue::Int(clock), DbValue::Uint(42), DbValue::Int(0)])
                .unwrap();
        }
        insert.execute(&mut conn, &ids).unwrap();

        let calls = handle.calls();
        let Some(Call::Execute(sql)) = calls.first() else {
            panic!("expected an execute, got {calls:?}");
        };
        assert_eq!(sql.matches("insert into history_uint").count(), 3);
        assert_eq!(
            first_column(&mut conn, "select count(*) from history_uint"),
            vec![Some("3".to_string())]
        );
    }

    #[test]
    fn test_float_rendering() {
        let registry = default_registry();
        let (_, field) = registry.require_field("history", "value").unwrap();
        let mut sql = String::new();
        render_value(&mut sql, field, &DbValue::Float(1.5), Dialect::Sqlite).unwrap();
        assert_eq!(sql, "1.5e0");

        let (_, field) = registry.require_field("hosts", "status").unwrap();
        sql.push(',');
        render_value(&mut sql, field, &DbValue::Int(-7), Dialect::Sqlite).unwrap();
        assert_eq!(sql, "1.5e0,-7");
    }

    #[test]
    fn test_blob_rendering() {
        let registry = default_registry();
        let (_, field) = registry.require_field("history_bin", "value").unwrap();
        let value = DbValue::Str(STANDARD.encode([0u8, 1, 0xff]));

        let render = |dialect| {
            let mut sql = String::new();
            render_value(&mut sql, field, &value, dialect).unwrap();
            sql
        };
        assert_eq!(render(Dialect::PostgreSql), "'\\x0001ff'");
        assert_eq!(render(Dialect::MySql), "x'0001ff'");
        assert_eq!(render(Dialect::Sqlite), "'AAH/'");
    }

    #[test]
    fn test_mysql_text_defaults() {
        let registry = default_registry();
        let insert = BulkInsert::prepare(&registry, "alerts", &["alertid", "eventid"]).unwrap();
        let (command, defaults) = insert.command(Dialect::MySql);
        assert_eq!(command, "insert into alerts (alertid,eventid,message) values ");
        assert_eq!(defaults, ",''");

        let (command, defaults) = insert.command(Dialect::PostgreSql);
        assert_eq!(command, "insert into alerts (alertid,eventid) values ");
        assert!(defaults.is_empty());
    }

    #[test]
    fn test_execute_in_failed_transaction() {
        let (mut conn, _handle, ids) = bootstrapped();
        let mut insert = BulkInsert::prepare(ids.registry(), "hosts", &["hostid", "host"]).unwrap();
        insert.add_row(vec![DbValue::Id(0), "a".into()]).unwrap();
        insert.autoincrement("hostid").unwrap();

        conn.begin().unwrap();
        assert!(conn.execute("insert into missing values (1)").is_err());
        assert!(matches!(
            insert.execute(&mut conn, &ids),
            Err(Error::Statement {
                code: ErrorCode::Transaction,
                ..
            })
        ));
        conn.rollback().unwrap();
    }
}
