//! `CREATE TABLE` rendering for bootstrapping empty databases.
//!
//! Patch-level schema upgrades are out of scope; this only creates the
//! tables of a registry when they do not exist yet.

use super::{Field, FieldFlags, FieldType, SchemaRegistry, Table};
use crate::Result;
use crate::db::{Connection, Dialect};

fn column_type(field: &Field, dialect: Dialect) -> String {
    match (field.field_type, dialect) {
        (FieldType::Int, Dialect::Oracle) => "number(10)".to_string(),
        (FieldType::Int, _) => "integer".to_string(),
        (FieldType::Uint | FieldType::Id, Dialect::MySql) => "bigint unsigned".to_string(),
        (FieldType::Uint | FieldType::Id, Dialect::Oracle) => "number(20)".to_string(),
        (FieldType::Uint | FieldType::Id, _) => "bigint".to_string(),
        (FieldType::Float, Dialect::Oracle) => "binary_double".to_string(),
        (FieldType::Float, _) => "double precision".to_string(),
        (FieldType::Char, Dialect::Oracle) => format!("nvarchar2({})", field.length),
        (FieldType::Char, _) => format!("varchar({})", field.length),
        (FieldType::Cuid, _) => format!("varchar({})", super::CUID_LEN - 1),
        (FieldType::Text | FieldType::LongText, Dialect::Oracle) => "nclob".to_string(),
        (FieldType::LongText, Dialect::MySql) => "longtext".to_string(),
        (FieldType::Text | FieldType::LongText, _) => "text".to_string(),
        (FieldType::Blob, Dialect::MySql) => "longblob".to_string(),
        (FieldType::Blob, Dialect::PostgreSql) => "bytea".to_string(),
        (FieldType::Blob, _) => "blob".to_string(),
        (FieldType::Serial, Dialect::MySql) => "bigint unsigned auto_increment".to_string(),
        (FieldType::Serial, Dialect::PostgreSql) => "bigserial".to_string(),
        (FieldType::Serial, Dialect::Sqlite) => "integer".to_string(),
        (FieldType::Serial, Dialect::Oracle) => "number(20) generated as identity".to_string(),
    }
}

/// Renders the `CREATE TABLE` statement for `table`.
#[must_use]
pub fn create_table_sql(table: &Table, dialect: Dialect) -> String {
    let mut sql = String::from("create table ");
    if dialect != Dialect::Oracle {
        sql.push_str("if not exists ");
    }
    sql.push_str(&table.name);
    sql.push_str(" (");

    let columns: Vec<String> = table
        .fields
        .iter()
        .map(|field| {
            let mut column = format!("{} {}", field.name, column_type(field, dialect));
            if field.flags.contains(FieldFlags::NOT_NULL) {
                column.push_str(" not null");
            }
            column
        })
        .collect();
    sql.push_str(&columns.join(","));

    if !table.primary_key.is_empty() {
        sql.push_str(",primary key (");
        sql.push_str(&table.primary_key.join(","));
        sql.push(')');
    }
    sql.push(')');
    sql
}

/// Creates every table of `registry` that does not exist yet.
///
/// Returns the number of tables created.
pub fn bootstrap(conn: &mut Connection, registry: &SchemaRegistry) -> Result<usize> {
    let dialect = conn.dialect();
    let mut created = 0;
    for table in registry.tables() {
        if crate::db::introspect::table_exists(conn, &table.name)? {
            continue;
        }
        conn.execute(&create_table_sql(table, dialect))?;
        tracing::info!(table = %table.name, "created table");
        created += 1;
    }
    Ok(created)
}
