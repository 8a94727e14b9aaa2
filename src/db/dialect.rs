//! Engine dialects.
//!
//! A [`Dialect`] captures everything that differs between engines at the SQL
//! text level: escaping, binary literals, expression ceilings, row locking and
//! schema introspection queries. It is chosen once at startup from the
//! configured engine.

use crate::{Error, Result};

/// Escape character used in `LIKE ... escape '!'` clauses.
pub const LIKE_ESCAPE_CHAR: char = '!';

/// Supported storage engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Dialect {
    /// MySQL and MariaDB.
    MySql,
    /// PostgreSQL and compatible engines.
    PostgreSql,
    /// Embedded single-file engine.
    #[default]
    Sqlite,
    /// Enterprise RDBMS.
    Oracle,
}

impl Dialect {
    /// Parses an engine name as used in configuration files.
    pub fn parse(name: &str) -> Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "mysql" | "mariadb" => Ok(Self::MySql),
            "postgresql" | "postgres" | "pgsql" => Ok(Self::PostgreSql),
            "sqlite" | "sqlite3" => Ok(Self::Sqlite),
            "oracle" => Ok(Self::Oracle),
            other => Err(Error::Config(format!("unknown database engine \"{other}\""))),
        }
    }

    /// Returns the canonical engine name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MySql => "mysql",
            Self::PostgreSql => "postgresql",
            Self::Sqlite => "sqlite",
            Self::Oracle => "oracle",
        }
    }

    /// Maximum number of values in a single `IN (...)` list.
    #[must_use]
    pub const fn max_expressions(self) -> usize {
        match self {
            Self::MySql | Self::PostgreSql => 1000,
            Self::Sqlite | Self::Oracle => 950,
        }
    }

    /// Whether long `or` chains must be split into nested blocks to stay under
    /// the engine's expression tree depth limit.
    #[must_use]
    pub const fn limits_expression_depth(self) -> bool {
        matches!(self, Self::Sqlite)
    }

    /// Whether `insert ... values (...),(...)` is supported.
    #[must_use]
    pub const fn supports_multirow_insert(self) -> bool {
        matches!(self, Self::MySql | Self::PostgreSql)
    }

    /// Whether text columns have engine-imposed byte limits.
    #[must_use]
    pub const fn limits_field_bytes(self) -> bool {
        matches!(self, Self::MySql)
    }

    /// Whether inserts must list text columns without defaults explicitly.
    #[must_use]
    pub const fn requires_text_defaults(self) -> bool {
        matches!(self, Self::MySql)
    }

    /// Row locking suffix for `select` statements.
    #[must_use]
    pub const fn for_update(self) -> &'static str {
        match self {
            Self::Sqlite => "",
            _ => " for update",
        }
    }

    /// Comparison that matches an empty string value.
    #[must_use]
    pub const fn empty_string_cmp(self) -> &'static str {
        match self {
            Self::Oracle => " is null",
            _ => "=''",
        }
    }

    /// Escapes `src` for use inside a single-quoted SQL literal.
    ///
    /// The input is first truncated on a UTF-8 boundary to at most
    /// `max_bytes` bytes and `max_chars` characters (`None` means unlimited).
    #[must_use]
    pub fn escape_string(self, src: &str, max_bytes: Option<usize>, max_chars: Option<usize>) -> String {
        let src = truncate_utf8(src, max_bytes, max_chars);
        let mut out = String::with_capacity(src.len() + 8);
        for c in src.chars() {
            self.push_escaped(&mut out, c);
        }
        out
    }

    fn push_escaped(self, out: &mut String, c: char) {
        match self {
            Self::MySql => match c {
                '\'' | '\\' | '"' => {
                    out.push('\\');
                    out.push(c);
                },
                '\0' => out.push_str("\\0"),
                '\n' => out.push_str("\\n"),
                '\r' => out.push_str("\\r"),
                '\x1a' => out.push_str("\\Z"),
                _ => out.push(c),
            },
            _ => {
                if c == '\'' {
                    out.push('\'');
                }
                out.push(c);
            },
        }
    }

    /// Escapes `src` as a `LIKE` pattern using [`LIKE_ESCAPE_CHAR`], then
    /// escapes the result as a string literal.
    ///
    /// # Examples
    ///
    /// ```
    /// use dbhigh::db::Dialect;
    ///
    /// assert_eq!(Dialect::Sqlite.escape_like_pattern("50%_off!"), "50!%!_off!!");
    /// assert_eq!(Dialect::PostgreSql.escape_like_pattern("it's"), "it''s");
    /// ```
    #[must_use]
    pub fn escape_like_pattern(self, src: &str) -> String {
        let mut out = String::with_capacity(src.len() + 8);
        for c in src.chars() {
            if matches!(c, '%' | '_') || c == LIKE_ESCAPE_CHAR {
                out.push(LIKE_ESCAPE_CHAR);
            }
            self.push_escaped(&mut out, c);
        }
        out
    }

    /// Renders raw bytes as a binary literal, or `None` when the engine stores
    /// blobs as their base64 text.
    #[must_use]
    pub fn binary_literal(self, bytes: &[u8]) -> Option<String> {
        match self {
            Self::MySql => Some(format!("x'{}'", hex::encode(bytes))),
            Self::PostgreSql => Some(format!("'\\x{}'", hex::encode(bytes))),
            Self::Sqlite | Self::Oracle => None,
        }
    }

    /// Wraps `sql` so that at most `n` rows are returned.
    #[must_use]
    pub fn limit(self, sql: &str, n: usize) -> String {
        match self {
            Self::Oracle => format!("select * from ({sql}) where rownum<={n}"),
            _ => format!("{sql} limit {n}"),
        }
    }

    /// Query returning a row when `table` exists.
    #[must_use]
    pub fn table_exists_sql(self, table: &str, schema: &str) -> String {
        let table = self.escape_string(table, None, None);
        match self {
            Self::MySql => format!("show tables like '{table}'"),
            Self::PostgreSql => format!(
                "select 1 from information_schema.tables where table_name='{table}' and table_schema='{}'",
                self.escape_string(schema, None, None)
            ),
            Self::Sqlite => {
                format!("select 1 from sqlite_master where tbl_name='{table}' and type='table'")
            },
            Self::Oracle => format!(
                "select 1 from tab where tabtype='TABLE' and lower(tname)='{}'",
                table.to_lowercase()
            ),
        }
    }

    /// Query returning a row when `table.field` exists.
    #[must_use]
    pub fn field_exists_sql(self, table: &str, field: &str, schema: &str) -> String {
        let table_esc = self.escape_string(table, None, None);
        let field = self.escape_string(field, None, None);
        match self {
            Self::MySql => format!("show columns from {table} like '{field}'"),
            Self::PostgreSql => format!(
                "select 1 from information_schema.columns where table_name='{table_esc}' and column_name='{field}' and table_schema='{}'",
                self.escape_string(schema, None, None)
            ),
            Self::Sqlite => {
                format!("select 1 from pragma_table_info('{table_esc}') where name='{field}'")
            },
            Self::Oracle => format!(
                "select 1 from col where lower(tname)='{}' and lower(cname)='{}'",
                table_esc.to_lowercase(),
                field.to_lowercase()
            ),
        }
    }

    /// Query returning a row when index `index` exists on `table`.
    #[must_use]
    pub fn index_exists_sql(self, table: &str, index: &str, schema: &str) -> String {
        let table = self.escape_string(table, None, None);
        let index = self.escape_string(index, None, None);
        match self {
            Self::MySql => format!("show index from {table} where key_name='{index}'"),
            Self::PostgreSql => format!(
                "select 1 from pg_indexes where tablename='{table}' and indexname='{index}' and schemaname='{}'",
                self.escape_string(schema, None, None)
            ),
            Self::Sqlite => format!(
                "select 1 from sqlite_master where tbl_name='{table}' and type='index' and name='{index}'"
            ),
            Self::Oracle => format!(
                "select 1 from user_indexes where lower(table_name)='{}' and lower(index_name)='{}'",
                table.to_lowercase(),
                index.to_lowercase()
            ),
        }
    }

    /// Query returning a row when `table` has a primary key.
    #[must_use]
    pub fn pk_exists_sql(self, table: &str, schema: &str) -> String {
        let table = self.escape_string(table, None, None);
        match self {
            Self::MySql => format!("show index from {table} where key_name='PRIMARY'"),
            Self::PostgreSql => format!(
                "select 1 from information_schema.table_constraints where table_name='{table}' and constraint_type='PRIMARY KEY' and constraint_schema='{}'",
                self.escape_string(schema, None, None)
            ),
            Self::Sqlite => format!("select 1 from pragma_table_info('{table}') where pk>0"),
            Self::Oracle => format!(
                "select 1 from user_constraints where lower(table_name)='{}' and constraint_type='P'",
                table.to_lowercase()
            ),
        }
    }

    /// Query returning a row when trigger `trigger` exists on `table`.
    #[must_use]
    pub fn trigger_exists_sql(self, table: &str, trigger: &str, schema: &str) -> String {
        let table = self.escape_string(table, None, None);
        let trigger = self.escape_string(trigger, None, None);
        match self {
            Self::MySql => {
                format!("show triggers where `table`='{table}' and `trigger`='{trigger}'")
            },
            Self::PostgreSql => format!(
                "select 1 from information_schema.triggers where event_object_table='{table}' and trigger_name='{trigger}' and trigger_schema='{}'",
                self.escape_string(schema, None, None)
            ),
            Self::Sqlite => format!(
                "select 1 from sqlite_master where tbl_name='{table}' and type='trigger' and name='{trigger}'"
            ),
            Self::Oracle => format!(
                "select 1 from user_triggers where lower(table_name)='{}' and lower(trigger_name)='{}'",
                table.to_lowercase(),
                trigger.to_lowercase()
            ),
        }
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Dialect {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Truncates `src` to the given byte and character limits without splitting
/// a UTF-8 sequence.
#[must_use]
pub fn truncate_utf8(src: &str, max_bytes: Option<usize>, max_chars: Option<usize>) -> &str {
    let mut end = 0;
    for (count, (index, c)) in src.char_indices().enumerate() {
        if max_chars.is_some_and(|max| count >= max) {
            break;
        }
        let next = index + c.len_utf8();
        if max_bytes.is_some_and(|max| next > max) {
            break;
        }
        end = next;
    }
    &src[..end]
}

/// Appends the decimal rendering of `value` to `sql`.
pub(crate) fn push_u64(sql: &mut String, value: u64) {
    sql.push_str(&value.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("mysql", Dialect::MySql)]
    #[test_case("MariaDB", Dialect::MySql)]
    #[test_case("postgres", Dialect::PostgreSql)]
    #[test_case(" sqlite3 ", Dialect::Sqlite)]
    #[test_case("oracle", Dialect::Oracle)]
    fn test_parse(name: &str, expected: Dialect) {
        assert_eq!(Dialect::parse(name).unwrap(), expected);
    }

    #[test]
    fn test_parse_unknown() {
        assert!(matches!(Dialect::parse("db2"), Err(Error::Config(_))));
        assert!("ibm".parse::<Dialect>().is_err());
    }

    #[test]
    fn test_expression_ceilings() {
        assert_eq!(Dialect::MySql.max_expressions(), 1000);
        assert_eq!(Dialect::PostgreSql.max_expressions(), 1000);
        assert_eq!(Dialect::Sqlite.max_expressions(), 950);
        assert_eq!(Dialect::Oracle.max_expressions(), 950);
        assert!(Dialect::Sqlite.limits_expression_depth());
        assert!(!Dialect::MySql.limits_expression_depth());
    }

    #[test_case(Dialect::Sqlite, "it's", "it''s")]
    #[test_case(Dialect::PostgreSql, "a\\b'c", "a\\b''c")]
    #[test_case(Dialect::MySql, "a\\b'c", "a\\\\b\\'c")]
    #[test_case(Dialect::MySql, "line\nbreak\0", "line\\nbreak\\0")]
    #[test_case(Dialect::Oracle, "''", "''''")]
    fn test_escape_string(dialect: Dialect, input: &str, expected: &str) {
        assert_eq!(dialect.escape_string(input, None, None), expected);
    }

    #[test]
    fn test_escape_truncates_before_escaping() {
        assert_eq!(Dialect::Sqlite.escape_string("ab'cd", None, Some(3)), "ab''");
        assert_eq!(Dialect::MySql.escape_string("ab'cd", Some(3), None), "ab\\'");
    }

    #[test]
    fn test_truncate_utf8_boundaries() {
        // "é" is two bytes
        assert_eq!(truncate_utf8("aéb", Some(2), None), "a");
        assert_eq!(truncate_utf8("aéb", Some(3), None), "aé");
        assert_eq!(truncate_utf8("aéb", None, Some(2)), "aé");
        assert_eq!(truncate_utf8("aéb", Some(0), None), "");
        assert_eq!(truncate_utf8("aéb", None, None), "aéb");
    }

    #[test]
    fn test_escape_like_pattern() {
        assert_eq!(Dialect::Sqlite.escape_like_pattern("a%b_c!d"), "a!%b!_c!!d");
        assert_eq!(Dialect::MySql.escape_like_pattern("o'k_"), "o\\'k!_");
    }

    #[test]
    fn test_binary_literal() {
        assert_eq!(
            Dialect::MySql.binary_literal(&[0x00, 0xff]).as_deref(),
            Some("x'00ff'")
        );
        assert_eq!(
            Dialect::PostgreSql.binary_literal(b"AB").as_deref(),
            Some("'\\x4142'")
        );
        assert!(Dialect::Sqlite.binary_literal(b"AB").is_none());
    }

    #[test]
    fn test_push_u64() {
        let mut sql = "nextid=".to_string();
        push_u64(&mut sql, u64::MAX);
        assert_eq!(sql, "nextid=18446744073709551615");
    }

    #[test]
    fn test_limit_and_locking() {
        assert_eq!(Dialect::Sqlite.limit("select 1", 5), "select 1 limit 5");
        assert_eq!(
            Dialect::Oracle.limit("select 1 from dual", 1),
            "select * from (select 1 from dual) where rownum<=1"
        );
        assert_eq!(Dialect::Sqlite.for_update(), "");
        assert_eq!(Dialect::PostgreSql.for_update(), " for update");
        assert_eq!(Dialect::Oracle.empty_string_cmp(), " is null");
    }

    #[test]
    fn test_introspection_sql_escapes_names() {
        let sql = Dialect::PostgreSql.table_exists_sql("it's", "public");
        assert!(sql.contains("table_name='it''s'"));
        assert!(sql.contains("table_schema='public'"));
        assert_eq!(
            Dialect::Sqlite.field_exists_sql("hosts", "name", ""),
            "select 1 from pragma_table_info('hosts') where name='name'"
        );
    }
}
