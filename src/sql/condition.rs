//! `WHERE` condition fragments for value lists.
//!
//! Engines cap the number of expressions in one `IN (...)` list, so long lists
//! are split into groups joined by `or`:
//!
//! ```text
//!  (itemid in (1,2,...,950) or itemid in (951,...))
//! ```
//!
//! `SQLite` also caps expression tree depth; once `max_expressions` groups are
//! chained a new parenthesized block is started.

use crate::db::{Dialect, push_u64};

/// Appends a condition matching `field` against any of `values`.
///
/// Nothing is appended for an empty list. Every fragment starts with a space.
///
/// # Examples
///
/// ```
/// use dbhigh::db::Dialect;
/// use dbhigh::sql::add_condition;
///
/// let mut sql = String::from("select name from items where");
/// add_condition(&mut sql, "itemid", &[3, 5, 8], Dialect::PostgreSql);
/// assert_eq!(sql, "select name from items where itemid in (3,5,8)");
/// ```
pub fn add_condition(sql: &mut String, field: &str, values: &[u64], dialect: Dialect) {
    let Some((&first, _)) = values.split_first() else {
        return;
    };
    let max = dialect.max_expressions();
    let grouped = values.len() > max;
    let nested = dialect.limits_expression_depth() && values.len().div_ceil(max) > max;

    sql.push(' ');
    if grouped {
        sql.push('(');
    }
    if nested {
        sql.push('(');
    }

    if values.len() == 1 {
        sql.push_str(field);
        sql.push('=');
        push_u64(sql, first);
    } else {
        sql.push_str(field);
        sql.push_str(" in (");

        let mut in_count = 0;
        let mut group_count = 0;
        for &value in values {
            if in_count == max {
                in_count = 0;
                sql.pop();
                group_count += 1;
                if nested && group_count == max {
                    group_count = 0;
                    sql.push_str(")) or (");
                } else {
                    sql.push_str(") or ");
                }
                sql.push_str(field);
                sql.push_str(" in (");
            }
            in_count += 1;
            push_u64(sql, value);
            sql.push(',');
        }
        sql.pop();
        sql.push(')');
    }

    if nested {
        sql.push(')');
    }
    if grouped {
        sql.push(')');
    }
}

/// Appends a condition matching `field` against any of the string `values`.
///
/// Values are escaped for `dialect`. Empty strings are matched with the
/// dialect's empty-string comparison, since some engines store `''` as `NULL`.
///
/// # Examples
///
/// ```
/// use dbhigh::db::Dialect;
/// use dbhigh::sql::add_str_condition;
///
/// let mut sql = String::from("where");
/// add_str_condition(&mut sql, "host", &["", "db's"], Dialect::PostgreSql);
/// assert_eq!(sql, "where (host='' or host='db''s')");
/// ```
pub fn add_str_condition(sql: &mut String, field: &str, values: &[&str], dialect: Dialect) {
    if values.is_empty() {
        return;
    }
    let max = dialect.max_expressions();
    let empty_count = values.iter().filter(|v| v.is_empty()).count();
    let value_count = values.len() - empty_count;

    sql.push(' ');
    if value_count > max || (value_count != 0 && empty_count != 0) {
        sql.push('(');
    }

    if empty_count != 0 {
        sql.push_str(field);
        sql.push_str(dialect.empty_string_cmp());
        if value_count == 0 {
            return;
        }
        sql.push_str(" or ");
    }

    let mut non_empty = values.iter().filter(|v| !v.is_empty());

    if value_count == 1 {
        if let Some(value) = non_empty.next() {
            sql.push_str(field);
            sql.push_str("='");
            sql.push_str(&dialect.escape_string(value, None, None));
            sql.push('\'');
        }
        if empty_count != 0 {
            sql.push(')');
        }
        return;
    }

    sql.push_str(field);
    sql.push_str(" in (");
    for (count, value) in non_empty.enumerate() {
        if count != 0 && count % max == 0 {
            sql.pop();
            sql.push_str(") or ");
            sql.push_str(field);
            sql.push_str(" in (");
        }
        sql.push('\'');
        sql.push_str(&dialect.escape_string(value, None, None));
        sql.push_str("',");
    }
    sql.pop();
    sql.push(')');

    if value_count > max || empty_count != 0 {
        sql.push(')');
    }
}

/// Comparison suffix for an id column: `=N`, or ` is null` for zero.
#[must_use]
pub fn sql_id_cmp(id: u64) -> String {
    if id == 0 {
        " is null".to_string()
    } else {
        format!("={id}")
    }
}

/// Insert literal for an id column: `N`, or `null` for zero.
#[must_use]
pub fn sql_id_ins(id: u64) -> String {
    if id == 0 {
        "null".to_string()
    } else {
        id.to_string()
    }
}
