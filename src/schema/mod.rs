//! Table and field metadata.
//!
//! The catalog is an immutable [`SchemaRegistry`] handed to the components that
//! need it, so tests can run against alternative schema versions.
//!
//! # Field size limits
//!
//! | Type | Max bytes (`MySQL`) | Max bytes (others) | Max chars |
//! |------|---------------------|--------------------|-----------|
//! | `Char`, `Text` | 65535 | unlimited | declared length, unlimited when 0 |
//! | `LongText`, `Blob` | 4294967295 | unlimited | declared length, unlimited when 0 |
//! | `Cuid` | 25 | unlimited | 25 |

pub mod catalog;
pub mod ddl;

use crate::db::Dialect;
use crate::{Error, Result};
use std::collections::HashMap;
use std::ops::BitOr;

/// Length of a generated collision-resistant id, including the terminator slot.
pub const CUID_LEN: usize = 26;

/// Logical type of a schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    /// Signed 32-bit integer.
    Int,
    /// Unsigned 64-bit integer.
    Uint,
    /// Record identifier; zero is stored as `NULL`.
    Id,
    /// Double precision float.
    Float,
    /// Bounded text.
    Char,
    /// Text up to 64 KiB.
    Text,
    /// Unbounded text.
    LongText,
    /// Binary payload, transported as base64.
    Blob,
    /// Generated collision-resistant id string.
    Cuid,
    /// Engine-generated sequence value.
    Serial,
}

impl FieldType {
    /// Returns `true` for types rendered as quoted string literals.
    #[must_use]
    pub const fn is_string(self) -> bool {
        matches!(
            self,
            Self::Char | Self::Text | Self::LongText | Self::Blob | Self::Cuid
        )
    }

    /// Returns the lowercase type name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Int => "int",
            Self::Uint => "uint",
            Self::Id => "id",
            Self::Float => "float",
            Self::Char => "char",
            Self::Text => "text",
            Self::LongText => "longtext",
            Self::Blob => "blob",
            Self::Cuid => "cuid",
            Self::Serial => "serial",
        }
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Field flag bit set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FieldFlags(u8);

impl FieldFlags {
    /// No flags.
    pub const NONE: Self = Self(0);
    /// Values are stored upper-cased via the engine's `upper()` function.
    pub const UPPER: Self = Self(1);
    /// Column is declared `not null`.
    pub const NOT_NULL: Self = Self(1 << 1);

    /// Returns `true` if every bit in `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for FieldFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// A table column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    /// Column name.
    pub name: String,
    /// Logical type.
    pub field_type: FieldType,
    /// Declared length in characters (0 when not applicable or unbounded).
    pub length: usize,
    /// Flags.
    pub flags: FieldFlags,
}

impl Field {
    /// Creates a field with unbounded length and no flags.
    #[must_use]
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            length: 0,
            flags: FieldFlags::NONE,
        }
    }

    /// Sets the declared length.
    #[must_use]
    pub const fn with_length(mut self, length: usize) -> Self {
        self.length = length;
        self
    }

    /// Sets flags.
    #[must_use]
    pub const fn with_flags(mut self, flags: FieldFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Maximum storage bytes on `dialect`, `None` when unlimited.
    #[must_use]
    pub const fn max_bytes(&self, dialect: Dialect) -> Option<usize> {
        if !dialect.limits_field_bytes() {
            return None;
        }
        match self.field_type {
            FieldType::Blob | FieldType::LongText => Some(4_294_967_295),
            FieldType::Char | FieldType::Text => Some(65_535),
            FieldType::Cuid => Some(CUID_LEN - 1),
            _ => None,
        }
    }

    /// Maximum characters, `None` when unlimited.
    #[must_use]
    pub const fn max_chars(&self) -> Option<usize> {
        match self.field_type {
            FieldType::Cuid => Some(CUID_LEN - 1),
            _ if self.length == 0 => None,
            _ => Some(self.length),
        }
    }
}

/// A table definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    /// Table name.
    pub name: String,
    /// Record id column, if the table has one.
    pub recid: Option<String>,
    /// Ordered columns.
    pub fields: Vec<Field>,
    /// Primary key columns; defaults to the record id column.
    pub primary_key: Vec<String>,
}

impl Table {
    /// Creates a table whose primary key is `recid`.
    #[must_use]
    pub fn new(name: impl Into<String>, recid: impl Into<String>, fields: Vec<Field>) -> Self {
        let recid = recid.into();
        Self {
            name: name.into(),
            primary_key: vec![recid.clone()],
            recid: Some(recid),
            fields,
        }
    }

    /// Creates a table without a record id column.
    #[must_use]
    pub fn keyed(name: impl Into<String>, primary_key: &[&str], fields: Vec<Field>) -> Self {
        Self {
            name: name.into(),
            recid: None,
            fields,
            primary_key: primary_key.iter().map(ToString::to_string).collect(),
        }
    }

    /// Looks up a field by name.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Looks up a field, failing with [`Error::Schema`] when unknown.
    pub fn require_field(&self, name: &str) -> Result<&Field> {
        self.field(name).ok_or_else(|| {
            tracing::error!(table = %self.name, field = name, "invalid table field");
            Error::Schema(format!("invalid table: \"{}\" field: \"{name}\"", self.name))
        })
    }

    /// Returns the record id column, failing when the table has none.
    pub fn require_recid(&self) -> Result<&str> {
        self.recid
            .as_deref()
            .ok_or_else(|| Error::Schema(format!("table \"{}\" has no record id field", self.name)))
    }
}

/// Immutable registry of tables.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    tables: Vec<Table>,
    by_name: HashMap<String, usize>,
}

impl SchemaRegistry {
    /// Creates a registry from table definitions.
    ///
    /// Later definitions replace earlier ones with the same name.
    #[must_use]
    pub fn new(tables: Vec<Table>) -> Self {
        let mut registry = Self::default();
        for table in tables {
            registry.insert(table);
        }
        registry
    }

    fn insert(&mut self, table: Table) {
        if let Some(&index) = self.by_name.get(&table.name) {
            self.tables[index] = table;
        } else {
            self.by_name.insert(table.name.clone(), self.tables.len());
            self.tables.push(table);
        }
    }

    /// Returns a registry extended with `table`.
    #[must_use]
    pub fn with_table(mut self, table: Table) -> Self {
        self.insert(table);
        self
    }

    /// Looks up a table by name.
    #[must_use]
    pub fn table(&self, name: &str) -> Option<&Table> {
        self.by_name.get(name).map(|&index| &self.tables[index])
    }

    /// Looks up a table, failing with [`Error::Schema`] when unknown.
    pub fn require_table(&self, name: &str) -> Result<&Table> {
        self.table(name).ok_or_else(|| {
            tracing::error!(table = name, "invalid table");
            Error::Schema(format!("invalid table: \"{name}\""))
        })
    }

    /// Looks up a table and one of its fields.
    pub fn require_field(&self, table: &str, field: &str) -> Result<(&Table, &Field)> {
        let table = self.require_table(table)?;
        let field = table.require_field(field)?;
        Ok((table, field))
    }

    /// Iterates tables in registration order.
    pub fn tables(&self) -> impl Iterator<Item = &Table> {
        self.tables.iter()
    }

    /// Returns the number of tables.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    /// Returns `true` if the registry holds no tables.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Checks whether `value` fits the storage limits of `table.field`.
    ///
    /// Returns `Ok(false)` when it does not fit.
    pub fn validate_field_size(
        &self,
        table: &str,
        field: &str,
        value: &str,
        dialect: Dialect,
    ) -> Result<bool> {
        let (_, field) = self.require_field(table, field)?;
        Ok(fits_field(field, value, dialect))
    }

    /// Escapes `value` for `table.field`, truncating to the field limits.
    pub fn escape_field(
        &self,
        table: &str,
        field: &str,
        value: &str,
        dialect: Dialect,
    ) -> Result<String> {
        let (_, field) = self.require_field(table, field)?;
        Ok(escape_field_value(field, value, dialect))
    }
}

/// Checks a value against a field's byte and character limits.
#[must_use]
pub fn fits_field(field: &Field, value: &str, dialect: Dialect) -> bool {
    let max_bytes = field.max_bytes(dialect);
    if max_bytes.is_some_and(|max| value.len() > max) {
        return false;
    }
    let Some(max_chars) = field.max_chars() else {
        return true;
    };
    // Character count only matters where it can be stricter than the byte limit.
    Some(max_chars) == max_bytes || value.chars().count() <= max_chars
}

/// Escapes a value with the field's byte and character limits applied.
#[must_use]
pub fn escape_field_value(field: &Field, value: &str, dialect: Dialect) -> String {
    dialect.escape_string(value, field.max_bytes(dialect), field.max_chars())
}
