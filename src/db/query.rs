//! Typed building blocks for the generic repository: column enums, bound
//! values, filters, ordering and the per-table traits.
//!
//! Field names coming from the outside (CLI arguments, bot commands) are
//! resolved through [`Column::from_name`]; anything that is not a real column
//! is rejected with [`RepoError::UnknownField`] instead of being ignored.

use super::error::{RepoError, RepoResult};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, QueryBuilder, Sqlite};
use std::fmt;

/// A value bound into a generated statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
    Time(DateTime<Utc>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Time(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Column enum of a table. `ALL` lists every real column.
pub trait Column: Copy + PartialEq + fmt::Debug + Send + Sync + 'static {
    const ALL: &'static [Self];

    fn name(self) -> &'static str;

    fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.name() == name)
    }
}

/// Equality condition `column = value` (`IS NULL` for [`Value::Null`]).
#[derive(Debug, Clone, PartialEq)]
pub struct Filter<C> {
    pub column: C,
    pub value: Value,
}

impl<C: Column> Filter<C> {
    pub fn eq(column: C, value: impl Into<Value>) -> Self {
        Self {
            column,
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrderBy<C> {
    pub column: C,
    pub descending: bool,
}

impl<C: Column> OrderBy<C> {
    pub fn asc(column: C) -> Self {
        Self {
            column,
            descending: false,
        }
    }

    pub fn desc(column: C) -> Self {
        Self {
            column,
            descending: true,
        }
    }
}

/// Offset pagination, `skip` rows then at most `limit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub skip: i64,
    pub limit: i64,
}

impl Page {
    pub fn new(skip: i64, limit: i64) -> Self {
        Self {
            skip: skip.max(0),
            limit: limit.max(0),
        }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self { skip: 0, limit: 100 }
    }
}

/// Insert payload of a table.
pub trait Insert: Clone + Send + Sync {
    type Column: Column;

    /// Checked before any statement reaches the store.
    fn validate(&self) -> RepoResult<()> {
        Ok(())
    }

    /// Column/value pairs of the INSERT, timestamps included.
    fn values(&self) -> Vec<(Self::Column, Value)>;

    /// Copy a lookup filter into the payload (used by `get_or_create`).
    fn apply(&mut self, column: Self::Column, value: &Value) -> RepoResult<()>;

    /// Statement run inside the insert transaction before the row is written.
    fn before_insert(&self) -> Option<&'static str> {
        None
    }
}

/// Partial update of a table. Only fields that are `Some` are written.
pub trait Patch: Send + Sync {
    type Column: Column;

    fn assignments(&self) -> Vec<(Self::Column, Value)>;
}

/// A table with a surrogate integer `id` key.
pub trait Table: for<'r> FromRow<'r, SqliteRow> + Send + Unpin + 'static {
    /// SQL table name.
    const NAME: &'static str;
    /// Name used in errors and logs.
    const ENTITY: &'static str;
    /// Select list, in row-mapping order.
    const COLUMNS: &'static str;

    type Column: Column;
    type New: Insert<Column = Self::Column>;
    type Patch: Patch<Column = Self::Column>;

    fn id(&self) -> i64;

    /// Resolve an external field name against the table's columns.
    fn column(name: &str) -> RepoResult<Self::Column> {
        Self::Column::from_name(name).ok_or_else(|| RepoError::UnknownField {
            entity: Self::ENTITY,
            field: name.to_string(),
        })
    }

    /// Build a filter from an external field name.
    fn filter(name: &str, value: impl Into<Value>) -> RepoResult<Filter<Self::Column>> {
        Ok(Filter::eq(Self::column(name)?, value))
    }
}

pub(crate) fn push_value(qb: &mut QueryBuilder<'_, Sqlite>, value: Value) {
    match value {
        Value::Null => qb.push("NULL"),
        Value::Bool(v) => qb.push_bind(v),
        Value::Int(v) => qb.push_bind(v),
        Value::Text(v) => qb.push_bind(v),
        Value::Time(v) => qb.push_bind(v),
    };
}

pub(crate) fn push_where<C: Column>(qb: &mut QueryBuilder<'_, Sqlite>, filters: &[Filter<C>]) {
    for (i, filter) in filters.iter().enumerate() {
        qb.push(if i == 0 { " WHERE " } else { " AND " });
        qb.push(filter.column.name());
        if filter.value.is_null() {
            qb.push(" IS NULL");
        } else {
            qb.push(" = ");
            push_value(qb, filter.value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum Col {
        Id,
        Title,
    }

    impl Column for Col {
        const ALL: &'static [Self] = &[Col::Id, Col::Title];

        fn name(self) -> &'static str {
            match self {
                Col::Id => "id",
                Col::Title => "title",
            }
        }
    }

    #[test]
    fn resolves_known_columns_only() {
        assert_eq!(Col::from_name("title"), Some(Col::Title));
        assert_eq!(Col::from_name("titel"), None);
    }

    #[test]
    fn where_clause_uses_is_null() {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM t");
        push_where(
            &mut qb,
            &[Filter::eq(Col::Id, 3_i64), Filter::eq(Col::Title, Value::Null)],
        );
        assert_eq!(qb.sql(), "SELECT * FROM t WHERE id = ? AND title IS NULL");
    }

    #[test]
    fn option_converts_to_null() {
        assert_eq!(Value::from(None::<i64>), Value::Null);
        assert_eq!(Value::from(Some("x")), Value::Text("x".into()));
    }
}
