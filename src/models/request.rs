//! Request envelope, result sets and the result slot.

use crate::models::value::{BindParam, DbValue};
use serde_json::Value as JsonValue;
use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// An untyped row: column name to value, in column order.
pub type Row = serde_json::Map<String, JsonValue>;

/// How the command text is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommandKind {
    #[default]
    Text,
    StoredProcedure,
}

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
    /// Maps to REPEATABLE READ on engines without a distinct snapshot level
    Snapshot,
}

impl IsolationLevel {
    /// SQL keyword form of this level.
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::ReadUncommitted => "READ UNCOMMITTED",
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead | Self::Snapshot => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
        }
    }
}

/// The common request/response envelope carried by every parameter type.
#[derive(Debug, Default)]
pub struct Request {
    pub query: String,
    pub parameters: Vec<BindParam>,
    pub kind: CommandKind,
    pub timeout: Option<Duration>,
    /// Selects one of several configured connections of the same engine
    pub connection_id: Option<String>,
    result: Option<QueryResult>,
    affected_rows: Option<u64>,
}

impl Request {
    /// Create a text command.
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }

    /// Create a stored-procedure command.
    pub fn procedure(name: impl Into<String>) -> Self {
        Self {
            query: name.into(),
            kind: CommandKind::StoredProcedure,
            ..Default::default()
        }
    }

    /// Add a bind parameter.
    pub fn with_param(mut self, param: BindParam) -> Self {
        self.parameters.push(param);
        self
    }

    /// Set the per-command timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Target a specific configured connection.
    pub fn with_connection(mut self, connection_id: impl Into<String>) -> Self {
        self.connection_id = Some(connection_id.into());
        self
    }

    /// The result of the last execution, if any.
    pub fn result(&self) -> Option<&QueryResult> {
        self.result.as_ref()
    }

    /// Take the result out of the slot.
    pub fn take_result(&mut self) -> Option<QueryResult> {
        self.result.take()
    }

    /// Rows affected by the last non-query execution.
    pub fn affected_rows(&self) -> Option<u64> {
        self.affected_rows
    }

    /// Store the outcome of one execution call, replacing any previous one.
    pub fn set_result(&mut self, result: QueryResult) {
        self.affected_rows = match &result {
            QueryResult::Affected(n) => Some(*n),
            _ => None,
        };
        self.result = Some(result);
    }
}

/// Column metadata of a result set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    /// Database-specific type (e.g., "int8", "varchar", "TEXT")
    pub type_name: String,
}

impl Column {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
        }
    }
}

/// One fully drained result set, addressed by ordinal.
#[derive(Debug, Clone, Default)]
pub struct ResultSet {
    pub columns: Arc<[Column]>,
    pub rows: Vec<Vec<DbValue>>,
}

impl ResultSet {
    pub fn new(columns: Vec<Column>, rows: Vec<Vec<DbValue>>) -> Self {
        Self {
            columns: columns.into(),
            rows,
        }
    }

    /// Build a set from rows given as (column, value) pairs.
    ///
    /// Columns are taken from the first row; later rows are read by name.
    pub fn from_records<I, R, K>(records: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: IntoIterator<Item = (K, DbValue)>,
        K: Into<String>,
    {
        let mut columns: Vec<Column> = Vec::new();
        let mut rows = Vec::new();
        for (index, record) in records.into_iter().enumerate() {
            let pairs: Vec<(String, DbValue)> =
                record.into_iter().map(|(k, v)| (k.into(), v)).collect();
            if index == 0 {
                columns = pairs.iter().map(|(k, _)| Column::new(k.as_str(), "")).collect();
                rows.push(pairs.into_iter().map(|(_, v)| v).collect());
            } else {
                let mut row = vec![DbValue::Null; columns.len()];
                for (name, value) in pairs {
                    if let Some(ordinal) = columns.iter().position(|c| c.name == name) {
                        row[ordinal] = value;
                    }
                }
                rows.push(row);
            }
        }
        Self::new(columns, rows)
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Column names in ordinal order.
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }
}

/// Typed result of a reader, after shape collapse.
#[derive(Debug, Clone, PartialEq)]
pub enum Materialized<T> {
    One(T),
    Many(Vec<T>),
    Sets(BTreeMap<usize, Vec<T>>),
}

impl<T> Materialized<T> {
    /// Flatten into a list regardless of shape.
    pub fn into_vec(self) -> Vec<T> {
        match self {
            Self::One(item) => vec![item],
            Self::Many(items) => items,
            Self::Sets(sets) => sets.into_values().flatten().collect(),
        }
    }

    pub fn as_one(&self) -> Option<&T> {
        match self {
            Self::One(item) => Some(item),
            _ => None,
        }
    }

    pub fn as_many(&self) -> Option<&[T]> {
        match self {
            Self::Many(items) => Some(items),
            _ => None,
        }
    }
}

/// Type-erased `Materialized<T>` stored in the result slot.
pub struct TypedResult {
    type_name: &'static str,
    value: Box<dyn Any + Send + Sync>,
}

impl TypedResult {
    pub fn new<T: Send + Sync + 'static>(value: Materialized<T>) -> Self {
        Self {
            type_name: std::any::type_name::<T>(),
            value: Box::new(value),
        }
    }

    /// Name of the record type this result holds.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn downcast_ref<T: 'static>(&self) -> Option<&Materialized<T>> {
        self.value.downcast_ref::<Materialized<T>>()
    }

    pub fn downcast<T: 'static>(self) -> Result<Materialized<T>, Self> {
        let type_name = self.type_name;
        self.value
            .downcast::<Materialized<T>>()
            .map(|b| *b)
            .map_err(|value| Self { type_name, value })
    }
}

impl std::fmt::Debug for TypedResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypedResult")
            .field("type_name", &self.type_name)
            .finish_non_exhaustive()
    }
}

/// The result slot of a request.
#[derive(Debug)]
pub enum QueryResult {
    /// First column of the first row, uncoerced
    Scalar(DbValue),
    /// Exactly one row, or an empty mapping for zero rows
    Row(Row),
    /// More than one row
    Rows(Vec<Row>),
    /// More than one result set, indexed in engine order
    ResultSets(BTreeMap<usize, Vec<Row>>),
    Typed(TypedResult),
    Affected(u64),
}

impl QueryResult {
    pub fn as_scalar(&self) -> Option<&DbValue> {
        match self {
            Self::Scalar(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_row(&self) -> Option<&Row> {
        match self {
            Self::Row(row) => Some(row),
            _ => None,
        }
    }

    pub fn as_rows(&self) -> Option<&[Row]> {
        match self {
            Self::Rows(rows) => Some(rows),
            _ => None,
        }
    }

    pub fn as_result_sets(&self) -> Option<&BTreeMap<usize, Vec<Row>>> {
        match self {
            Self::ResultSets(sets) => Some(sets),
            _ => None,
        }
    }

    pub fn as_typed<T: 'static>(&self) -> Option<&Materialized<T>> {
        match self {
            Self::Typed(typed) => typed.downcast_ref::<T>(),
            _ => None,
        }
    }

    pub fn into_typed<T: 'static>(self) -> Option<Materialized<T>> {
        match self {
            Self::Typed(typed) => typed.downcast::<T>().ok(),
            _ => None,
        }
    }

    /// JSON rendering of the slot. Typed results render as `null`.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Self::Scalar(v) => v.to_json(),
            Self::Row(row) => JsonValue::Object(row.clone()),
            Self::Rows(rows) => {
                JsonValue::Array(rows.iter().cloned().map(JsonValue::Object).collect())
            }
            Self::ResultSets(sets) => JsonValue::Object(
                sets.iter()
                    .map(|(index, rows)| {
                        (
                            index.to_string(),
                            JsonValue::Array(rows.iter().cloned().map(JsonValue::Object).collect()),
                        )
                    })
                    .collect(),
            ),
            Self::Typed(_) => JsonValue::Null,
            Self::Affected(n) => JsonValue::Number((*n).into()),
        }
    }
}
