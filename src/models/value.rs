//! Raw cell values and bind parameters.
//!
//! `DbValue` is the storage representation the engine adapters decode rows
//! into. `DbValue::Null` is the storage-null marker; the untyped path turns it
//! into `JsonValue::Null` and the typed path applies the field's null policy.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// A single raw value read from (or bound to) an engine.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum DbValue {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Exact DECIMAL/NUMERIC text as produced by the engine
    Decimal(String),
    Text(String),
    Bytes(Vec<u8>),
    Json(JsonValue),
    Uuid(Uuid),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Date(NaiveDate),
    Time(NaiveTime),
}

impl DbValue {
    /// Check if this is the storage-null marker.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Runtime type name used in diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Decimal(_) => "decimal",
            Self::Text(_) => "text",
            Self::Bytes(_) => "bytes",
            Self::Json(_) => "json",
            Self::Uuid(_) => "uuid",
            Self::Timestamp(_) => "timestamp",
            Self::TimestampTz(_) => "timestamptz",
            Self::Date(_) => "date",
            Self::Time(_) => "time",
        }
    }

    /// Convert to the JSON shape used by untyped rows.
    ///
    /// Binary data becomes base64, UUIDs and temporal values become their
    /// canonical text, decimals keep their exact text.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Self::Null => JsonValue::Null,
            Self::Bool(v) => JsonValue::Bool(*v),
            Self::Int(v) => JsonValue::Number((*v).into()),
            Self::Float(v) => serde_json::Number::from_f64(*v)
                .map(JsonValue::Number)
                .unwrap_or_else(|| JsonValue::String(v.to_string())),
            Self::Decimal(v) | Self::Text(v) => JsonValue::String(v.clone()),
            Self::Bytes(v) => JsonValue::String(STANDARD.encode(v)),
            Self::Json(v) => v.clone(),
            Self::Uuid(v) => JsonValue::String(v.hyphenated().to_string()),
            Self::Timestamp(v) => JsonValue::String(v.format("%Y-%m-%dT%H:%M:%S%.f").to_string()),
            Self::TimestampTz(v) => {
                JsonValue::String(v.to_rfc3339_opts(SecondsFormat::AutoSi, true))
            }
            Self::Date(v) => JsonValue::String(v.format("%Y-%m-%d").to_string()),
            Self::Time(v) => JsonValue::String(v.format("%H:%M:%S%.f").to_string()),
        }
    }

    /// Build a raw value from a parsed JSON value.
    ///
    /// Scalars map onto their native variants; objects and arrays stay JSON.
    pub fn from_json(value: JsonValue) -> Self {
        match value {
            JsonValue::Null => Self::Null,
            JsonValue::Bool(v) => Self::Bool(v),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => match n.as_f64() {
                    Some(f) => Self::Float(f),
                    None => Self::Decimal(n.to_string()),
                },
            },
            JsonValue::String(s) => Self::Text(s),
            other => Self::Json(other),
        }
    }
}

impl std::fmt::Display for DbValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => Ok(()),
            Self::Text(v) | Self::Decimal(v) => f.write_str(v),
            Self::Json(JsonValue::String(v)) => f.write_str(v),
            other => match other.to_json() {
                JsonValue::String(s) => f.write_str(&s),
                json => write!(f, "{}", json),
            },
        }
    }
}

macro_rules! impl_from_for_db_value {
    ($($ty:ty => $variant:ident),+ $(,)?) => {
        $(
            impl From<$ty> for DbValue {
                fn from(v: $ty) -> Self {
                    DbValue::$variant(v.into())
                }
            }
        )+
    };
}

impl_from_for_db_value!(
    bool => Bool,
    i8 => Int,
    i16 => Int,
    i32 => Int,
    i64 => Int,
    u8 => Int,
    u16 => Int,
    u32 => Int,
    f32 => Float,
    f64 => Float,
    String => Text,
    &str => Text,
    Vec<u8> => Bytes,
    JsonValue => Json,
    Uuid => Uuid,
    NaiveDateTime => Timestamp,
    DateTime<Utc> => TimestampTz,
    NaiveDate => Date,
    NaiveTime => Time,
);

impl From<rust_decimal::Decimal> for DbValue {
    fn from(v: rust_decimal::Decimal) -> Self {
        DbValue::Decimal(v.to_string())
    }
}

impl<T: Into<DbValue>> From<Option<T>> for DbValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(DbValue::Null)
    }
}

/// Engine-agnostic logical type tag of a bind parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DbType {
    AnsiString,
    #[default]
    String,
    Byte,
    Int16,
    Int32,
    Int64,
    Boolean,
    Single,
    Double,
    Decimal,
    Guid,
    Date,
    Time,
    DateTime,
    DateTimeOffset,
    Binary,
    Json,
    Object,
}

impl DbType {
    /// Infer the tag for a raw value.
    pub fn infer(value: &DbValue) -> Self {
        match value {
            DbValue::Null | DbValue::Text(_) => Self::String,
            DbValue::Bool(_) => Self::Boolean,
            DbValue::Int(_) => Self::Int64,
            DbValue::Float(_) => Self::Double,
            DbValue::Decimal(_) => Self::Decimal,
            DbValue::Bytes(_) => Self::Binary,
            DbValue::Json(_) => Self::Json,
            DbValue::Uuid(_) => Self::Guid,
            DbValue::Timestamp(_) => Self::DateTime,
            DbValue::TimestampTz(_) => Self::DateTimeOffset,
            DbValue::Date(_) => Self::Date,
            DbValue::Time(_) => Self::Time,
        }
    }
}

/// Direction of a bind parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Direction {
    #[default]
    Input,
    Output,
    InputOutput,
    ReturnValue,
}

impl Direction {
    /// Whether the parameter carries a value to the engine.
    pub fn is_input(&self) -> bool {
        matches!(self, Self::Input | Self::InputOutput)
    }
}

/// A named bind parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct BindParam {
    pub name: String,
    pub db_type: DbType,
    pub value: DbValue,
    pub direction: Direction,
    pub size: Option<u32>,
}

impl BindParam {
    /// Create an input parameter, inferring its type tag from the value.
    pub fn new(name: impl Into<String>, value: impl Into<DbValue>) -> Self {
        let value = value.into();
        Self {
            name: name.into(),
            db_type: DbType::infer(&value),
            value,
            direction: Direction::Input,
            size: None,
        }
    }

    /// Override the logical type tag.
    pub fn with_type(mut self, db_type: DbType) -> Self {
        self.db_type = db_type;
        self
    }

    /// Set the parameter direction.
    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    /// Set the declared size.
    pub fn with_size(mut self, size: u32) -> Self {
        self.size = Some(size);
        self
    }
}
