//! Engine row decoding.
//!
//! Type conversion uses a two-phase approach:
//! 1. `TypeCategory` classifies column types into logical categories
//! 2. Database-specific decoders extract a [`DbValue`] for the category
//!
//! A column that fails to decode fails the whole command with
//! `DbError::Internal`; no partially decoded row is returned.

use crate::error::{DbError, DbResult};
use crate::models::{Column, DatabaseType, DbValue, ResultSet};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::mysql::{MySqlRow, MySqlTypeInfo, MySqlValueRef};
use sqlx::postgres::{PgRow, PgTypeInfo, PgValueFormat, PgValueRef};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column as _, Decode, Row, Type, TypeInfo, ValueRef};
use tracing::warn;

// =============================================================================
// Type Classification
// =============================================================================

/// Logical category for database column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Integer,
    Float,
    Decimal,
    Boolean,
    Text,
    Binary,
    Json,
    Uuid,
    Date,
    Time,
    Timestamp,
    TimestampTz,
    Unknown,
}

/// How a rule matches a lowercased type name.
#[derive(Clone, Copy)]
enum Pattern {
    Is(&'static str),
    Has(&'static str),
}

impl Pattern {
    fn matches(self, name: &str) -> bool {
        match self {
            Self::Is(exact) => name == exact,
            Self::Has(part) => name.contains(part),
        }
    }
}

/// First match wins. Temporal names precede the integer rules because
/// "interval" and "point" contain "int".
const RULES: &[(Pattern, TypeCategory)] = {
    use Pattern::{Has, Is};
    use TypeCategory::*;
    &[
        (Has("decimal"), Decimal),
        (Has("numeric"), Decimal),
        (Is("timestamptz"), TimestampTz),
        (Is("timestamp with time zone"), TimestampTz),
        (Is("timestamp"), Timestamp),
        (Is("timestamp without time zone"), Timestamp),
        (Is("datetime"), Timestamp),
        (Is("date"), Date),
        (Is("time"), Time),
        (Is("time without time zone"), Time),
        (Is("interval"), Unknown),
        (Is("point"), Unknown),
        (Has("int"), Integer),
        (Has("serial"), Integer),
        (Has("tiny"), Integer),
        (Is("bool"), Boolean),
        (Is("boolean"), Boolean),
        (Has("float"), Float),
        (Has("double"), Float),
        (Is("real"), Float),
        (Is("json"), Json),
        (Is("jsonb"), Json),
        (Is("uuid"), Uuid),
        (Has("blob"), Binary),
        (Has("binary"), Binary),
        (Is("bytea"), Binary),
        (Has("char"), Text),
        (Has("text"), Text),
        (Is("name"), Text),
    ]
};

/// Classify an engine type name into a logical category.
pub fn categorize_type(type_name: &str, db: DatabaseType) -> TypeCategory {
    let lower = type_name.to_ascii_lowercase();
    // SQLite's NUMERIC affinity stores floats
    if db == DatabaseType::SQLite && lower == "numeric" {
        return TypeCategory::Float;
    }
    RULES
        .iter()
        .find(|(pattern, _)| pattern.matches(&lower))
        .map_or(TypeCategory::Unknown, |(_, category)| *category)
}

// =============================================================================
// Decimal Type Support
// =============================================================================

/// Wrapper type for raw DECIMAL/NUMERIC values as strings.
/// This preserves the exact database representation.
#[derive(Debug)]
pub struct RawDecimal(pub String);

impl Type<sqlx::MySql> for RawDecimal {
    fn type_info() -> MySqlTypeInfo {
        <String as Type<sqlx::MySql>>::type_info()
    }

    fn compatible(ty: &MySqlTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("decimal") || name.contains("numeric")
    }
}

impl<'r> Decode<'r, sqlx::MySql> for RawDecimal {
    fn decode(value: MySqlValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as Decode<sqlx::MySql>>::decode(value)?;
        Ok(RawDecimal(s.to_string()))
    }
}

impl Type<sqlx::Postgres> for RawDecimal {
    fn type_info() -> PgTypeInfo {
        <String as Type<sqlx::Postgres>>::type_info()
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("numeric") || name.contains("decimal")
    }
}

impl<'r> Decode<'r, sqlx::Postgres> for RawDecimal {
    fn decode(value: PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        match value.format() {
            PgValueFormat::Text => Ok(RawDecimal(value.as_str()?.to_string())),
            PgValueFormat::Binary => numeric_to_string(value.as_bytes()?).map(RawDecimal),
        }
    }
}

/// Render a binary-format PostgreSQL NUMERIC (base-10000 digit groups).
fn numeric_to_string(bytes: &[u8]) -> Result<String, sqlx::error::BoxDynError> {
    use std::fmt::Write as _;

    const NEGATIVE: u16 = 0x4000;
    const NAN: u16 = 0xC000;
    const POS_INF: u16 = 0xD000;
    const NEG_INF: u16 = 0xF000;

    let word = |at: usize| -> Result<u16, sqlx::error::BoxDynError> {
        bytes
            .get(at..at + 2)
            .map(|b| u16::from_be_bytes([b[0], b[1]]))
            .ok_or_else(|| "numeric value truncated".into())
    };

    let ndigits = usize::from(word(0)?);
    let weight = i32::from(word(2)? as i16);
    let sign = word(4)?;
    let dscale = usize::from(word(6)?);

    match sign {
        NAN => return Ok("NaN".to_string()),
        POS_INF => return Ok("Infinity".to_string()),
        NEG_INF => return Ok("-Infinity".to_string()),
        _ => {}
    }

    let digits = (0..ndigits)
        .map(|i| word(8 + i * 2))
        .collect::<Result<Vec<u16>, _>>()?;
    let digit_at = |index: i32| -> u16 {
        usize::try_from(index)
            .ok()
            .and_then(|i| digits.get(i).copied())
            .unwrap_or(0)
    };

    let mut out = String::new();
    if sign == NEGATIVE {
        out.push('-');
    }
    if weight < 0 {
        out.push('0');
    } else {
        for index in 0..=weight {
            if index == 0 {
                write!(out, "{}", digit_at(index))?;
            } else {
                write!(out, "{:04}", digit_at(index))?;
            }
        }
    }

    if dscale > 0 {
        let mut fraction = String::new();
        let groups = dscale.div_ceil(4) as i32;
        for k in 0..groups {
            write!(fraction, "{:04}", digit_at(weight + 1 + k))?;
        }
        fraction.truncate(dscale);
        out.push('.');
        out.push_str(&fraction);
    }

    Ok(out)
}

// =============================================================================
// Row Decoding
// =============================================================================

/// Decode an engine row into column metadata and raw values.
pub trait DecodeRow {
    fn column_list(&self) -> Vec<Column>;

    fn decode_values(&self) -> DbResult<Vec<DbValue>>;
}

macro_rules! impl_decode_row {
    ($row:ty, $db:expr, $decoder:path) => {
        impl DecodeRow for $row {
            fn column_list(&self) -> Vec<Column> {
                self.columns()
                    .iter()
                    .map(|col| Column::new(col.name(), col.type_info().name()))
                    .collect()
            }

            fn decode_values(&self) -> DbResult<Vec<DbValue>> {
                self.columns()
                    .iter()
                    .enumerate()
                    .map(|(idx, col)| {
                        let type_name = col.type_info().name();
                        $decoder(self, idx, type_name, categorize_type(type_name, $db))
                    })
                    .collect()
            }
        }
    };
}

impl_decode_row!(MySqlRow, DatabaseType::MySQL, mysql::decode_column);
impl_decode_row!(PgRow, DatabaseType::PostgreSQL, postgres::decode_column);
impl_decode_row!(SqliteRow, DatabaseType::SQLite, sqlite::decode_column);

/// Accumulates decoded rows of one result set.
#[derive(Debug, Default)]
pub(crate) struct SetBuilder {
    columns: Option<Vec<Column>>,
    rows: Vec<Vec<DbValue>>,
}

impl SetBuilder {
    pub fn push<R: DecodeRow>(&mut self, row: &R) -> DbResult<()> {
        let values = row.decode_values()?;
        if self.columns.is_none() {
            self.columns = Some(row.column_list());
        }
        self.rows.push(values);
        Ok(())
    }

    pub fn has_rows(&self) -> bool {
        !self.rows.is_empty()
    }

    /// Close the current set and start a new one.
    pub fn finish(&mut self) -> ResultSet {
        let columns = self.columns.take().unwrap_or_default();
        ResultSet::new(columns, std::mem::take(&mut self.rows))
    }
}

/// Return the first integer width the driver accepts for the column.
macro_rules! first_int {
    ($row:expr, $idx:expr, $($ty:ty),+) => {
        $(
            if let Ok(Some(v)) = $row.try_get::<Option<$ty>, _>($idx) {
                return Ok(DbValue::Int(v.into()));
            }
        )+
    };
}

fn decode_failed(idx: usize, kind: &str, error: sqlx::Error) -> DbError {
    warn!(column = idx, kind, error = %error, "Failed to decode column");
    DbError::internal(format!("Column {idx} could not be decoded as {kind}: {error}"))
}

// =============================================================================
// Database-Specific Decoders
// =============================================================================

mod mysql {
    use super::*;

    pub fn decode_column(
        row: &MySqlRow,
        idx: usize,
        type_name: &str,
        category: TypeCategory,
    ) -> DbResult<DbValue> {
        match category {
            TypeCategory::Decimal => decode_typed::<RawDecimal>(row, idx, "decimal", |v| {
                DbValue::Decimal(v.0)
            }),
            TypeCategory::Integer => decode_integer(row, idx),
            TypeCategory::Boolean => decode_typed::<bool>(row, idx, "bool", DbValue::Bool),
            TypeCategory::Float => decode_float(row, idx),
            TypeCategory::Binary => decode_typed::<Vec<u8>>(row, idx, "binary", DbValue::Bytes),
            // MySQL JSON decodes as serde_json::Value directly
            TypeCategory::Json => decode_typed::<JsonValue>(row, idx, "json", DbValue::Json),
            TypeCategory::Date => decode_typed::<NaiveDate>(row, idx, "date", DbValue::Date),
            TypeCategory::Time => decode_typed::<NaiveTime>(row, idx, "time", DbValue::Time),
            TypeCategory::Timestamp | TypeCategory::TimestampTz => {
                decode_typed::<NaiveDateTime>(row, idx, "datetime", DbValue::Timestamp)
            }
            _ => decode_text(row, idx, type_name),
        }
    }

    fn decode_typed<T>(
        row: &MySqlRow,
        idx: usize,
        kind: &str,
        wrap: fn(T) -> DbValue,
    ) -> DbResult<DbValue>
    where
        T: for<'r> Decode<'r, sqlx::MySql> + Type<sqlx::MySql>,
    {
        row.try_get::<Option<T>, _>(idx)
            .map(|v| v.map_or(DbValue::Null, wrap))
            .map_err(|e| decode_failed(idx, kind, e))
    }

    fn decode_integer(row: &MySqlRow, idx: usize) -> DbResult<DbValue> {
        if let Ok(None) = row.try_get::<Option<i64>, _>(idx) {
            return Ok(DbValue::Null);
        }
        first_int!(row, idx, i8, i16, i32, i64, u8, u16, u32);
        match row.try_get::<Option<u64>, _>(idx) {
            // BIGINT UNSIGNED beyond i64 keeps its exact digits
            Ok(Some(v)) => Ok(i64::try_from(v)
                .map(DbValue::Int)
                .unwrap_or_else(|_| DbValue::Decimal(v.to_string()))),
            Ok(None) => Ok(DbValue::Null),
            Err(e) => Err(decode_failed(idx, "integer", e)),
        }
    }

    fn decode_float(row: &MySqlRow, idx: usize) -> DbResult<DbValue> {
        match row.try_get::<Option<f64>, _>(idx) {
            Ok(v) => Ok(v.map_or(DbValue::Null, DbValue::Float)),
            Err(_) => decode_typed::<f32>(row, idx, "float", |v| DbValue::Float(f64::from(v))),
        }
    }

    fn decode_text(row: &MySqlRow, idx: usize, type_name: &str) -> DbResult<DbValue> {
        let Some(text) = row
            .try_get::<Option<String>, _>(idx)
            .map_err(|e| decode_failed(idx, "text", e))?
        else {
            return Ok(DbValue::Null);
        };
        if type_name.to_lowercase().contains("json") {
            if let Ok(json) = serde_json::from_str::<JsonValue>(&text) {
                return Ok(DbValue::Json(json));
            }
        }
        Ok(DbValue::Text(text))
    }
}

mod postgres {
    use super::*;

    pub fn decode_column(
        row: &PgRow,
        idx: usize,
        _type_name: &str,
        category: TypeCategory,
    ) -> DbResult<DbValue> {
        match category {
            TypeCategory::Decimal => decode_typed::<RawDecimal>(row, idx, "numeric", |v| {
                DbValue::Decimal(v.0)
            }),
            TypeCategory::Integer => decode_integer(row, idx),
            TypeCategory::Boolean => decode_typed::<bool>(row, idx, "bool", DbValue::Bool),
            TypeCategory::Float => decode_float(row, idx),
            TypeCategory::Binary => decode_typed::<Vec<u8>>(row, idx, "bytea", DbValue::Bytes),
            TypeCategory::Json => decode_typed::<JsonValue>(row, idx, "json", DbValue::Json),
            TypeCategory::Uuid => decode_typed::<uuid::Uuid>(row, idx, "uuid", DbValue::Uuid),
            TypeCategory::Date => decode_typed::<NaiveDate>(row, idx, "date", DbValue::Date),
            TypeCategory::Time => decode_typed::<NaiveTime>(row, idx, "time", DbValue::Time),
            TypeCategory::Timestamp => {
                decode_typed::<NaiveDateTime>(row, idx, "timestamp", DbValue::Timestamp)
            }
            TypeCategory::TimestampTz => {
                decode_typed::<DateTime<Utc>>(row, idx, "timestamptz", DbValue::TimestampTz)
            }
            _ => decode_typed::<String>(row, idx, "text", DbValue::Text),
        }
    }

    fn decode_typed<T>(
        row: &PgRow,
        idx: usize,
        kind: &str,
        wrap: fn(T) -> DbValue,
    ) -> DbResult<DbValue>
    where
        T: for<'r> Decode<'r, sqlx::Postgres> + Type<sqlx::Postgres>,
    {
        row.try_get::<Option<T>, _>(idx)
            .map(|v| v.map_or(DbValue::Null, wrap))
            .map_err(|e| decode_failed(idx, kind, e))
    }

    fn decode_integer(row: &PgRow, idx: usize) -> DbResult<DbValue> {
        first_int!(row, idx, i16, i32);
        decode_typed::<i64>(row, idx, "integer", DbValue::Int)
    }

    fn decode_float(row: &PgRow, idx: usize) -> DbResult<DbValue> {
        match row.try_get::<Option<f64>, _>(idx) {
            Ok(v) => Ok(v.map_or(DbValue::Null, DbValue::Float)),
            Err(_) => decode_typed::<f32>(row, idx, "float4", |v| DbValue::Float(f64::from(v))),
        }
    }
}

mod sqlite {
    use super::*;

    /// Storage class of the value actually held by a SQLite cell.
    enum Storage {
        Null,
        Integer,
        Real,
        Text,
        Blob,
    }

    fn storage(row: &SqliteRow, idx: usize) -> DbResult<Storage> {
        let raw = row
            .try_get_raw(idx)
            .map_err(|e| decode_failed(idx, "value", e))?;
        if raw.is_null() {
            return Ok(Storage::Null);
        }
        Ok(match raw.type_info().name() {
            "INTEGER" | "BOOLEAN" => Storage::Integer,
            "REAL" | "NUMERIC" => Storage::Real,
            "BLOB" => Storage::Blob,
            _ => Storage::Text,
        })
    }

    fn typed<T>(row: &SqliteRow, idx: usize, kind: &str) -> DbResult<T>
    where
        T: for<'r> Decode<'r, sqlx::Sqlite> + Type<sqlx::Sqlite>,
    {
        row.try_get::<T, _>(idx)
            .map_err(|e| decode_failed(idx, kind, e))
    }

    /// SQLite columns are dynamically typed, so the declared category only
    /// refines what the stored value already is.
    pub fn decode_column(
        row: &SqliteRow,
        idx: usize,
        type_name: &str,
        category: TypeCategory,
    ) -> DbResult<DbValue> {
        Ok(match storage(row, idx)? {
            Storage::Null => DbValue::Null,
            Storage::Integer if category == TypeCategory::Boolean => {
                DbValue::Bool(typed::<i64>(row, idx, "bool")? != 0)
            }
            Storage::Integer => DbValue::Int(typed(row, idx, "integer")?),
            Storage::Real => DbValue::Float(typed(row, idx, "real")?),
            Storage::Blob => DbValue::Bytes(typed(row, idx, "blob")?),
            Storage::Text => {
                let text: String = typed(row, idx, "text")?;
                match category {
                    TypeCategory::Decimal => DbValue::Decimal(text),
                    _ if type_name.to_lowercase().contains("json") => {
                        serde_json::from_str::<JsonValue>(&text)
                            .map(DbValue::Json)
                            .unwrap_or(DbValue::Text(text))
                    }
                    _ => DbValue::Text(text),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categorize_type() {
        use DatabaseType::{MySQL, PostgreSQL, SQLite};
        let cases = [
            ("INT", MySQL, TypeCategory::Integer),
            ("BIGSERIAL", PostgreSQL, TypeCategory::Integer),
            ("TINYINT UNSIGNED", MySQL, TypeCategory::Integer),
            ("DECIMAL(10,2)", MySQL, TypeCategory::Decimal),
            ("NUMERIC", PostgreSQL, TypeCategory::Decimal),
            ("NUMERIC", SQLite, TypeCategory::Float),
            ("FLOAT8", PostgreSQL, TypeCategory::Float),
            ("DOUBLE", MySQL, TypeCategory::Float),
            ("timestamp with time zone", PostgreSQL, TypeCategory::TimestampTz),
            ("DATETIME", MySQL, TypeCategory::Timestamp),
            ("DATE", SQLite, TypeCategory::Date),
            ("TIME", PostgreSQL, TypeCategory::Time),
            ("INTERVAL", PostgreSQL, TypeCategory::Unknown),
            ("POINT", PostgreSQL, TypeCategory::Unknown),
            ("jsonb", PostgreSQL, TypeCategory::Json),
            ("UUID", PostgreSQL, TypeCategory::Uuid),
            ("LONGBLOB", MySQL, TypeCategory::Binary),
            ("VARBINARY", MySQL, TypeCategory::Binary),
            ("BPCHAR", PostgreSQL, TypeCategory::Text),
            ("BOOLEAN", SQLite, TypeCategory::Boolean),
            ("GEOMETRY", MySQL, TypeCategory::Unknown),
        ];
        for (name, db, expected) in cases {
            assert_eq!(categorize_type(name, db), expected, "{name} on {db}");
        }
    }

    fn numeric_bytes(weight: i16, sign: u16, dscale: u16, digits: &[u16]) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(digits.len() as u16).to_be_bytes());
        bytes.extend_from_slice(&weight.to_be_bytes());
        bytes.extend_from_slice(&sign.to_be_bytes());
        bytes.extend_from_slice(&dscale.to_be_bytes());
        for digit in digits {
            bytes.extend_from_slice(&digit.to_be_bytes());
        }
        bytes
    }

    #[test]
    fn test_binary_numeric_rendering() {
        let value = numeric_bytes(1, 0, 3, &[1, 2345, 6780]);
        assert_eq!(numeric_to_string(&value).unwrap(), "12345.678");

        let value = numeric_bytes(-1, 0x4000, 2, &[500]);
        assert_eq!(numeric_to_string(&value).unwrap(), "-0.05");

        let value = numeric_bytes(1, 0, 0, &[42]);
        assert_eq!(numeric_to_string(&value).unwrap(), "420000");

        let value = numeric_bytes(0, 0xC000, 0, &[]);
        assert_eq!(numeric_to_string(&value).unwrap(), "NaN");

        assert!(numeric_to_string(&[0, 1]).is_err());
    }

    #[test]
    fn test_set_builder_empty_finish() {
        let mut builder = SetBuilder::default();
        assert!(!builder.has_rows());
        let set = builder.finish();
        assert!(set.is_empty());
        assert!(set.columns.is_empty());
    }
}
