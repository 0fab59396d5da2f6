//! Parameter binding utilities for database queries.
//!
//! This module binds `BindParam` values to database-specific query objects.
//! Values are translated by their raw variant; the logical `DbType` tag and
//! declared size are informational for these engines.

use crate::models::{BindParam, DbValue};
use sqlx::mysql::MySqlArguments;
use sqlx::postgres::PgArguments;
use sqlx::sqlite::SqliteArguments;
use sqlx::types::Json;
use sqlx::{MySql, Postgres, Sqlite};

/// Bind a parameter to a MySQL query.
pub(crate) fn bind_mysql_param<'q>(
    query: sqlx::query::Query<'q, MySql, MySqlArguments>,
    param: &'q BindParam,
) -> sqlx::query::Query<'q, MySql, MySqlArguments> {
    match &param.value {
        DbValue::Null => query.bind(None::<String>),
        DbValue::Bool(v) => query.bind(*v),
        DbValue::Int(v) => query.bind(*v),
        DbValue::Float(v) => query.bind(*v),
        DbValue::Decimal(v) | DbValue::Text(v) => query.bind(v.as_str()),
        DbValue::Bytes(v) => query.bind(v.as_slice()),
        DbValue::Json(v) => query.bind(Json(v)),
        DbValue::Uuid(v) => query.bind(v.hyphenated().to_string()),
        DbValue::Timestamp(v) => query.bind(*v),
        DbValue::TimestampTz(v) => query.bind(*v),
        DbValue::Date(v) => query.bind(*v),
        DbValue::Time(v) => query.bind(*v),
    }
}

/// Bind a parameter to a PostgreSQL query.
///
/// Decimals are sent as text; the statement must cast them (`$1::numeric`).
pub(crate) fn bind_postgres_param<'q>(
    query: sqlx::query::Query<'q, Postgres, PgArguments>,
    param: &'q BindParam,
) -> sqlx::query::Query<'q, Postgres, PgArguments> {
    match &param.value {
        DbValue::Null => query.bind(None::<String>),
        DbValue::Bool(v) => query.bind(*v),
        DbValue::Int(v) => query.bind(*v),
        DbValue::Float(v) => query.bind(*v),
        DbValue::Decimal(v) | DbValue::Text(v) => query.bind(v.as_str()),
        DbValue::Bytes(v) => query.bind(v.as_slice()),
        DbValue::Json(v) => query.bind(Json(v)),
        DbValue::Uuid(v) => query.bind(*v),
        DbValue::Timestamp(v) => query.bind(*v),
        DbValue::TimestampTz(v) => query.bind(*v),
        DbValue::Date(v) => query.bind(*v),
        DbValue::Time(v) => query.bind(*v),
    }
}

/// Bind a parameter to a SQLite query.
pub(crate) fn bind_sqlite_param<'q>(
    query: sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>,
    param: &'q BindParam,
) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
    match &param.value {
        DbValue::Null => query.bind(None::<String>),
        DbValue::Bool(v) => query.bind(*v),
        DbValue::Int(v) => query.bind(*v),
        DbValue::Float(v) => query.bind(*v),
        DbValue::Decimal(v) | DbValue::Text(v) => query.bind(v.as_str()),
        DbValue::Bytes(v) => query.bind(v.as_slice()),
        // SQLite doesn't have native JSON or UUID types, store as text
        DbValue::Json(v) => query.bind(v.to_string()),
        DbValue::Uuid(v) => query.bind(v.hyphenated().to_string()),
        DbValue::Timestamp(v) => query.bind(*v),
        DbValue::TimestampTz(v) => query.bind(*v),
        DbValue::Date(v) => query.bind(*v),
        DbValue::Time(v) => query.bind(*v),
    }
}
