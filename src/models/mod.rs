//! Data models for the data-access layer.
//!
//! This module re-exports all model types used throughout the crate.

pub mod connection;
pub mod request;
pub mod value;

// Re-export commonly used types
pub use connection::{ConnectionConfig, ConnectionConfigError, ConnectionInfo, DatabaseType};
pub use request::{
    Column, CommandKind, IsolationLevel, Materialized, QueryResult, Request, ResultSet, Row,
    TypedResult,
};
pub use value::{BindParam, DbType, DbValue, Direction};
