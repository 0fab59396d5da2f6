//! Database abstraction layer.
//!
//! This module provides database access functionality:
//! - Engine connection interfaces (`Connector`, `Connection`)
//! - sqlx pool management and the sqlx-backed connector
//! - Query execution and transactions
//! - A bounded connection pool over any connector
//! - Type mappings and parameter binding
//! - Database dispatch macros for reducing code duplication

pub mod connection;
pub mod executor;
pub mod lease_pool;
#[macro_use]
pub mod macros;
#[cfg(test)]
pub(crate) mod mock;
pub mod params;
pub mod pool;
pub mod sql;
pub mod transaction;
pub mod types;

pub use connection::{Command, Connection, Connector};
pub use executor::{QueryExecutor, Verb};
pub use lease_pool::{ConnectionPool, PoolStats, PooledLease};
pub use pool::{ConnectionManager, DbPool};
pub use sql::{SqlConnection, SqlConnector};
pub use transaction::{TransactionContext, TransactionState};
