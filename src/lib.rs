//! db-access library
//!
//! A uniform async data-access layer: reader, typed reader, scalar and
//! non-query verbs plus transactions, over SQL engines (PostgreSQL, MySQL,
//! SQLite) and in-memory sources, selected by the type of a parameters object.

pub mod config;
pub mod db;
pub mod error;
pub mod mapping;
pub mod models;
pub mod provider;
pub mod resilience;
pub mod sources;

pub use config::Config;
pub use error::{DbError, DbResult};
pub use provider::DataProvider;
pub use sources::{DataParams, DataSource, DataSourceFactory, SourceCatalog};
