//! Data sources and the parameter types that select them.
//!
//! Every request is carried by a parameters object implementing
//! [`DataParams`]. Its [`TypeKey`] picks the [`DataSource`] that runs it; see
//! [`factory`] for how keys are resolved.

pub mod factory;
pub mod json_file;
pub mod sql;
pub mod static_content;

use crate::db::{TransactionContext, Verb};
use crate::error::{DbError, DbResult};
use crate::mapping::{collapse_rows, first_scalar};
use crate::models::{IsolationLevel, QueryResult, Request, ResultSet};
use async_trait::async_trait;
use std::any::Any;
use tokio_util::sync::CancellationToken;

pub use factory::{DataSourceFactory, ServiceProvider, SourceCatalog};
pub use json_file::{JsonFileParams, JsonFileSource};
pub use sql::{MySqlParams, PostgresParams, SqlParams, SqlSource, SqliteParams};
pub use static_content::{StaticParams, StaticSource};

/// Registry identity of a parameters type.
///
/// `exact` names the concrete type. Generic types also carry their
/// unparameterized `definition` name so one mapping covers every instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeKey {
    pub exact: &'static str,
    pub definition: Option<&'static str>,
}

impl TypeKey {
    pub const fn exact(name: &'static str) -> Self {
        Self {
            exact: name,
            definition: None,
        }
    }

    pub const fn generic(exact: &'static str, definition: &'static str) -> Self {
        Self {
            exact,
            definition: Some(definition),
        }
    }

    /// Bare type name: no module path, no generic arguments.
    pub fn short_name(&self) -> &'static str {
        let name = self.definition.unwrap_or(self.exact);
        let name = name.split('<').next().unwrap_or(name);
        name.rsplit("::").next().unwrap_or(name)
    }
}

impl std::fmt::Display for TypeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.exact)
    }
}

/// A request envelope that selects its source by type.
pub trait DataParams: Send + Sync + 'static {
    /// Key of the implementing type.
    fn static_key() -> TypeKey
    where
        Self: Sized;

    /// Key of this instance's runtime type.
    fn type_key(&self) -> TypeKey;

    fn request(&self) -> &Request;

    fn request_mut(&mut self) -> &mut Request;

    fn as_any(&self) -> &dyn Any;

    /// Rows carried by the parameters themselves, for in-memory sources.
    fn inline_content(&self) -> Option<DbResult<ResultSet>> {
        None
    }
}

/// A source name the factory can map parameter types to.
pub trait NamedSource {
    const NAME: &'static str;
}

/// An implementation of the execution verbs for one kind of backend.
#[async_trait]
pub trait DataSource: Send + Sync {
    fn name(&self) -> &str;

    /// Run one verb. Parameters of the wrong type are an `InvalidArgument`.
    async fn execute(
        &self,
        params: &dyn DataParams,
        verb: Verb<'_>,
        cancel: &CancellationToken,
    ) -> DbResult<QueryResult>;

    async fn begin_transaction(
        &self,
        params: &dyn DataParams,
        isolation: Option<IsolationLevel>,
        cancel: &CancellationToken,
    ) -> DbResult<TransactionContext>;
}

/// Shape in-memory result sets for a read verb.
///
/// In-memory sources have nothing to write to, so `NonQuery` is rejected.
pub(crate) fn shape_sets(
    source: &str,
    sets: Vec<ResultSet>,
    verb: Verb<'_>,
) -> DbResult<QueryResult> {
    match verb {
        Verb::Reader => Ok(collapse_rows(sets)),
        Verb::Scalar => Ok(QueryResult::Scalar(first_scalar(&sets))),
        Verb::Typed(shape) => shape.materialize(sets),
        Verb::NonQuery => Err(DbError::invalid_operation(format!(
            "{source} source is read-only"
        ))),
    }
}

/// Implement [`DataParams`](crate::sources::DataParams) for a struct with a
/// `request: Request` field, keyed by its type name.
#[macro_export]
macro_rules! impl_params {
    ($ty:ident) => {
        impl $crate::sources::DataParams for $ty {
            fn static_key() -> $crate::sources::TypeKey {
                $crate::sources::TypeKey::exact(stringify!($ty))
            }

            fn type_key(&self) -> $crate::sources::TypeKey {
                <Self as $crate::sources::DataParams>::static_key()
            }

            fn request(&self) -> &$crate::models::Request {
                &self.request
            }

            fn request_mut(&mut self) -> &mut $crate::models::Request {
                &mut self.request
            }

            fn as_any(&self) -> &dyn ::std::any::Any {
                self
            }
        }
    };
}
