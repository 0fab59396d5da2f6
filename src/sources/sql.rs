//! SQL engine sources backed by the sqlx connectors.
//!
//! One source type serves all three bundled engines; the parameter type
//! decides which engine a request targets. A source may hold several named
//! connectors of its engine and picks one per request from
//! `Request::connection_id`, falling back to the first one registered.

use crate::db::{
    ConnectionManager, ConnectionPool, Connector, QueryExecutor, TransactionContext, Verb,
};
use crate::error::{DbError, DbResult};
use crate::models::{DatabaseType, IsolationLevel, QueryResult, Request};
use crate::sources::{DataParams, DataSource, NamedSource};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Parameter types that target a SQL engine.
pub trait SqlParams: DataParams + Sized {
    const ENGINE: DatabaseType;
    const SOURCE_NAME: &'static str;

    fn from_request(request: Request) -> Self;
}

macro_rules! sql_params {
    ($(#[$meta:meta])* $name:ident, $engine:expr, $source:literal) => {
        $(#[$meta])*
        #[derive(Debug, Default)]
        pub struct $name {
            pub request: Request,
        }

        impl $name {
            pub fn new(query: impl Into<String>) -> Self {
                Self {
                    request: Request::new(query),
                }
            }
        }

        crate::impl_params!($name);

        impl SqlParams for $name {
            const ENGINE: DatabaseType = $engine;
            const SOURCE_NAME: &'static str = $source;

            fn from_request(request: Request) -> Self {
                Self { request }
            }
        }
    };
}

sql_params!(
    /// Request routed to a PostgreSQL connection.
    PostgresParams,
    DatabaseType::PostgreSQL,
    "Postgres"
);
sql_params!(
    /// Request routed to a MySQL or MariaDB connection.
    MySqlParams,
    DatabaseType::MySQL,
    "MySql"
);
sql_params!(
    /// Request routed to a SQLite connection.
    SqliteParams,
    DatabaseType::SQLite,
    "Sqlite"
);

/// A data source running requests against connectors of one engine.
pub struct SqlSource<P> {
    executor: QueryExecutor,
    connectors: BTreeMap<String, Arc<dyn Connector>>,
    default_id: Option<String>,
    _params: PhantomData<fn() -> P>,
}

impl<P> std::fmt::Debug for SqlSource<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlSource")
            .field("connectors", &self.connectors.keys().collect::<Vec<_>>())
            .field("default_id", &self.default_id)
            .finish_non_exhaustive()
    }
}

impl<P: SqlParams> SqlSource<P> {
    pub fn new(executor: QueryExecutor) -> Self {
        Self {
            executor,
            connectors: BTreeMap::new(),
            default_id: None,
            _params: PhantomData,
        }
    }

    /// Add a named connector. The first one added becomes the default.
    pub fn with_connector(mut self, id: impl Into<String>, connector: Arc<dyn Connector>) -> Self {
        let id = id.into();
        if self.default_id.is_none() {
            self.default_id = Some(id.clone());
        }
        self.connectors.insert(id, connector);
        self
    }

    /// Build a source over every managed connection of this engine.
    ///
    /// Connections are added in id order, so the default is the smallest id.
    pub async fn from_manager(manager: &ConnectionManager, executor: QueryExecutor) -> DbResult<Self> {
        let mut source = Self::new(executor);
        for id in manager.list_connections().await {
            let connector = manager.connector(&id).await?;
            if connector.db_type() != P::ENGINE {
                continue;
            }
            debug!(source = P::SOURCE_NAME, connection_id = %id, "Adding connector");
            source = source.with_connector(id, connector);
        }
        Ok(source)
    }

    /// Put every connector behind a bounded lease pool of `max_size`.
    pub fn pooled(mut self, max_size: usize) -> DbResult<Self> {
        for connector in self.connectors.values_mut() {
            let pool = ConnectionPool::new(Arc::clone(connector), max_size)?;
            *connector = Arc::new(pool);
        }
        Ok(self)
    }

    pub fn connection_ids(&self) -> Vec<&str> {
        self.connectors.keys().map(String::as_str).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }

    fn downcast<'a>(&self, params: &'a dyn DataParams) -> DbResult<&'a P> {
        params.as_any().downcast_ref::<P>().ok_or_else(|| {
            DbError::invalid_argument(format!(
                "{} source cannot run parameters of type {}",
                P::SOURCE_NAME,
                params.type_key()
            ))
        })
    }

    fn connector_for(&self, request: &Request) -> DbResult<&Arc<dyn Connector>> {
        let id = request
            .connection_id
            .as_deref()
            .or(self.default_id.as_deref())
            .ok_or_else(|| {
                DbError::connection(
                    format!("No {} connection is configured", P::ENGINE),
                    "Add a connection with --database id=url",
                )
            })?;
        self.connectors.get(id).ok_or_else(|| {
            DbError::connection(
                format!("Connection '{}' not found for {}", id, P::ENGINE),
                format!("Available: {}", self.connection_ids().join(", ")),
            )
        })
    }
}

impl<P: SqlParams> NamedSource for SqlSource<P> {
    const NAME: &'static str = P::SOURCE_NAME;
}

#[async_trait]
impl<P: SqlParams> DataSource for SqlSource<P> {
    fn name(&self) -> &str {
        P::SOURCE_NAME
    }

    async fn execute(
        &self,
        params: &dyn DataParams,
        verb: Verb<'_>,
        cancel: &CancellationToken,
    ) -> DbResult<QueryResult> {
        let request = self.downcast(params)?.request();
        let connector = self.connector_for(request)?;
        self.executor
            .run(connector.as_ref(), request, verb, cancel)
            .await
    }

    async fn begin_transaction(
        &self,
        params: &dyn DataParams,
        isolation: Option<IsolationLevel>,
        cancel: &CancellationToken,
    ) -> DbResult<TransactionContext> {
        let request = self.downcast(params)?.request();
        let connector = Arc::clone(self.connector_for(request)?);
        TransactionContext::begin_with_cancel(connector, self.executor.clone(), isolation, cancel)
            .await
    }
}
