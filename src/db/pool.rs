//! Engine pool registry.
//!
//! Each registered connection owns one database-specific sqlx pool
//! (`MySqlPool`, `PgPool`, `SqlitePool`) and a [`SqlConnector`] over it that
//! sources share. Registrations are keyed by connection id.

use crate::db::sql::SqlConnector;
use crate::error::{DbError, DbResult};
use crate::models::{ConnectionConfig, ConnectionInfo, DatabaseType};
use sqlx::{
    Executor, MySqlPool, PgPool, SqlitePool, mysql::MySqlConnectOptions,
    mysql::MySqlPoolOptions, postgres::PgConnectOptions, postgres::PgPoolOptions,
    sqlite::SqliteConnectOptions, sqlite::SqlitePoolOptions,
};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Database-specific connection pool (avoids AnyPool limitations).
#[derive(Debug, Clone)]
pub enum DbPool {
    MySql(MySqlPool),
    Postgres(PgPool),
    SQLite(SqlitePool),
}

impl DbPool {
    pub async fn close(&self) {
        impl_db_dispatch!(DbPool, self, {
            MySql(pool) => pool.close().await,
            Postgres(pool) => pool.close().await,
            SQLite(pool) => pool.close().await,
        })
    }

    pub fn db_type(&self) -> DatabaseType {
        match self {
            DbPool::MySql(_) => DatabaseType::MySQL,
            DbPool::Postgres(_) => DatabaseType::PostgreSQL,
            DbPool::SQLite(_) => DatabaseType::SQLite,
        }
    }

    async fn server_version(&self) -> Result<String, sqlx::Error> {
        let sql = self.db_type().version_query();
        impl_db_dispatch!(DbPool, self, {
            MySql(p) => sqlx::query_scalar::<_, String>(sql).fetch_one(p).await,
            Postgres(p) => sqlx::query_scalar::<_, String>(sql).fetch_one(p).await,
            SQLite(p) => sqlx::query_scalar::<_, String>(sql).fetch_one(p).await,
        })
    }
}

#[derive(Debug)]
struct Registration {
    connector: Arc<SqlConnector>,
    config: ConnectionConfig,
    server_version: Option<String>,
}

impl Registration {
    fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            connection_id: self.config.id.clone(),
            database_type: self.config.db_type,
            server_version: self.server_version.clone(),
            writable: self.config.writable,
            database: self.config.database.clone(),
        }
    }
}

/// Registry of named engine connections.
#[derive(Debug, Clone, Default)]
pub struct ConnectionManager {
    entries: Arc<RwLock<HashMap<String, Arc<Registration>>>>,
}

fn not_found(connection_id: &str) -> DbError {
    DbError::connection(
        format!("Connection '{}' not found", connection_id),
        "Register the connection before using it",
    )
}

fn already_registered(connection_id: &str) -> DbError {
    DbError::connection(
        format!("Connection '{}' already exists", connection_id),
        "Disconnect first or use a different connection ID",
    )
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a pool for `config` and register it under its id.
    pub async fn connect(&self, config: ConnectionConfig) -> DbResult<ConnectionInfo> {
        if self.exists(&config.id).await {
            return Err(already_registered(&config.id));
        }

        info!(
            connection_id = %config.id,
            db_type = %config.db_type,
            url = %config.redacted_url(),
            writable = config.writable,
            "Connecting to database"
        );

        let pool = open_pool(&config).await?;
        let server_version = match pool.server_version().await {
            Ok(version) => Some(version),
            Err(e) => {
                warn!(connection_id = %config.id, error = %e, "Failed to read server version");
                None
            }
        };

        let registration = Arc::new(Registration {
            connector: Arc::new(SqlConnector::new(config.id.clone(), pool.clone())),
            config,
            server_version,
        });
        let id = registration.config.id.clone();

        // Another connect for the same id may have finished while the pool was opening
        let inserted = match self.entries.write().await.entry(id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&registration));
                true
            }
        };
        if !inserted {
            pool.close().await;
            return Err(already_registered(&id));
        }

        info!(
            connection_id = %id,
            server_version = ?registration.server_version,
            "Connected"
        );
        Ok(registration.info())
    }

    /// Close one connection and forget it.
    pub async fn disconnect(&self, connection_id: &str) -> DbResult<()> {
        let entry = self.entries.write().await.remove(connection_id);
        let entry = entry.ok_or_else(|| not_found(connection_id))?;
        info!(connection_id = %connection_id, "Closing connection");
        entry.connector.pool().close().await;
        Ok(())
    }

    async fn registration(&self, connection_id: &str) -> DbResult<Arc<Registration>> {
        self.entries
            .read()
            .await
            .get(connection_id)
            .cloned()
            .ok_or_else(|| not_found(connection_id))
    }

    pub async fn get_pool(&self, connection_id: &str) -> DbResult<DbPool> {
        Ok(self.registration(connection_id).await?.connector.pool().clone())
    }

    /// The shared connector over a registered connection's pool.
    pub async fn connector(&self, connection_id: &str) -> DbResult<Arc<SqlConnector>> {
        Ok(Arc::clone(&self.registration(connection_id).await?.connector))
    }

    pub async fn get_config(&self, connection_id: &str) -> DbResult<ConnectionConfig> {
        Ok(self.registration(connection_id).await?.config.clone())
    }

    pub async fn info(&self, connection_id: &str) -> DbResult<ConnectionInfo> {
        Ok(self.registration(connection_id).await?.info())
    }

    /// Registered ids in sorted order.
    pub async fn list_connections(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn exists(&self, connection_id: &str) -> bool {
        self.entries.read().await.contains_key(connection_id)
    }

    pub async fn connection_count(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Close every pool.
    ///
    /// Waits for checked-out engine connections to come back, so leases held
    /// elsewhere must be released first.
    pub async fn close_all(&self) {
        let drained: Vec<(String, Arc<Registration>)> =
            self.entries.write().await.drain().collect();
        for (id, entry) in drained {
            debug!(connection_id = %id, "Closing connection");
            entry.connector.pool().close().await;
        }
        info!("All connections closed");
    }
}

/// Apply the shared pool settings to an engine's pool options builder.
macro_rules! pool_settings {
    ($builder:expr, $config:expr) => {{
        let opts = &$config.pool_options;
        $builder
            .min_connections(opts.min_connections_or_default())
            .max_connections(
                opts.max_connections_or_default($config.db_type == DatabaseType::SQLite),
            )
            .acquire_timeout(Duration::from_secs(opts.acquire_timeout_or_default()))
            .idle_timeout(Some(Duration::from_secs(opts.idle_timeout_or_default())))
            .test_before_acquire(opts.test_before_acquire_or_default())
    }};
}

/// Open the engine pool for a registration.
///
/// Connections registered without `writable` get a read-only session on
/// every engine.
async fn open_pool(config: &ConnectionConfig) -> DbResult<DbPool> {
    let invalid_url = |e: sqlx::Error| {
        DbError::connection(
            format!("Invalid {} connection string: {}", config.db_type, e),
            format!("Check the connection URL format: {}", config.db_type.url_example()),
        )
    };
    let connect_failed = |e: sqlx::Error| {
        DbError::connection(
            format!("Failed to connect: {}", e),
            connection_suggestion(config.db_type, &e),
        )
    };

    match config.db_type {
        DatabaseType::MySQL => {
            let options = MySqlConnectOptions::from_str(&config.connection_string)
                .map_err(invalid_url)?
                .charset("utf8mb4");
            let mut builder = pool_settings!(MySqlPoolOptions::new(), config);
            if !config.writable {
                builder = builder.after_connect(|conn, _meta| {
                    Box::pin(async move {
                        conn.execute("SET SESSION TRANSACTION READ ONLY").await?;
                        Ok(())
                    })
                });
            }
            let pool = builder.connect_with(options).await.map_err(connect_failed)?;
            Ok(DbPool::MySql(pool))
        }
        DatabaseType::PostgreSQL => {
            let mut options =
                PgConnectOptions::from_str(&config.connection_string).map_err(invalid_url)?;
            if !config.writable {
                options = options.options([("default_transaction_read_only", "on")]);
            }
            let pool = pool_settings!(PgPoolOptions::new(), config)
                .connect_with(options)
                .await
                .map_err(connect_failed)?;
            Ok(DbPool::Postgres(pool))
        }
        DatabaseType::SQLite => {
            // A read-only registration never creates the file
            let options = SqliteConnectOptions::from_str(&config.connection_string)
                .map_err(invalid_url)?
                .create_if_missing(config.writable)
                .read_only(!config.writable);
            let pool = pool_settings!(SqlitePoolOptions::new(), config)
                .connect_with(options)
                .await
                .map_err(connect_failed)?;
            Ok(DbPool::SQLite(pool))
        }
    }
}

/// Error-text fragments and the hint each one earns.
const CONNECT_HINTS: &[(&[&str], &str)] = &[
    (
        &["connection refused"],
        "Check that the database server is running and reachable",
    ),
    (
        &["authentication", "password"],
        "Verify the username and password in the connection string",
    ),
    (
        &["does not exist", "unknown database", "unable to open database"],
        "Check that the database (or database file) exists",
    ),
    (
        &["tls", "ssl"],
        "Check TLS/SSL configuration or try disabling it",
    ),
];

fn connection_suggestion(db_type: DatabaseType, error: &sqlx::Error) -> String {
    let text = error.to_string().to_lowercase();
    CONNECT_HINTS
        .iter()
        .find(|(needles, _)| needles.iter().any(|n| text.contains(n)))
        .map(|(_, hint)| hint.to_string())
        .unwrap_or_else(|| {
            format!(
                "Verify the connection string format: {}",
                db_type.url_example()
            )
        })
}
