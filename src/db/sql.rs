//! sqlx-backed connector and connection.
//!
//! A [`SqlConnector`] leases connections from a registered [`DbPool`]. Commands
//! without input parameters are sent as raw text so multi-statement scripts
//! produce one result set per statement; parameterized commands are prepared
//! and bound per engine.

use crate::db::connection::{Command, Connection, Connector};
use crate::db::params::{bind_mysql_param, bind_postgres_param, bind_sqlite_param};
use crate::db::pool::DbPool;
use crate::db::types::{DecodeRow, SetBuilder};
use crate::error::{DbError, DbResult};
use crate::models::{CommandKind, DatabaseType, IsolationLevel, Request, ResultSet};
use async_trait::async_trait;
use futures_util::TryStreamExt;
use futures_util::stream::BoxStream;
use sqlx::mysql::MySqlQueryResult;
use sqlx::pool::PoolConnection;
use sqlx::postgres::PgQueryResult;
use sqlx::sqlite::SqliteQueryResult;
use sqlx::{Either, Executor, MySql, Postgres, Sqlite};
use tracing::{debug, warn};

/// Completion record of one statement.
trait Completion {
    fn affected(&self) -> u64;
}

impl Completion for MySqlQueryResult {
    fn affected(&self) -> u64 {
        self.rows_affected()
    }
}

impl Completion for PgQueryResult {
    fn affected(&self) -> u64 {
        self.rows_affected()
    }
}

impl Completion for SqliteQueryResult {
    fn affected(&self) -> u64 {
        self.rows_affected()
    }
}

/// What a statement hands back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shape {
    Rows,
    Count,
}

/// Leading keywords of statements that return a row set, possibly empty.
const ROW_KEYWORDS: &[&str] = &[
    "SELECT", "WITH", "VALUES", "TABLE", "SHOW", "PRAGMA", "EXPLAIN", "DESCRIBE", "DESC",
];

/// Keywords whose statement may complete more than once.
const MULTI_RESULT_KEYWORDS: &[&str] = &["CALL", "EXEC", "EXECUTE"];

/// Split a script into statements and return the upper-cased words of
/// each, skipping string literals, quoted identifiers and comments.
fn statement_words(sql: &str) -> Vec<Vec<String>> {
    let mut statements = Vec::new();
    let mut words: Vec<String> = Vec::new();
    let mut word = String::new();
    let mut chars = sql.chars().peekable();

    while let Some(c) = chars.next() {
        if c.is_alphanumeric() || c == '_' {
            word.push(c.to_ascii_uppercase());
            continue;
        }
        if !word.is_empty() {
            words.push(std::mem::take(&mut word));
        }
        match c {
            '\'' | '"' | '`' => {
                for n in chars.by_ref() {
                    if n == c {
                        break;
                    }
                }
            }
            '-' if chars.peek() == Some(&'-') => {
                for n in chars.by_ref() {
                    if n == '\n' {
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = ' ';
                for n in chars.by_ref() {
                    if prev == '*' && n == '/' {
                        break;
                    }
                    prev = n;
                }
            }
            '$' => {
                // $tag$ ... $tag$ quoting; positional parameters ($1) fall through
                let mut tag = String::new();
                while let Some(&n) = chars.peek() {
                    if n.is_alphanumeric() || n == '_' {
                        tag.push(n);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if chars.peek() == Some(&'$') && !tag.starts_with(|d: char| d.is_ascii_digit()) {
                    chars.next();
                    let close = format!("${tag}$");
                    let mut body = String::new();
                    for n in chars.by_ref() {
                        body.push(n);
                        if body.ends_with(&close) {
                            break;
                        }
                    }
                }
            }
            ';' if !words.is_empty() => statements.push(std::mem::take(&mut words)),
            _ => {}
        }
    }
    if !word.is_empty() {
        words.push(word);
    }
    if !words.is_empty() {
        statements.push(words);
    }
    statements
}

/// Shapes of the statements in a script, or `None` when one of them may
/// complete a varying number of times.
fn statement_shapes(sql: &str) -> Option<Vec<Shape>> {
    statement_words(sql)
        .iter()
        .map(|words| {
            let first = words.first().map(String::as_str).unwrap_or_default();
            if MULTI_RESULT_KEYWORDS.contains(&first) {
                None
            } else if ROW_KEYWORDS.contains(&first) || words.iter().any(|w| w == "RETURNING") {
                Some(Shape::Rows)
            } else {
                Some(Shape::Count)
            }
        })
        .collect()
}

/// Drain a statement stream into result sets.
///
/// A statement boundary closes the current set. Row-returning statements
/// always produce a set, empty or not; the others produce none. Without
/// known shapes a boundary with no rows counts as a set only when it
/// reports no affected rows. A command that produced nothing still yields
/// one empty set.
async fn drain_sets<Q, R>(
    mut stream: BoxStream<'_, Result<Either<Q, R>, sqlx::Error>>,
    shapes: Option<Vec<Shape>>,
) -> DbResult<Vec<ResultSet>>
where
    Q: Completion,
    R: DecodeRow,
{
    let mut sets = Vec::new();
    let mut current = SetBuilder::default();
    let mut statement = 0;

    while let Some(item) = stream.try_next().await? {
        match item {
            Either::Right(row) => current.push(&row)?,
            Either::Left(done) => {
                let returns_rows = match shapes.as_deref().and_then(|s| s.get(statement)) {
                    Some(shape) => *shape == Shape::Rows,
                    None => done.affected() == 0,
                };
                statement += 1;
                if current.has_rows() || returns_rows {
                    sets.push(current.finish());
                }
            }
        }
    }
    if current.has_rows() {
        sets.push(current.finish());
    }
    if sets.is_empty() {
        sets.push(ResultSet::default());
    }

    Ok(sets)
}

macro_rules! run_query {
    ($conn:expr, $command:expr, $bind:path) => {{
        let conn = &mut **$conn;
        let shapes = statement_shapes(&$command.text);
        let stream = if $command.input_params().next().is_none() {
            conn.fetch_many($command.text.as_str())
        } else {
            let mut query = sqlx::query(&$command.text);
            for param in $command.input_params() {
                query = $bind(query, param);
            }
            conn.fetch_many(query)
        };
        drain_sets(stream, shapes).await
    }};
}

macro_rules! run_execute {
    ($conn:expr, $command:expr, $bind:path) => {{
        let conn = &mut **$conn;
        let done = if $command.input_params().next().is_none() {
            conn.execute($command.text.as_str()).await
        } else {
            let mut query = sqlx::query(&$command.text);
            for param in $command.input_params() {
                query = $bind(query, param);
            }
            conn.execute(query).await
        };
        done.map(|d| d.rows_affected()).map_err(DbError::from)
    }};
}

/// Pooled connection of one engine.
enum PooledConn {
    MySql(PoolConnection<MySql>),
    Postgres(PoolConnection<Postgres>),
    SQLite(PoolConnection<Sqlite>),
}

impl PooledConn {
    async fn run_raw(&mut self, sql: &str) -> DbResult<()> {
        impl_db_dispatch!(PooledConn, self, {
            MySql(c) => (&mut **c).execute(sql).await.map(|_| ())?,
            Postgres(c) => (&mut **c).execute(sql).await.map(|_| ())?,
            SQLite(c) => (&mut **c).execute(sql).await.map(|_| ())?,
        });
        Ok(())
    }

    fn db_type(&self) -> DatabaseType {
        match self {
            PooledConn::MySql(_) => DatabaseType::MySQL,
            PooledConn::Postgres(_) => DatabaseType::PostgreSQL,
            PooledConn::SQLite(_) => DatabaseType::SQLite,
        }
    }

    async fn close(self) -> DbResult<()> {
        impl_db_dispatch!(PooledConn, self, {
            MySql(c) => c.close().await?,
            Postgres(c) => c.close().await?,
            SQLite(c) => c.close().await?,
        });
        Ok(())
    }
}

/// Opens connections from one registered pool.
#[derive(Debug, Clone)]
pub struct SqlConnector {
    id: String,
    pool: DbPool,
}

impl SqlConnector {
    pub fn new(id: impl Into<String>, pool: DbPool) -> Self {
        Self {
            id: id.into(),
            pool,
        }
    }

    pub fn db_type(&self) -> DatabaseType {
        self.pool.db_type()
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

/// Reject procedure names that are not plain, optionally schema-qualified identifiers.
fn validate_procedure_name(name: &str) -> DbResult<()> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && !name.ends_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
    if valid {
        Ok(())
    } else {
        Err(DbError::invalid_argument(format!(
            "Invalid stored procedure name: '{}'",
            name
        )))
    }
}

/// Build the call statement for a stored procedure.
pub fn procedure_call(db_type: DatabaseType, name: &str, inputs: usize) -> DbResult<String> {
    validate_procedure_name(name)?;
    match db_type {
        DatabaseType::MySQL => {
            let placeholders = vec!["?"; inputs].join(", ");
            Ok(format!("CALL {}({})", name, placeholders))
        }
        DatabaseType::PostgreSQL => {
            let placeholders = (1..=inputs)
                .map(|i| format!("${}", i))
                .collect::<Vec<_>>()
                .join(", ");
            Ok(format!("SELECT * FROM {}({})", name, placeholders))
        }
        DatabaseType::SQLite => Err(DbError::invalid_argument(
            "SQLite does not support stored procedures",
        )),
    }
}

#[async_trait]
impl Connector for SqlConnector {
    fn name(&self) -> &str {
        &self.id
    }

    async fn open(&self) -> DbResult<Box<dyn Connection>> {
        let conn = impl_db_dispatch!(DbPool, &self.pool, {
            MySql(p) => PooledConn::MySql(p.acquire().await?),
            Postgres(p) => PooledConn::Postgres(p.acquire().await?),
            SQLite(p) => PooledConn::SQLite(p.acquire().await?),
        });
        debug!(connection_id = %self.id, "Opened connection");
        Ok(Box::new(SqlConnection {
            conn: Some(conn),
            broken: false,
            connection_id: self.id.clone(),
        }))
    }

    fn build_command(&self, request: &Request) -> DbResult<Command> {
        let mut command = Command::from_request(request);
        if command.kind == CommandKind::StoredProcedure {
            for param in command.params.iter().filter(|p| !p.direction.is_input()) {
                debug!(
                    param = %param.name,
                    direction = ?param.direction,
                    "Output parameter is not bound"
                );
            }
            let inputs = command.input_params().count();
            command.text = procedure_call(self.db_type(), &request.query, inputs)?;
        }
        Ok(command)
    }
}

/// One leased engine connection.
pub struct SqlConnection {
    conn: Option<PooledConn>,
    broken: bool,
    connection_id: String,
}

impl std::fmt::Debug for SqlConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlConnection")
            .field("connection_id", &self.connection_id)
            .field("open", &self.conn.is_some())
            .field("broken", &self.broken)
            .finish()
    }
}

impl SqlConnection {
    fn live(&mut self) -> DbResult<&mut PooledConn> {
        self.conn
            .as_mut()
            .ok_or_else(|| DbError::object_disposed("connection"))
    }

    /// Record connection-level faults so the connection is not reused.
    fn track<T>(&mut self, result: DbResult<T>) -> DbResult<T> {
        if let Err(DbError::Connection { .. }) = &result {
            self.broken = true;
        }
        result
    }
}

#[async_trait]
impl Connection for SqlConnection {
    async fn query(&mut self, command: &Command) -> DbResult<Vec<ResultSet>> {
        debug!(connection_id = %self.connection_id, sql = %command.text, "Executing query");
        let result = match self.live()? {
            PooledConn::MySql(c) => run_query!(c, command, bind_mysql_param),
            PooledConn::Postgres(c) => run_query!(c, command, bind_postgres_param),
            PooledConn::SQLite(c) => run_query!(c, command, bind_sqlite_param),
        };
        self.track(result)
    }

    async fn execute(&mut self, command: &Command) -> DbResult<u64> {
        debug!(connection_id = %self.connection_id, sql = %command.text, "Executing statement");
        let result = match self.live()? {
            PooledConn::MySql(c) => run_execute!(c, command, bind_mysql_param),
            PooledConn::Postgres(c) => run_execute!(c, command, bind_postgres_param),
            PooledConn::SQLite(c) => run_execute!(c, command, bind_sqlite_param),
        };
        self.track(result)
    }

    async fn begin(&mut self, isolation: Option<IsolationLevel>) -> DbResult<()> {
        let conn = self.live()?;
        let result = match (conn.db_type(), isolation) {
            (DatabaseType::PostgreSQL, Some(level)) => {
                conn.run_raw(&format!("BEGIN ISOLATION LEVEL {}", level.as_sql()))
                    .await
            }
            (DatabaseType::MySQL, Some(level)) => {
                match conn
                    .run_raw(&format!("SET TRANSACTION ISOLATION LEVEL {}", level.as_sql()))
                    .await
                {
                    Ok(()) => conn.run_raw("START TRANSACTION").await,
                    Err(e) => Err(e),
                }
            }
            (DatabaseType::MySQL, None) => conn.run_raw("START TRANSACTION").await,
            (DatabaseType::SQLite, Some(level)) => {
                debug!(isolation = ?level, "SQLite ignores isolation levels");
                conn.run_raw("BEGIN").await
            }
            (_, None) => conn.run_raw("BEGIN").await,
        };
        self.track(result)
    }

    async fn commit(&mut self) -> DbResult<()> {
        let result = self.live()?.run_raw("COMMIT").await;
        self.track(result)
    }

    async fn rollback(&mut self) -> DbResult<()> {
        let result = self.live()?.run_raw("ROLLBACK").await;
        self.track(result)
    }

    async fn close(&mut self) -> DbResult<()> {
        let Some(conn) = self.conn.take() else {
            return Ok(());
        };
        if self.broken {
            warn!(connection_id = %self.connection_id, "Discarding broken connection");
            conn.close().await
        } else {
            // Dropping the pooled handle returns it to the pool
            drop(conn);
            Ok(())
        }
    }

    fn is_broken(&self) -> bool {
        self.broken
    }

    fn mark_broken(&mut self) {
        self.broken = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_procedure_call_mysql() {
        let sql = procedure_call(DatabaseType::MySQL, "shop.get_orders", 2).unwrap();
        assert_eq!(sql, "CALL shop.get_orders(?, ?)");
        let sql = procedure_call(DatabaseType::MySQL, "ping", 0).unwrap();
        assert_eq!(sql, "CALL ping()");
    }

    #[test]
    fn test_procedure_call_postgres() {
        let sql = procedure_call(DatabaseType::PostgreSQL, "get_orders", 3).unwrap();
        assert_eq!(sql, "SELECT * FROM get_orders($1, $2, $3)");
    }

    #[test]
    fn test_procedure_call_sqlite_rejected() {
        let err = procedure_call(DatabaseType::SQLite, "anything", 0).unwrap_err();
        assert!(matches!(err, DbError::InvalidArgument { .. }));
    }

    #[test]
    fn test_statement_shapes() {
        use Shape::{Count, Rows};
        let cases: &[(&str, Option<Vec<Shape>>)] = &[
            ("SELECT 1", Some(vec![Rows])),
            (
                "select 1 as a; INSERT INTO t VALUES (1),(2); SELECT x FROM t WHERE 0",
                Some(vec![Rows, Count, Rows]),
            ),
            ("UPDATE t SET x = 1 RETURNING x;", Some(vec![Rows])),
            ("  -- lead\n(SELECT 1); /* x; y */ DELETE FROM t;;", Some(vec![Rows, Count])),
            ("INSERT INTO t VALUES ('a;b', \"c;d\")", Some(vec![Count])),
            (
                "CREATE FUNCTION f() RETURNS int AS $body$ SELECT 1; $body$ LANGUAGE sql; SELECT $1",
                Some(vec![Count, Rows]),
            ),
            ("CALL refresh(); SELECT 1", None),
            ("", Some(vec![])),
        ];
        for (sql, expected) in cases {
            assert_eq!(&statement_shapes(sql), expected, "{sql}");
        }
    }

    #[test]
    fn test_procedure_name_validation() {
        for bad in ["", "drop table x", "a;b", ".x", "x.", "f()"] {
            assert!(
                procedure_call(DatabaseType::MySQL, bad, 0).is_err(),
                "{bad:?} should be rejected"
            );
        }
    }
}
