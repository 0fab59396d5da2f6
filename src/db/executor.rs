//! Query execution engine.
//!
//! The executor runs one of four verbs against a connection:
//! - `Reader`: drain every result set and collapse them into row mappings
//! - `Typed`: drain every result set and materialize records
//! - `Scalar`: first column of the first row of the first set
//! - `NonQuery`: engine-reported affected-row count
//!
//! One-shot calls open a connection per call and always release it.
//! Transactions run verbs on a connection they own through [`QueryExecutor::run_on`].
//! The executor never retries; engine failures propagate unchanged.

use crate::db::connection::{Command, Connection, Connector};
use crate::error::{DbError, DbResult};
use crate::mapping::{RowShape, collapse_rows, first_scalar};
use crate::models::{QueryResult, Request};
use std::future::Future;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// One of the four execution verbs.
#[derive(Clone, Copy)]
pub enum Verb<'a> {
    Reader,
    Typed(&'a dyn RowShape),
    Scalar,
    NonQuery,
}

impl Verb<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            Verb::Reader => "reader",
            Verb::Typed(_) => "typed reader",
            Verb::Scalar => "scalar",
            Verb::NonQuery => "non-query",
        }
    }
}

impl std::fmt::Debug for Verb<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verb::Typed(shape) => write!(f, "Typed({})", shape.type_name()),
            other => f.write_str(other.name()),
        }
    }
}

/// Query executor that handles command execution and result shaping.
#[derive(Debug, Clone, Default)]
pub struct QueryExecutor {
    /// Applied when a command carries no timeout of its own
    default_timeout: Option<Duration>,
}

impl QueryExecutor {
    /// Create a new query executor without a default timeout.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a query executor with a default per-command timeout.
    pub fn with_default_timeout(timeout: Duration) -> Self {
        Self {
            default_timeout: Some(timeout),
        }
    }

    /// Run a verb on a fresh connection from `connector`.
    ///
    /// The connection is scoped to this call and released on every path.
    pub async fn run(
        &self,
        connector: &dyn Connector,
        request: &Request,
        verb: Verb<'_>,
        cancel: &CancellationToken,
    ) -> DbResult<QueryResult> {
        let command = connector.build_command(request)?;
        let mut conn = guarded("open connection", None, cancel, connector.open()).await?;

        let result = self.run_on(conn.as_mut(), &command, verb, cancel).await;

        if let Err(e) = conn.close().await {
            warn!(connector = connector.name(), error = %e, "Failed to release connection");
        }
        result
    }

    /// Run a verb on a connection owned by the caller.
    pub async fn run_on(
        &self,
        conn: &mut dyn Connection,
        command: &Command,
        verb: Verb<'_>,
        cancel: &CancellationToken,
    ) -> DbResult<QueryResult> {
        let start = Instant::now();
        let limit = command.timeout.or(self.default_timeout);

        debug!(
            sql = %command.text,
            verb = verb.name(),
            params = command.params.len(),
            timeout_ms = ?limit.map(|t| t.as_millis()),
            "Executing command"
        );

        let outcome = match verb {
            Verb::NonQuery => guarded(verb.name(), limit, cancel, conn.execute(command))
                .await
                .map(QueryResult::Affected),
            Verb::Reader => guarded(verb.name(), limit, cancel, conn.query(command))
                .await
                .map(collapse_rows),
            Verb::Scalar => guarded(verb.name(), limit, cancel, conn.query(command))
                .await
                .map(|sets| QueryResult::Scalar(first_scalar(&sets))),
            Verb::Typed(shape) => {
                match guarded(verb.name(), limit, cancel, conn.query(command)).await {
                    Ok(sets) => shape.materialize(sets),
                    Err(e) => Err(e),
                }
            }
        };

        if let Err(e) = &outcome {
            // An abandoned command leaves the wire state unknown
            if matches!(e, DbError::Timeout { .. } | DbError::Cancelled { .. }) {
                conn.mark_broken();
            }
            debug!(verb = verb.name(), error = %e, "Command failed");
        } else {
            debug!(
                verb = verb.name(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Command completed"
            );
        }
        outcome
    }
}

/// Await `fut` under an optional timeout and a cancellation token.
pub(crate) async fn guarded<T, F>(
    operation: &str,
    limit: Option<Duration>,
    cancel: &CancellationToken,
    fut: F,
) -> DbResult<T>
where
    F: Future<Output = DbResult<T>>,
{
    if cancel.is_cancelled() {
        return Err(DbError::cancelled(operation));
    }

    let bounded = async {
        match limit {
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(result) => result,
                Err(_) => Err(DbError::timeout(operation, limit.as_millis() as u64)),
            },
            None => fut.await,
        }
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(DbError::cancelled(operation)),
        result = bounded => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::mock::MockConnector;
    use crate::mapping::Shape;
    use crate::models::{Column, DbValue, Materialized, ResultSet};
    use std::sync::atomic::Ordering;

    #[derive(Debug, Default, PartialEq)]
    struct Item {
        id: i64,
    }

    crate::impl_record!(Item { id: i64 });

    fn ids(values: &[i64]) -> ResultSet {
        ResultSet::new(
            vec![Column::new("id", "INTEGER")],
            values.iter().map(|v| vec![DbValue::Int(*v)]).collect(),
        )
    }

    #[tokio::test]
    async fn test_reader_releases_connection() {
        let connector = MockConnector::with_sets(vec![ids(&[1, 2])]);
        let executor = QueryExecutor::new();
        let result = executor
            .run(
                &connector,
                &Request::new("SELECT id FROM t"),
                Verb::Reader,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(result.as_rows().map(|r| r.len()), Some(2));
        assert_eq!(connector.state.opened.load(Ordering::SeqCst), 1);
        assert_eq!(connector.state.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_scalar_and_typed() {
        let connector = MockConnector::with_sets(vec![ids(&[42])]);
        let executor = QueryExecutor::new();
        let cancel = CancellationToken::new();
        let request = Request::new("SELECT id FROM t");

        let scalar = executor
            .run(&connector, &request, Verb::Scalar, &cancel)
            .await
            .unwrap();
        assert_eq!(scalar.as_scalar(), Some(&DbValue::Int(42)));

        let shape = Shape::<Item>::new();
        let typed = executor
            .run(&connector, &request, Verb::Typed(&shape), &cancel)
            .await
            .unwrap();
        assert_eq!(
            typed.as_typed::<Item>(),
            Some(&Materialized::One(Item { id: 42 }))
        );
    }

    #[tokio::test]
    async fn test_non_query_reports_affected() {
        let connector = MockConnector::with_affected(3);
        let result = QueryExecutor::new()
            .run(
                &connector,
                &Request::new("DELETE FROM t"),
                Verb::NonQuery,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(matches!(result, QueryResult::Affected(3)));
    }

    #[tokio::test]
    async fn test_engine_failure_still_releases() {
        let connector = MockConnector::failing();
        let err = QueryExecutor::new()
            .run(
                &connector,
                &Request::new("SELECT 1"),
                Verb::Reader,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Database { .. }));
        assert_eq!(connector.state.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_marks_connection_broken() {
        let connector = MockConnector::with_sets(vec![ids(&[1])]).delayed(Duration::from_secs(5));
        let request = Request::new("SELECT id FROM t").with_timeout(Duration::from_millis(20));
        let err = QueryExecutor::new()
            .run(&connector, &request, Verb::Reader, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Timeout { .. }));
        assert_eq!(connector.state.discarded.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_token_aborts() {
        let connector = MockConnector::with_sets(vec![ids(&[1])]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = QueryExecutor::new()
            .run(&connector, &Request::new("SELECT 1"), Verb::Reader, &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(connector.state.opened.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_default_timeout_applies() {
        let connector = MockConnector::with_sets(vec![ids(&[1])]).delayed(Duration::from_secs(5));
        let err = QueryExecutor::with_default_timeout(Duration::from_millis(20))
            .run(
                &connector,
                &Request::new("SELECT 1"),
                Verb::Scalar,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Timeout { .. }));
    }
}
