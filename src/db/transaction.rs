//! Transaction context.
//!
//! A [`TransactionContext`] owns exactly one connection and one native
//! transaction on it. State moves `Active` to `Committed` or `RolledBack`;
//! both are terminal. Disposal is tracked separately and rolls back a
//! transaction that is still active.

use crate::db::connection::{Connection, Connector};
use crate::db::executor::{QueryExecutor, Verb, guarded};
use crate::error::{DbError, DbResult};
use crate::mapping::{Record, Shape};
use crate::models::{IsolationLevel, QueryResult, Request};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lifecycle state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committed,
    RolledBack,
}

pub struct TransactionContext {
    conn: Option<Box<dyn Connection>>,
    connector: Arc<dyn Connector>,
    executor: QueryExecutor,
    state: TransactionState,
    disposed: bool,
}

impl std::fmt::Debug for TransactionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionContext")
            .field("connector", &self.connector.name())
            .field("state", &self.state)
            .field("disposed", &self.disposed)
            .finish_non_exhaustive()
    }
}

impl TransactionContext {
    /// Open a connection and start a transaction on it.
    pub async fn begin(
        connector: Arc<dyn Connector>,
        executor: QueryExecutor,
        isolation: Option<IsolationLevel>,
    ) -> DbResult<Self> {
        Self::begin_with_cancel(connector, executor, isolation, &CancellationToken::new()).await
    }

    pub async fn begin_with_cancel(
        connector: Arc<dyn Connector>,
        executor: QueryExecutor,
        isolation: Option<IsolationLevel>,
        cancel: &CancellationToken,
    ) -> DbResult<Self> {
        let mut conn = guarded("open connection", None, cancel, connector.open()).await?;
        if let Err(e) = guarded("begin transaction", None, cancel, conn.begin(isolation)).await {
            if e.is_cancelled() {
                conn.mark_broken();
            }
            if let Err(close_err) = conn.close().await {
                warn!(error = %close_err, "Failed to release connection after begin failure");
            }
            return Err(e);
        }

        info!(connector = connector.name(), isolation = ?isolation, "Transaction started");
        Ok(Self {
            conn: Some(conn),
            connector,
            executor,
            state: TransactionState::Active,
            disposed: false,
        })
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    fn ensure_usable(&self) -> DbResult<()> {
        if self.disposed {
            return Err(DbError::object_disposed("TransactionContext"));
        }
        if self.state != TransactionState::Active {
            return Err(DbError::invalid_operation(format!(
                "Transaction is no longer active (state: {:?})",
                self.state
            )));
        }
        Ok(())
    }

    /// Run a verb inside the transaction and store its result on `request`.
    pub async fn run(
        &mut self,
        request: &mut Request,
        verb: Verb<'_>,
        cancel: &CancellationToken,
    ) -> DbResult<()> {
        self.ensure_usable()?;
        let command = self.connector.build_command(request)?;
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| DbError::object_disposed("TransactionContext"))?;
        let result = self
            .executor
            .run_on(conn.as_mut(), &command, verb, cancel)
            .await?;
        request.set_result(result);
        Ok(())
    }

    pub async fn execute_reader(&mut self, request: &mut Request) -> DbResult<()> {
        self.execute_reader_with_cancel(request, &CancellationToken::new())
            .await
    }

    pub async fn execute_reader_with_cancel(
        &mut self,
        request: &mut Request,
        cancel: &CancellationToken,
    ) -> DbResult<()> {
        self.run(request, Verb::Reader, cancel).await
    }

    pub async fn execute_reader_as<T: Record>(&mut self, request: &mut Request) -> DbResult<()> {
        self.execute_reader_as_with_cancel::<T>(request, &CancellationToken::new())
            .await
    }

    pub async fn execute_reader_as_with_cancel<T: Record>(
        &mut self,
        request: &mut Request,
        cancel: &CancellationToken,
    ) -> DbResult<()> {
        let shape = Shape::<T>::new();
        self.run(request, Verb::Typed(&shape), cancel).await
    }

    pub async fn execute_scalar(&mut self, request: &mut Request) -> DbResult<()> {
        self.execute_scalar_with_cancel(request, &CancellationToken::new())
            .await
    }

    pub async fn execute_scalar_with_cancel(
        &mut self,
        request: &mut Request,
        cancel: &CancellationToken,
    ) -> DbResult<()> {
        self.run(request, Verb::Scalar, cancel).await
    }

    pub async fn execute_non_query(&mut self, request: &mut Request) -> DbResult<()> {
        self.execute_non_query_with_cancel(request, &CancellationToken::new())
            .await
    }

    pub async fn execute_non_query_with_cancel(
        &mut self,
        request: &mut Request,
        cancel: &CancellationToken,
    ) -> DbResult<()> {
        self.run(request, Verb::NonQuery, cancel).await
    }

    /// Run a query and hand back its result directly.
    pub async fn query(
        &mut self,
        mut request: Request,
        verb: Verb<'_>,
        cancel: &CancellationToken,
    ) -> DbResult<QueryResult> {
        self.run(&mut request, verb, cancel).await?;
        request
            .take_result()
            .ok_or_else(|| DbError::internal("Verb completed without a result"))
    }

    pub async fn commit(&mut self) -> DbResult<()> {
        self.commit_with_cancel(&CancellationToken::new()).await
    }

    pub async fn commit_with_cancel(&mut self, cancel: &CancellationToken) -> DbResult<()> {
        self.finish(TransactionState::Committed, cancel).await
    }

    pub async fn rollback(&mut self) -> DbResult<()> {
        self.rollback_with_cancel(&CancellationToken::new()).await
    }

    pub async fn rollback_with_cancel(&mut self, cancel: &CancellationToken) -> DbResult<()> {
        self.finish(TransactionState::RolledBack, cancel).await
    }

    /// A cancelled commit or rollback leaves the transaction active on a
    /// connection that will not be reused.
    async fn finish(
        &mut self,
        target: TransactionState,
        cancel: &CancellationToken,
    ) -> DbResult<()> {
        if self.state != TransactionState::Active {
            return Err(DbError::invalid_operation(format!(
                "Cannot {} a transaction in state {:?}",
                if target == TransactionState::Committed {
                    "commit"
                } else {
                    "roll back"
                },
                self.state
            )));
        }
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| DbError::object_disposed("TransactionContext"))?;

        let outcome = match target {
            TransactionState::Committed => guarded("commit", None, cancel, conn.commit()).await,
            _ => guarded("rollback", None, cancel, conn.rollback()).await,
        };
        if let Err(e) = outcome {
            if e.is_cancelled() {
                conn.mark_broken();
            }
            return Err(e);
        }
        self.state = target;
        debug!(state = ?target, "Transaction finished");
        Ok(())
    }

    /// Release the transaction. Rolls back first when still active.
    ///
    /// Idempotent. A failed implicit rollback is logged, not returned.
    pub async fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;

        let Some(mut conn) = self.conn.take() else {
            return;
        };
        if self.state == TransactionState::Active {
            if let Err(e) = conn.rollback().await {
                warn!(error = %e, "Implicit rollback failed during dispose");
            }
            self.state = TransactionState::RolledBack;
        }
        if let Err(e) = conn.close().await {
            warn!(error = %e, "Failed to release transaction connection");
        }
    }
}

impl Drop for TransactionContext {
    fn drop(&mut self) {
        if self.disposed {
            return;
        }
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        let active = self.state == TransactionState::Active;
        warn!(
            connector = self.connector.name(),
            active, "Transaction dropped without dispose - consider calling dispose()"
        );

        // Best effort: without a runtime the connection is simply dropped
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if active {
                    if let Err(e) = conn.rollback().await {
                        warn!(error = %e, "Rollback of dropped transaction failed");
                    }
                }
                if let Err(e) = conn.close().await {
                    warn!(error = %e, "Failed to release dropped transaction connection");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::mock::MockConnector;
    use crate::models::{Column, DbValue, ResultSet};
    use std::sync::atomic::Ordering;

    fn connector(mock: &MockConnector) -> Arc<dyn Connector> {
        Arc::new(mock.clone())
    }

    async fn begin(mock: &MockConnector) -> TransactionContext {
        TransactionContext::begin(connector(mock), QueryExecutor::new(), None)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_commit_then_verbs_rejected() {
        let mock = MockConnector::with_affected(1);
        let mut tx = begin(&mock).await;

        let mut request = Request::new("UPDATE t SET x = 1");
        tx.execute_non_query(&mut request).await.unwrap();
        assert_eq!(request.affected_rows(), Some(1));

        tx.commit().await.unwrap();
        assert_eq!(tx.state(), TransactionState::Committed);

        let err = tx.execute_non_query(&mut request).await.unwrap_err();
        assert!(matches!(err, DbError::InvalidOperation { .. }));
        assert!(matches!(
            tx.commit().await,
            Err(DbError::InvalidOperation { .. })
        ));
        assert!(matches!(
            tx.rollback().await,
            Err(DbError::InvalidOperation { .. })
        ));

        tx.dispose().await;
        assert_eq!(mock.state.closed.load(Ordering::SeqCst), 1);
        assert_eq!(
            mock.state.log(),
            vec!["begin:None", "execute:UPDATE t SET x = 1", "commit"]
        );
    }

    #[tokio::test]
    async fn test_dispose_rolls_back_active_once() {
        let mock = MockConnector::default();
        let mut tx = begin(&mock).await;
        tx.dispose().await;
        tx.dispose().await;

        assert!(tx.is_disposed());
        assert_eq!(tx.state(), TransactionState::RolledBack);
        assert_eq!(mock.state.closed.load(Ordering::SeqCst), 1);
        assert_eq!(mock.state.log(), vec!["begin:None", "rollback"]);
    }

    #[tokio::test]
    async fn test_verbs_after_dispose_are_object_disposed() {
        let mock = MockConnector::default();
        let mut tx = begin(&mock).await;
        tx.rollback().await.unwrap();
        tx.dispose().await;

        let mut request = Request::new("SELECT 1");
        let err = tx.execute_reader(&mut request).await.unwrap_err();
        assert!(matches!(err, DbError::ObjectDisposed { .. }));
        // explicit rollback happened; dispose must not roll back again
        assert_eq!(mock.state.log(), vec!["begin:None", "rollback"]);
    }

    #[tokio::test]
    async fn test_dispose_swallows_rollback_failure() {
        let mock = MockConnector::default().failing_rollback();
        let mut tx = begin(&mock).await;
        tx.dispose().await;
        assert_eq!(tx.state(), TransactionState::RolledBack);
        assert_eq!(mock.state.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_typed_reader_inside_transaction() {
        #[derive(Debug, Clone, Default, PartialEq)]
        struct Count {
            n: i64,
        }
        crate::impl_record!(Count { n: i64 });

        let mock = MockConnector::with_sets(vec![ResultSet::new(
            vec![Column::new("N", "INTEGER")],
            vec![vec![DbValue::Int(5)]],
        )]);
        let mut tx = TransactionContext::begin(
            connector(&mock),
            QueryExecutor::new(),
            Some(IsolationLevel::Serializable),
        )
        .await
        .unwrap();

        let mut request = Request::new("SELECT COUNT(*) AS n FROM t");
        tx.execute_reader_as::<Count>(&mut request).await.unwrap();
        let count = request.result().and_then(|r| r.as_typed::<Count>()).cloned();
        assert_eq!(count.and_then(|m| m.into_vec().pop()), Some(Count { n: 5 }));
        tx.commit().await.unwrap();
        tx.dispose().await;
        assert_eq!(mock.state.log()[0], "begin:Some(Serializable)");
    }

    #[tokio::test]
    async fn test_cancelled_token_stops_transaction_work() {
        let mock = MockConnector::with_sets(vec![ResultSet::new(
            vec![Column::new("n", "INTEGER")],
            vec![vec![DbValue::Int(1)]],
        )]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err =
            TransactionContext::begin_with_cancel(connector(&mock), QueryExecutor::new(), None, &cancel)
                .await
                .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(mock.state.opened.load(Ordering::SeqCst), 0);

        let mut tx = begin(&mock).await;
        let result = tx
            .query(Request::new("SELECT 1 AS n"), Verb::Scalar, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.as_scalar(), Some(&DbValue::Int(1)));

        let mut request = Request::new("UPDATE t SET x = 1");
        let err = tx
            .execute_non_query_with_cancel(&mut request, &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        let err = tx.commit_with_cancel(&cancel).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(tx.state(), TransactionState::Active);

        tx.rollback().await.unwrap();
        tx.dispose().await;
        assert_eq!(
            mock.state.log(),
            vec!["begin:None", "query:SELECT 1 AS n", "rollback"]
        );
    }

    #[tokio::test]
    async fn test_drop_without_dispose_rolls_back() {
        let mock = MockConnector::default();
        {
            let _tx = begin(&mock).await;
        }
        // let the spawned cleanup run
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(mock.state.log(), vec!["begin:None", "rollback"]);
        assert_eq!(mock.state.closed.load(Ordering::SeqCst), 1);
    }
}
