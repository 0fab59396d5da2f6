//! Scripted in-memory connector for unit tests.

use crate::db::connection::{Command, Connection, Connector};
use crate::error::{DbError, DbResult};
use crate::models::{IsolationLevel, ResultSet};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct MockState {
    pub opened: AtomicUsize,
    pub closed: AtomicUsize,
    /// Closes of connections flagged broken
    pub discarded: AtomicUsize,
    pub log: Mutex<Vec<String>>,
}

impl MockState {
    pub fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    fn record(&self, entry: impl Into<String>) {
        self.log.lock().push(entry.into());
    }
}

#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    pub state: Arc<MockState>,
    sets: Vec<ResultSet>,
    affected: u64,
    delay: Option<Duration>,
    first_open_delay: Option<Duration>,
    fail: bool,
    fail_rollback: bool,
}

impl MockConnector {
    pub fn with_sets(sets: Vec<ResultSet>) -> Self {
        Self {
            sets,
            ..Self::default()
        }
    }

    pub fn with_affected(affected: u64) -> Self {
        Self {
            affected,
            ..Self::default()
        }
    }

    /// Every command fails with an engine error.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// The first `open` sleeps before returning.
    pub fn slow_first_open(mut self, delay: Duration) -> Self {
        self.first_open_delay = Some(delay);
        self
    }

    pub fn failing_rollback(mut self) -> Self {
        self.fail_rollback = true;
        self
    }
}

#[async_trait]
impl Connector for MockConnector {
    fn name(&self) -> &str {
        "mock"
    }

    async fn open(&self) -> DbResult<Box<dyn Connection>> {
        let id = self.state.opened.fetch_add(1, Ordering::SeqCst);
        if let (0, Some(delay)) = (id, self.first_open_delay) {
            tokio::time::sleep(delay).await;
        }
        Ok(Box::new(MockConnection {
            id,
            connector: self.clone(),
            broken: false,
            closed: false,
        }))
    }
}

#[derive(Debug)]
pub struct MockConnection {
    pub id: usize,
    connector: MockConnector,
    broken: bool,
    closed: bool,
}

impl MockConnection {
    async fn step(&self, entry: String) -> DbResult<()> {
        if self.closed {
            return Err(DbError::object_disposed("connection"));
        }
        if let Some(delay) = self.connector.delay {
            tokio::time::sleep(delay).await;
        }
        self.connector.state.record(entry);
        if self.connector.fail {
            return Err(DbError::database("scripted failure", None, "none"));
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn query(&mut self, command: &Command) -> DbResult<Vec<ResultSet>> {
        self.step(format!("query:{}", command.text)).await?;
        Ok(self.connector.sets.clone())
    }

    async fn execute(&mut self, command: &Command) -> DbResult<u64> {
        self.step(format!("execute:{}", command.text)).await?;
        Ok(self.connector.affected)
    }

    async fn begin(&mut self, isolation: Option<IsolationLevel>) -> DbResult<()> {
        self.connector.state.record(format!("begin:{:?}", isolation));
        Ok(())
    }

    async fn commit(&mut self) -> DbResult<()> {
        self.connector.state.record("commit");
        Ok(())
    }

    async fn rollback(&mut self) -> DbResult<()> {
        self.connector.state.record("rollback");
        if self.connector.fail_rollback {
            return Err(DbError::connection("scripted rollback failure", "none"));
        }
        Ok(())
    }

    async fn close(&mut self) -> DbResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.connector.state.closed.fetch_add(1, Ordering::SeqCst);
        if self.broken {
            self.connector.state.discarded.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn is_broken(&self) -> bool {
        self.broken
    }

    fn mark_broken(&mut self) {
        self.broken = true;
    }
}
