//! Engine connection interfaces.
//!
//! Engines plug in through two traits: a [`Connector`] opens connections and
//! turns a request into an engine command, a [`Connection`] runs commands and
//! native transactions. Everything above this module is engine-agnostic.

use crate::error::DbResult;
use crate::models::{BindParam, CommandKind, IsolationLevel, Request, ResultSet};
use async_trait::async_trait;
use std::time::Duration;

/// An engine command built from a request.
#[derive(Debug, Clone, Default)]
pub struct Command {
    pub text: String,
    pub params: Vec<BindParam>,
    pub kind: CommandKind,
    pub timeout: Option<Duration>,
}

impl Command {
    /// Copy the command fields of a request as-is.
    pub fn from_request(request: &Request) -> Self {
        Self {
            text: request.query.clone(),
            params: request.parameters.clone(),
            kind: request.kind,
            timeout: request.timeout,
        }
    }

    /// Parameters that carry a value to the engine.
    pub fn input_params(&self) -> impl Iterator<Item = &BindParam> {
        self.params.iter().filter(|p| p.direction.is_input())
    }
}

/// One open engine connection.
///
/// Result sets are returned fully drained, in engine order.
#[async_trait]
pub trait Connection: Send {
    /// Run a command and drain every result set it produces.
    async fn query(&mut self, command: &Command) -> DbResult<Vec<ResultSet>>;

    /// Run a command and return the affected-row count.
    async fn execute(&mut self, command: &Command) -> DbResult<u64>;

    async fn begin(&mut self, isolation: Option<IsolationLevel>) -> DbResult<()>;

    async fn commit(&mut self) -> DbResult<()>;

    async fn rollback(&mut self) -> DbResult<()>;

    /// Release the connection. Further use is an error.
    async fn close(&mut self) -> DbResult<()>;

    /// Whether the connection saw a fault that makes it unfit for reuse.
    fn is_broken(&self) -> bool;

    /// Flag the connection as unfit for reuse, e.g. after an abandoned command.
    fn mark_broken(&mut self);
}

/// Opens connections to one configured engine endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Identifier used in logs.
    fn name(&self) -> &str;

    async fn open(&self) -> DbResult<Box<dyn Connection>>;

    /// Build the engine command for a request.
    fn build_command(&self, request: &Request) -> DbResult<Command> {
        Ok(Command::from_request(request))
    }
}
