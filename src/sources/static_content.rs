//! Static in-memory source.
//!
//! The parameters carry the rows themselves as serializable values. Each
//! item is serialized to JSON and projected the same way as a JSON file
//! node, so records become rows and scalars become a `value` column.

use crate::db::{TransactionContext, Verb};
use crate::error::{DbError, DbResult};
use crate::models::{IsolationLevel, QueryResult, Request, ResultSet};
use crate::sources::json_file::node_to_set;
use crate::sources::{DataParams, DataSource, NamedSource, TypeKey, shape_sets};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::any::Any;
use tokio_util::sync::CancellationToken;

const DEFINITION: &str = "StaticParams";

/// Request whose result rows are supplied inline.
#[derive(Debug)]
pub struct StaticParams<T> {
    pub request: Request,
    pub content: Vec<T>,
}

impl<T> Default for StaticParams<T> {
    fn default() -> Self {
        Self {
            request: Request::default(),
            content: Vec::new(),
        }
    }
}

impl<T> StaticParams<T> {
    pub fn new(content: Vec<T>) -> Self {
        Self {
            request: Request::default(),
            content,
        }
    }
}

impl<T: Serialize + Send + Sync + 'static> DataParams for StaticParams<T> {
    fn static_key() -> TypeKey {
        TypeKey::generic(std::any::type_name::<Self>(), DEFINITION)
    }

    fn type_key(&self) -> TypeKey {
        Self::static_key()
    }

    fn request(&self) -> &Request {
        &self.request
    }

    fn request_mut(&mut self) -> &mut Request {
        &mut self.request
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn inline_content(&self) -> Option<DbResult<ResultSet>> {
        let items = self
            .content
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| DbError::invalid_argument(format!("Static content is not serializable: {e}")));
        Some(items.map(|items| node_to_set(&JsonValue::Array(items))))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StaticSource;

impl NamedSource for StaticSource {
    const NAME: &'static str = "Static";
}

#[async_trait]
impl DataSource for StaticSource {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn execute(
        &self,
        params: &dyn DataParams,
        verb: Verb<'_>,
        cancel: &CancellationToken,
    ) -> DbResult<QueryResult> {
        if cancel.is_cancelled() {
            return Err(DbError::cancelled(verb.name()));
        }
        let key = params.type_key();
        let set = match (key.definition, params.inline_content()) {
            (Some(DEFINITION), Some(content)) => content?,
            _ => {
                return Err(DbError::invalid_argument(format!(
                    "Static source cannot run parameters of type {key}"
                )));
            }
        };
        shape_sets(Self::NAME, vec![set], verb)
    }

    async fn begin_transaction(
        &self,
        _params: &dyn DataParams,
        _isolation: Option<IsolationLevel>,
        _cancel: &CancellationToken,
    ) -> DbResult<TransactionContext> {
        Err(DbError::invalid_operation(
            "Static source does not support transactions",
        ))
    }
}
