//! JSON file source.
//!
//! The request's query is a JSON pointer into the file (empty selects the
//! document root). The selected node becomes one result set:
//! - an array yields one row per element
//! - an object yields a single row
//! - a scalar yields a single row with one `value` column
//!
//! Object keys become columns in first-seen order across all rows.

use crate::db::{TransactionContext, Verb};
use crate::error::{DbError, DbResult};
use crate::models::{Column, DbValue, IsolationLevel, QueryResult, Request, ResultSet};
use crate::sources::{DataParams, DataSource, NamedSource, shape_sets};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const VALUE_COLUMN: &str = "value";

/// Request against a JSON document on disk.
#[derive(Debug, Default)]
pub struct JsonFileParams {
    pub request: Request,
    pub path: PathBuf,
}

impl JsonFileParams {
    pub fn new(path: impl Into<PathBuf>, pointer: impl Into<String>) -> Self {
        Self {
            request: Request::new(pointer),
            path: path.into(),
        }
    }
}

crate::impl_params!(JsonFileParams);

#[derive(Debug, Clone, Default)]
pub struct JsonFileSource {
    /// Relative paths resolve against this directory
    root: Option<PathBuf>,
}

impl JsonFileSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        match &self.root {
            Some(root) if path.is_relative() => root.join(path),
            _ => path.to_path_buf(),
        }
    }

    async fn load(&self, params: &JsonFileParams, cancel: &CancellationToken) -> DbResult<ResultSet> {
        let path = self.resolve(&params.path);
        if cancel.is_cancelled() {
            return Err(DbError::cancelled("read json file"));
        }
        let text = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DbError::cancelled("read json file")),
            text = tokio::fs::read_to_string(&path) => text.map_err(|e| {
                DbError::connection(
                    format!("Failed to read {}: {}", path.display(), e),
                    "Check that the file exists and is readable",
                )
            })?,
        };

        let document: JsonValue = serde_json::from_str(&text).map_err(|e| {
            DbError::database(
                format!("Invalid JSON in {}: {}", path.display(), e),
                None,
                "Check the file contents",
            )
        })?;

        let pointer = params.request.query.trim();
        let pointer = if pointer == "/" { "" } else { pointer };
        let node = document.pointer(pointer).ok_or_else(|| {
            DbError::invalid_argument(format!(
                "JSON pointer '{}' does not match anything in {}",
                pointer,
                path.display()
            ))
        })?;

        let set = node_to_set(node);
        debug!(path = %path.display(), pointer, rows = set.rows.len(), "Loaded JSON rows");
        Ok(set)
    }
}

/// Turn a JSON node into a result set.
pub fn node_to_set(node: &JsonValue) -> ResultSet {
    let items: Vec<&JsonValue> = match node {
        JsonValue::Array(items) => items.iter().collect(),
        other => vec![other],
    };

    let mut names: Vec<String> = Vec::new();
    for item in &items {
        match item {
            JsonValue::Object(map) => {
                for key in map.keys() {
                    if !names.iter().any(|n| n == key) {
                        names.push(key.clone());
                    }
                }
            }
            _ => {
                if !names.iter().any(|n| n == VALUE_COLUMN) {
                    names.push(VALUE_COLUMN.to_string());
                }
            }
        }
    }

    let rows = items
        .into_iter()
        .map(|item| {
            names
                .iter()
                .map(|name| match item {
                    JsonValue::Object(map) => map
                        .get(name)
                        .cloned()
                        .map(DbValue::from_json)
                        .unwrap_or(DbValue::Null),
                    other if name == VALUE_COLUMN => DbValue::from_json(other.clone()),
                    _ => DbValue::Null,
                })
                .collect()
        })
        .collect();

    let columns = names.into_iter().map(|n| Column::new(n, "json")).collect();
    ResultSet::new(columns, rows)
}

impl NamedSource for JsonFileSource {
    const NAME: &'static str = "JsonFile";
}

#[async_trait]
impl DataSource for JsonFileSource {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn execute(
        &self,
        params: &dyn DataParams,
        verb: Verb<'_>,
        cancel: &CancellationToken,
    ) -> DbResult<QueryResult> {
        let params = params
            .as_any()
            .downcast_ref::<JsonFileParams>()
            .ok_or_else(|| {
                DbError::invalid_argument(format!(
                    "JsonFile source cannot run parameters of type {}",
                    params.type_key()
                ))
            })?;
        if matches!(verb, Verb::NonQuery) {
            return Err(DbError::invalid_operation("JsonFile source is read-only"));
        }
        let set = self.load(params, cancel).await?;
        shape_sets(Self::NAME, vec![set], verb)
    }

    async fn begin_transaction(
        &self,
        _params: &dyn DataParams,
        _isolation: Option<IsolationLevel>,
        _cancel: &CancellationToken,
    ) -> DbResult<TransactionContext> {
        Err(DbError::invalid_operation(
            "JsonFile source does not support transactions",
        ))
    }
}
