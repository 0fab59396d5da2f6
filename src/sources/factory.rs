//! Data source factory.
//!
//! Maps parameter types to source names and asks a [`ServiceProvider`] for
//! the source instance. Lookup order:
//! 1. the exact type key
//! 2. the generic definition key, for generic parameter types
//! 3. by convention: `FooParams` resolves to a provided source named `Foo`
//!    (exact name), and the hit is cached as an explicit mapping
//!
//! Anything else is an `UnsupportedSourceType` naming the parameter type.

use crate::error::{DbError, DbResult};
use crate::sources::{
    DataParams, DataSource, JsonFileParams, JsonFileSource, MySqlParams, NamedSource,
    PostgresParams, SqlSource, SqliteParams, StaticSource, TypeKey,
};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

const PARAMS_SUFFIX: &str = "Params";

/// Supplies source instances by name.
pub trait ServiceProvider: Send + Sync {
    fn resolve(&self, name: &str) -> Option<Arc<dyn DataSource>>;

    /// Names of every source this provider can supply.
    fn source_names(&self) -> Vec<String>;
}

/// In-process set of named source instances.
#[derive(Default)]
pub struct SourceCatalog {
    sources: DashMap<String, Arc<dyn DataSource>>,
}

impl std::fmt::Debug for SourceCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceCatalog")
            .field("sources", &self.source_names())
            .finish()
    }
}

impl SourceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a source under its own name, replacing any previous one.
    pub fn add<S: NamedSource + DataSource + 'static>(&self, source: S) {
        self.insert(S::NAME, Arc::new(source));
    }

    pub fn insert(&self, name: impl Into<String>, source: Arc<dyn DataSource>) {
        let name = name.into();
        debug!(source = %name, "Source added to catalog");
        self.sources.insert(name, source);
    }

    pub fn remove(&self, name: &str) -> bool {
        self.sources.remove(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

impl ServiceProvider for SourceCatalog {
    fn resolve(&self, name: &str) -> Option<Arc<dyn DataSource>> {
        self.sources.get(name).map(|entry| Arc::clone(entry.value()))
    }

    fn source_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sources.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

pub struct DataSourceFactory {
    /// Parameter key -> source name
    registry: RwLock<HashMap<String, String>>,
    provider: Arc<dyn ServiceProvider>,
}

impl std::fmt::Debug for DataSourceFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSourceFactory")
            .field("registry", &*self.registry.read())
            .finish_non_exhaustive()
    }
}

impl DataSourceFactory {
    /// Create a factory seeded with the bundled parameter types.
    pub fn new(provider: Arc<dyn ServiceProvider>) -> Self {
        let factory = Self::empty(provider);
        factory.register::<PostgresParams, SqlSource<PostgresParams>>();
        factory.register::<MySqlParams, SqlSource<MySqlParams>>();
        factory.register::<SqliteParams, SqlSource<SqliteParams>>();
        factory.register::<JsonFileParams, JsonFileSource>();
        // The definition key covers every StaticParams<T>
        factory.register_key(
            TypeKey::generic("StaticParams", "StaticParams"),
            StaticSource::NAME,
        );
        factory
    }

    /// Create a factory with no mappings.
    pub fn empty(provider: Arc<dyn ServiceProvider>) -> Self {
        Self {
            registry: RwLock::new(HashMap::new()),
            provider,
        }
    }

    /// Map parameter type `P` to source `S`, replacing any existing mapping.
    pub fn register<P: DataParams, S: NamedSource>(&self) {
        self.register_key(P::static_key(), S::NAME);
    }

    pub fn register_key(&self, key: TypeKey, source: &str) {
        let mut registry = self.registry.write();
        registry.insert(key.exact.to_string(), source.to_string());
        if let Some(definition) = key.definition {
            registry.insert(definition.to_string(), source.to_string());
        }
        debug!(params = key.exact, source, "Data source registered");
    }

    /// The source name currently mapped for `key`, if any.
    pub fn mapping(&self, key: &TypeKey) -> Option<String> {
        let registry = self.registry.read();
        registry
            .get(key.exact)
            .or_else(|| key.definition.and_then(|d| registry.get(d)))
            .cloned()
    }

    pub fn provider(&self) -> &Arc<dyn ServiceProvider> {
        &self.provider
    }

    /// Resolve the source for a parameters object.
    pub fn resolve(&self, params: &dyn DataParams) -> DbResult<Arc<dyn DataSource>> {
        self.resolve_key(params.type_key())
    }

    pub fn resolve_key(&self, key: TypeKey) -> DbResult<Arc<dyn DataSource>> {
        if let Some(name) = self.mapping(&key) {
            match self.provider.resolve(&name) {
                Some(source) => return Ok(source),
                None => warn!(
                    params = key.exact,
                    source = %name,
                    "Mapped source is not available from the provider"
                ),
            }
        }

        let Some(name) = self.by_convention(&key) else {
            return Err(DbError::unsupported_source(key.exact));
        };
        let source = self
            .provider
            .resolve(&name)
            .ok_or_else(|| DbError::unsupported_source(key.exact))?;
        debug!(params = key.exact, source = %name, "Resolved data source by convention");
        self.register_key(key, &name);
        Ok(source)
    }

    fn by_convention(&self, key: &TypeKey) -> Option<String> {
        let short = key.short_name();
        let stem = short.strip_suffix(PARAMS_SUFFIX).unwrap_or(short);
        if stem.is_empty() {
            return None;
        }
        self.provider
            .source_names()
            .into_iter()
            .find(|name| name == stem)
    }
}
