//! Data provider facade.
//!
//! Resolves the source for a parameters object through the
//! [`DataSourceFactory`], runs one verb on it (under the attached resilience
//! policy, if any) and writes the outcome into the parameters' result slot.

use crate::db::{TransactionContext, Verb};
use crate::error::DbResult;
use crate::mapping::{Record, Shape};
use crate::models::IsolationLevel;
use crate::resilience::Policy;
use crate::sources::{DataParams, DataSourceFactory, NamedSource, ServiceProvider};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct DataProvider {
    factory: Arc<DataSourceFactory>,
    policy: Option<Policy>,
}

impl DataProvider {
    /// Create a provider over a factory seeded with the default mappings.
    pub fn new(services: Arc<dyn ServiceProvider>) -> Self {
        Self::with_factory(Arc::new(DataSourceFactory::new(services)))
    }

    pub fn with_factory(factory: Arc<DataSourceFactory>) -> Self {
        Self {
            factory,
            policy: None,
        }
    }

    /// Run every verb under `policy`.
    pub fn with_policy(mut self, policy: impl Into<Policy>) -> Self {
        self.policy = Some(policy.into());
        self
    }

    pub fn policy(&self) -> Option<&Policy> {
        self.policy.as_ref()
    }

    pub fn factory(&self) -> &DataSourceFactory {
        &self.factory
    }

    /// Map parameter type `P` to source `S`.
    pub fn register_data_source<P: DataParams, S: NamedSource>(&self) {
        self.factory.register::<P, S>();
    }

    async fn run<'p, P: DataParams>(
        &self,
        params: &'p mut P,
        verb: Verb<'_>,
        cancel: &CancellationToken,
    ) -> DbResult<&'p mut P> {
        let source = self.factory.resolve(&*params)?;
        debug!(
            params = %params.type_key(),
            source = source.name(),
            verb = verb.name(),
            "Resolved data source"
        );

        let shared: &P = params;
        let result = match &self.policy {
            Some(policy) => {
                policy
                    .execute(cancel, |token| {
                        let source = Arc::clone(&source);
                        async move { source.execute(shared, verb, &token).await }
                    })
                    .await?
            }
            None => source.execute(shared, verb, cancel).await?,
        };

        params.request_mut().set_result(result);
        Ok(params)
    }

    /// Rows as mappings: one row collapses to a single mapping, several to a list.
    pub async fn execute_reader<'p, P: DataParams>(&self, params: &'p mut P) -> DbResult<&'p mut P> {
        self.run(params, Verb::Reader, &CancellationToken::new())
            .await
    }

    pub async fn execute_reader_with_cancel<'p, P: DataParams>(
        &self,
        params: &'p mut P,
        cancel: &CancellationToken,
    ) -> DbResult<&'p mut P> {
        self.run(params, Verb::Reader, cancel).await
    }

    /// Rows materialized as `T`.
    pub async fn execute_reader_as<'p, T: Record, P: DataParams>(
        &self,
        params: &'p mut P,
    ) -> DbResult<&'p mut P> {
        self.execute_reader_as_with_cancel::<T, P>(params, &CancellationToken::new())
            .await
    }

    pub async fn execute_reader_as_with_cancel<'p, T: Record, P: DataParams>(
        &self,
        params: &'p mut P,
        cancel: &CancellationToken,
    ) -> DbResult<&'p mut P> {
        let shape = Shape::<T>::new();
        self.run(params, Verb::Typed(&shape), cancel).await
    }

    pub async fn execute_scalar<'p, P: DataParams>(&self, params: &'p mut P) -> DbResult<&'p mut P> {
        self.run(params, Verb::Scalar, &CancellationToken::new())
            .await
    }

    pub async fn execute_scalar_with_cancel<'p, P: DataParams>(
        &self,
        params: &'p mut P,
        cancel: &CancellationToken,
    ) -> DbResult<&'p mut P> {
        self.run(params, Verb::Scalar, cancel).await
    }

    /// Affected-row count, stored as the result and in `affected_rows`.
    pub async fn execute_non_query<'p, P: DataParams>(
        &self,
        params: &'p mut P,
    ) -> DbResult<&'p mut P> {
        self.run(params, Verb::NonQuery, &CancellationToken::new())
            .await
    }

    pub async fn execute_non_query_with_cancel<'p, P: DataParams>(
        &self,
        params: &'p mut P,
        cancel: &CancellationToken,
    ) -> DbResult<&'p mut P> {
        self.run(params, Verb::NonQuery, cancel).await
    }

    /// Start a transaction on the source that serves `params`.
    ///
    /// Only opening the transaction runs under the policy; statements inside
    /// it are never retried.
    pub async fn begin_transaction<P: DataParams>(
        &self,
        params: &P,
        isolation: Option<IsolationLevel>,
    ) -> DbResult<TransactionContext> {
        self.begin_transaction_with_cancel(params, isolation, &CancellationToken::new())
            .await
    }

    pub async fn begin_transaction_with_cancel<P: DataParams>(
        &self,
        params: &P,
        isolation: Option<IsolationLevel>,
        cancel: &CancellationToken,
    ) -> DbResult<TransactionContext> {
        let source = self.factory.resolve(params)?;
        match &self.policy {
            Some(policy) => {
                policy
                    .execute(cancel, |token| {
                        let source = Arc::clone(&source);
                        async move { source.begin_transaction(params, isolation, &token).await }
                    })
                    .await
            }
            None => source.begin_transaction(params, isolation, cancel).await,
        }
    }
}
