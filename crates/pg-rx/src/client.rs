use crate::config::{ConnectConfig, PoolOptions};
use crate::postgres::Dedicated;
use crate::query::{QuerySequence, Statement};
use crate::sequence::SingleShot;
use crate::stream::{self, RowSequence, StreamOptions};
use crate::transaction::{Step, TransactionSequence, TransactionState};
use crate::{ConnectionHandle, ConnectionProvider, Error};
use futures::future::BoxFuture;
use serde_json::Value;
use std::sync::Arc;

/// Database is the caller-facing surface over a ConnectionProvider.
/// Each query, stream or transaction acquires its own connection when its
/// sequence is first polled, and releases it when the sequence finishes.
#[derive(Clone)]
pub struct Database {
    provider: Arc<dyn ConnectionProvider>,
}

impl Database {
    pub fn new(provider: impl ConnectionProvider) -> Self {
        Self {
            provider: Arc::new(provider),
        }
    }

    /// Build a Database over a pool of connections.
    /// The pool connects lazily, so an unreachable server is
    /// reported by the first acquisition rather than here.
    pub fn pool(config: &ConnectConfig, options: &PoolOptions) -> Result<Self, Error> {
        let pool = options.to_sqlx().connect_lazy_with(config.to_options()?);
        tracing::debug!(?config, ?options, "built connection pool");
        Ok(Self::new(pool))
    }

    /// Build a Database over a single dedicated connection,
    /// which is used by one query, stream or transaction at a time.
    pub async fn client(config: &ConnectConfig) -> Result<Self, Error> {
        let dedicated = Dedicated::connect(&config.to_options()?).await?;
        tracing::debug!(?config, "connected dedicated client");
        Ok(Self::new(dedicated))
    }

    /// Acquire a connection handle directly from the provider.
    pub fn acquire(&self) -> BoxFuture<'static, Result<ConnectionHandle, Error>> {
        self.provider.acquire()
    }

    /// Query for a single result. The returned sequence is deferred:
    /// nothing is acquired or submitted until it's polled.
    pub fn query(&self, statement: impl Statement, params: Vec<Value>) -> QuerySequence {
        match statement.into_query(params) {
            Ok(query) => QuerySequence::deferred(query, self.provider.clone()),
            Err(err) => QuerySequence::failed(err),
        }
    }

    /// Stream the rows of a query.
    pub fn stream(
        &self,
        statement: impl Statement,
        params: Vec<Value>,
        options: StreamOptions,
    ) -> RowSequence {
        let query = match statement.into_query(params) {
            Ok(query) => query,
            Err(err) => return RowSequence::failed(err),
        };
        let provider = self.provider.clone();

        RowSequence::new(options, move |tx| async move {
            let handle = provider.acquire().await?;
            stream::pump(handle, query, tx).await
        })
    }

    /// Run steps within a transaction over a single connection.
    /// The sequence yields the result of the last step to run before COMMIT,
    /// or the error of a transaction which was rolled back.
    pub fn transaction(&self, steps: impl IntoIterator<Item = Step>) -> TransactionSequence {
        let provider = self.provider.clone();
        let mut state = TransactionState::new(steps);

        SingleShot::new(async move {
            let mut handle = provider.acquire().await?;
            let result = state.run(&mut handle).await;
            handle.release();
            result
        })
    }

    /// Permanently close the underlying connections.
    /// Later acquisitions fail with a connection error.
    pub async fn end(&self) {
        self.provider.close().await;
        tracing::debug!("ended database");
    }
}
