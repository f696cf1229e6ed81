//! The pool handle: per-query connection acquisition, explicit
//! connection scopes, transactions, and lifecycle control.

mod manager;

pub(crate) use manager::{PoolInner, PooledConnection};

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::config::{ClientConfiguration, ConnectionOptions};
use crate::connection::{Pinned, PoolConnection, impl_query_methods};
use crate::driver::Driver;
use crate::error::TuskerError;
use crate::executor::{Binding, QueryOrigin, poisons_connection};
use crate::transaction::TransactionConnection;
use crate::type_registry::TypeRegistry;

/// Point-in-time pool snapshot. `active + idle` never exceeds the
/// configured maximum, and `waiting > 0` implies the pool is saturated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolState {
    pub active: usize,
    pub idle: usize,
    pub waiting: usize,
    pub ended: bool,
}

/// The entry-point handle. Cloning is cheap and clones share the pool.
///
/// ```rust,no_run
/// use tusker::{ClientConfiguration, create_pool, sql};
///
/// # async fn demo() -> Result<(), tusker::TuskerError> {
/// let pool = create_pool(
///     "postgres://app@db.internal/orders",
///     ClientConfiguration::default(),
/// )?;
/// let row = pool
///     .one(sql::tagged(
///         &["SELECT id FROM orders WHERE id = ", ""],
///         vec![42.into()],
///     )?)
///     .await?;
/// # let _ = row;
/// # Ok(()) }
/// ```
#[derive(Clone)]
pub struct DatabasePool {
    pub(crate) inner: Arc<PoolInner>,
}

/// Build a pool over the bundled tokio-postgres driver.
///
/// # Errors
/// `InvalidConfiguration` on a malformed URI or configuration.
#[cfg(feature = "postgres")]
pub fn create_pool(
    uri: &str,
    configuration: ClientConfiguration,
) -> Result<DatabasePool, TuskerError> {
    let options = ConnectionOptions::from_uri(uri)?;
    DatabasePool::with_driver(
        Arc::new(crate::driver::postgres::PgDriver::new()),
        options,
        configuration,
    )
}

impl DatabasePool {
    /// Build a pool over any [`Driver`] implementation; this is how
    /// tests wire in [`crate::testing::MockDriver`].
    ///
    /// # Errors
    /// `InvalidConfiguration` when the configuration fails validation.
    pub fn with_driver(
        driver: Arc<dyn Driver>,
        mut options: ConnectionOptions,
        configuration: ClientConfiguration,
    ) -> Result<Self, TuskerError> {
        configuration.validate()?;
        if let Some(ssl) = configuration.ssl {
            options.ssl_mode = ssl;
        }
        let mut registry = TypeRegistry::with_defaults();
        for parser in &configuration.type_parsers {
            registry.register(parser.clone());
        }
        Ok(Self {
            inner: Arc::new(PoolInner::new(driver, options, configuration, registry)),
        })
    }

    /// Point-in-time pool state; never blocks.
    #[must_use]
    pub fn state(&self) -> PoolState {
        self.inner.state()
    }

    #[must_use]
    pub fn configuration(&self) -> &ClientConfiguration {
        &self.inner.config
    }

    /// Reject new work, wait for checked-out connections to drain, and
    /// close everything. Idempotent.
    pub async fn end(&self) {
        self.inner.end().await;
    }

    pub(crate) async fn execute_fragment(
        &self,
        fragment: &crate::sql::RawSql,
    ) -> Result<crate::executor::Executed, TuskerError> {
        crate::executor::run_query(
            &self.inner,
            Binding::Pool,
            QueryOrigin::ImplicitQuery,
            None,
            fragment,
        )
        .await
    }

    pub(crate) async fn stream_fragment<F>(
        &self,
        fragment: &crate::sql::RawSql,
        batch_size: usize,
        sink: F,
    ) -> Result<u64, TuskerError>
    where
        F: FnMut(crate::row::Row) -> Result<(), TuskerError> + Send,
    {
        crate::stream::run_stream(
            &self.inner,
            Binding::Pool,
            QueryOrigin::ImplicitQuery,
            None,
            fragment,
            batch_size,
            sink,
        )
        .await
    }

    /// Pin a connection for the duration of `handler`. The connection
    /// is released on every exit path.
    ///
    /// # Errors
    /// Acquisition failures, or whatever the handler returns.
    pub async fn connect<T, F>(&self, handler: F) -> Result<T, TuskerError>
    where
        T: Send,
        F: for<'c> FnOnce(&'c PoolConnection) -> BoxFuture<'c, Result<T, TuskerError>> + Send,
    {
        let pooled = self.inner.acquire().await?;
        let pinned = Arc::new(Pinned::new(Arc::clone(&self.inner), pooled));
        let handle = PoolConnection {
            pool: Arc::clone(&self.inner),
            pinned: Arc::clone(&pinned),
        };

        let outcome = handler(&handle).await;
        pinned.release(outcome.as_ref().is_err_and(poisons_connection));
        outcome
    }

    /// Run `handler` inside a transaction on a pinned connection. Ok
    /// commits, Err rolls back; class-40 failures re-run the handler up
    /// to `transaction_retry_limit` times on the same connection.
    ///
    /// # Errors
    /// Acquisition failures, lifecycle-statement failures, or the
    /// handler's error.
    pub async fn transaction<T, F>(&self, handler: F) -> Result<T, TuskerError>
    where
        T: Send,
        F: for<'c> Fn(&'c TransactionConnection) -> BoxFuture<'c, Result<T, TuskerError>>
            + Send
            + Sync,
    {
        let pooled = self.inner.acquire().await?;
        let pinned = Arc::new(Pinned::new(Arc::clone(&self.inner), pooled));

        let outcome = crate::transaction::run_transaction(
            &self.inner,
            &pinned,
            self.inner.config.transaction_retry_limit,
            &handler,
        )
        .await;
        pinned.release(outcome.as_ref().is_err_and(poisons_connection));
        outcome
    }

    /// Binary `COPY … FROM STDIN` on a per-query connection; returns
    /// the copied row count.
    ///
    /// # Errors
    /// `InvalidInput` on malformed tuples, otherwise driver errors
    /// mapped onto the taxonomy.
    pub async fn copy_from_binary(
        &self,
        fragment: crate::sql::RawSql,
        tuples: Vec<Vec<crate::value::PrimitiveValue>>,
        column_types: Vec<String>,
    ) -> Result<u64, TuskerError> {
        crate::copy::run_copy(&self.inner, Binding::Pool, &fragment, &tuples, &column_types)
            .await
    }
}

impl_query_methods!(DatabasePool);

impl fmt::Debug for DatabasePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabasePool")
            .field("pool_id", &self.inner.pool_id)
            .field("state", &self.state())
            .finish()
    }
}
