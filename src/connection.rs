//! Pinned connections and the explicit-connection handle.

use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};

use crate::error::TuskerError;
use crate::executor::ConnectionId;
use crate::pool::{PoolInner, PooledConnection};

/// A connection pinned to a handle (explicit connection or
/// transaction). The mutex doubles as the per-handle busy flag:
/// overlapping use of the same handle fails instead of queueing.
pub(crate) struct Pinned {
    pub(crate) connection_id: ConnectionId,
    pool: Arc<PoolInner>,
    slot: Mutex<Option<PooledConnection>>,
}

impl Pinned {
    pub(crate) fn new(pool: Arc<PoolInner>, conn: PooledConnection) -> Self {
        Self {
            connection_id: conn.id,
            pool,
            slot: Mutex::new(Some(conn)),
        }
    }

    /// The busy-flag check: a second caller on the same handle gets
    /// `Concurrency` instead of waiting.
    pub(crate) fn try_borrow(
        &self,
    ) -> Result<MutexGuard<'_, Option<PooledConnection>>, TuskerError> {
        self.slot.try_lock().map_err(|_| TuskerError::Concurrency)
    }

    /// Return the pinned connection to the pool. No-op when already
    /// released or still borrowed (the drop backstop covers that case).
    pub(crate) fn release(&self, destroy: bool) {
        if let Ok(mut slot) = self.slot.try_lock()
            && let Some(conn) = slot.take()
        {
            self.pool.release(conn, destroy);
        }
    }
}

// Backstop for futures dropped mid-handler: the connection's state is
// unknown, so it is destroyed rather than parked idle.
impl Drop for Pinned {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.slot.try_lock()
            && let Some(conn) = slot.take()
        {
            self.pool.release(conn, true);
        }
    }
}

/// Generates the query-method surface shared by every handle kind. The
/// handle supplies `execute_fragment` and `stream_fragment`; the shapes
/// are applied on top.
macro_rules! impl_query_methods {
    ($handle:ty) => {
        impl $handle {
            /// Execute and return the full result set.
            ///
            /// # Errors
            /// Any pipeline error: invalid fragment, pool failure,
            /// driver failure mapped onto the error taxonomy.
            pub async fn query(
                &self,
                fragment: $crate::sql::RawSql,
            ) -> Result<$crate::row::QueryResult, $crate::error::TuskerError> {
                Ok(self.execute_fragment(&fragment).await?.result)
            }

            /// Exactly one row; `NotFound` on zero, `DataIntegrity` on
            /// more.
            ///
            /// # Errors
            /// See [`Self::query`], plus the cardinality errors.
            pub async fn one(
                &self,
                fragment: $crate::sql::RawSql,
            ) -> Result<$crate::row::Row, $crate::error::TuskerError> {
                $crate::executor::shape::one(self.execute_fragment(&fragment).await?)
            }

            /// Exactly one row with exactly one column; returns the
            /// value.
            ///
            /// # Errors
            /// See [`Self::one`], plus `DataIntegrity` on column count.
            pub async fn one_first(
                &self,
                fragment: $crate::sql::RawSql,
            ) -> Result<$crate::value::PrimitiveValue, $crate::error::TuskerError> {
                $crate::executor::shape::one_first(self.execute_fragment(&fragment).await?)
            }

            /// Zero or one row.
            ///
            /// # Errors
            /// See [`Self::query`]; `DataIntegrity` on two or more rows.
            pub async fn maybe_one(
                &self,
                fragment: $crate::sql::RawSql,
            ) -> Result<Option<$crate::row::Row>, $crate::error::TuskerError> {
                $crate::executor::shape::maybe_one(self.execute_fragment(&fragment).await?)
            }

            /// Zero or one single-column row; returns the value.
            ///
            /// # Errors
            /// See [`Self::maybe_one`], plus `DataIntegrity` on column
            /// count.
            pub async fn maybe_one_first(
                &self,
                fragment: $crate::sql::RawSql,
            ) -> Result<Option<$crate::value::PrimitiveValue>, $crate::error::TuskerError> {
                $crate::executor::shape::maybe_one_first(self.execute_fragment(&fragment).await?)
            }

            /// One or more rows; `NotFound` on zero.
            ///
            /// # Errors
            /// See [`Self::query`], plus `NotFound`.
            pub async fn many(
                &self,
                fragment: $crate::sql::RawSql,
            ) -> Result<Vec<$crate::row::Row>, $crate::error::TuskerError> {
                $crate::executor::shape::many(self.execute_fragment(&fragment).await?)
            }

            /// One or more single-column rows; returns the values.
            ///
            /// # Errors
            /// See [`Self::many`], plus `DataIntegrity` on column count.
            pub async fn many_first(
                &self,
                fragment: $crate::sql::RawSql,
            ) -> Result<Vec<$crate::value::PrimitiveValue>, $crate::error::TuskerError> {
                $crate::executor::shape::many_first(self.execute_fragment(&fragment).await?)
            }

            /// Any number of rows.
            ///
            /// # Errors
            /// See [`Self::query`].
            pub async fn any(
                &self,
                fragment: $crate::sql::RawSql,
            ) -> Result<Vec<$crate::row::Row>, $crate::error::TuskerError> {
                $crate::executor::shape::any(self.execute_fragment(&fragment).await?)
            }

            /// Any number of single-column rows; returns the values.
            ///
            /// # Errors
            /// See [`Self::query`], plus `DataIntegrity` on column count.
            pub async fn any_first(
                &self,
                fragment: $crate::sql::RawSql,
            ) -> Result<Vec<$crate::value::PrimitiveValue>, $crate::error::TuskerError> {
                $crate::executor::shape::any_first(self.execute_fragment(&fragment).await?)
            }

            /// Wraps the fragment in `SELECT EXISTS (…)` and returns
            /// the boolean.
            ///
            /// # Errors
            /// See [`Self::query`].
            pub async fn exists(
                &self,
                fragment: $crate::sql::RawSql,
            ) -> Result<bool, $crate::error::TuskerError> {
                let wrapped =
                    $crate::sql::tagged(&["SELECT EXISTS (", ")"], vec![fragment.into()])?;
                $crate::executor::shape::exists(self.execute_fragment(&wrapped).await?)
            }

            /// Stream rows through a server-side cursor, `batch_size`
            /// rows per round trip, delivering them to `sink` one at a
            /// time. Returns the number of rows delivered.
            ///
            /// # Errors
            /// See [`Self::query`]; a sink error aborts the stream and
            /// is returned as-is. Resources are released on every exit
            /// path.
            pub async fn stream<F>(
                &self,
                fragment: $crate::sql::RawSql,
                batch_size: usize,
                sink: F,
            ) -> Result<u64, $crate::error::TuskerError>
            where
                F: FnMut($crate::row::Row) -> Result<(), $crate::error::TuskerError> + Send,
            {
                self.stream_fragment(&fragment, batch_size, sink).await
            }
        }
    };
}

pub(crate) use impl_query_methods;

/// An explicitly acquired connection, pinned for the duration of a
/// `connect` scope. Obtained through
/// [`DatabasePool::connect`](crate::DatabasePool::connect).
pub struct PoolConnection {
    pub(crate) pool: Arc<PoolInner>,
    pub(crate) pinned: Arc<Pinned>,
}

impl PoolConnection {
    pub(crate) async fn execute_fragment(
        &self,
        fragment: &crate::sql::RawSql,
    ) -> Result<crate::executor::Executed, TuskerError> {
        crate::executor::run_query(
            &self.pool,
            crate::executor::Binding::Pinned(&self.pinned),
            crate::executor::QueryOrigin::Explicit,
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
            &self.pool,
            crate::executor::Binding::Pinned(&self.pinned),
            crate::executor::QueryOrigin::Explicit,
            None,
            fragment,
            batch_size,
            sink,
        )
        .await
    }

    /// Run a transaction on this connection. Ok commits, Err rolls
    /// back; class-40 failures re-run the handler up to the configured
    /// retry limit.
    ///
    /// # Errors
    /// The handler's error, or any lifecycle-statement failure.
    pub async fn transaction<T, F>(&self, handler: F) -> Result<T, TuskerError>
    where
        T: Send,
        F: for<'c> Fn(
                &'c crate::transaction::TransactionConnection,
            ) -> futures::future::BoxFuture<'c, Result<T, TuskerError>>
            + Send
            + Sync,
    {
        crate::transaction::run_transaction(
            &self.pool,
            &self.pinned,
            self.pool.config.transaction_retry_limit,
            &handler,
        )
        .await
    }

    /// Binary `COPY … FROM STDIN`; returns the copied row count.
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
        crate::copy::run_copy(
            &self.pool,
            crate::executor::Binding::Pinned(&self.pinned),
            &fragment,
            &tuples,
            &column_types,
        )
        .await
    }
}

impl_query_methods!(PoolConnection);
