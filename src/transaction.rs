//! The transaction state machine: top-level BEGIN/COMMIT/ROLLBACK,
//! nested savepoints, and class-40 retry with a fresh handler
//! invocation on the same pinned connection.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::BoxFuture;
use tracing::{debug, warn};

use crate::connection::{Pinned, impl_query_methods};
use crate::error::{QueryErrorDetail, TuskerError};
use crate::executor::{Binding, QueryId, QueryOrigin, TransactionId};
use crate::pool::PoolInner;

/// A transaction-bound handle. All queries run on the transaction's
/// pinned connection; the handle stops working once the transaction has
/// committed or rolled back.
pub struct TransactionConnection {
    pool: Arc<PoolInner>,
    pinned: Arc<Pinned>,
    id: TransactionId,
    depth: usize,
    finished: AtomicBool,
}

impl TransactionConnection {
    fn ensure_open(&self) -> Result<(), TuskerError> {
        if self.finished.load(Ordering::SeqCst) {
            return Err(TuskerError::UnexpectedState(
                "transaction handle used after commit or rollback".into(),
            ));
        }
        Ok(())
    }

    pub(crate) async fn execute_fragment(
        &self,
        fragment: &crate::sql::RawSql,
    ) -> Result<crate::executor::Executed, TuskerError> {
        self.ensure_open()?;
        crate::executor::run_query(
            &self.pool,
            Binding::Pinned(&self.pinned),
            QueryOrigin::ImplicitTransaction,
            Some(self.id),
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
        self.ensure_open()?;
        crate::stream::run_stream(
            &self.pool,
            Binding::Pinned(&self.pinned),
            QueryOrigin::ImplicitTransaction,
            Some(self.id),
            fragment,
            batch_size,
            sink,
        )
        .await
    }

    /// Open a nested transaction scoped by a savepoint. Ok releases the
    /// savepoint; Err rolls back to it and surfaces the error without
    /// retrying; only top-level transactions retry.
    ///
    /// # Errors
    /// The handler's error, or a savepoint-statement failure.
    pub async fn transaction<T, F>(&self, handler: F) -> Result<T, TuskerError>
    where
        T: Send,
        F: for<'c> Fn(&'c TransactionConnection) -> BoxFuture<'c, Result<T, TuskerError>>
            + Send
            + Sync,
    {
        self.ensure_open()?;
        let depth = self.depth + 1;
        let savepoint = savepoint_name(depth);

        lifecycle(&self.pinned, &format!("SAVEPOINT {savepoint}")).await?;
        let child = TransactionConnection {
            pool: Arc::clone(&self.pool),
            pinned: Arc::clone(&self.pinned),
            id: TransactionId::next(),
            depth,
            finished: AtomicBool::new(false),
        };

        let outcome = handler(&child).await;
        child.finished.store(true, Ordering::SeqCst);

        match outcome {
            Ok(value) => {
                lifecycle(&self.pinned, &format!("RELEASE SAVEPOINT {savepoint}"))
                    .await?;
                Ok(value)
            }
            Err(error) => {
                let _ =
                    lifecycle(&self.pinned, &format!("ROLLBACK TO SAVEPOINT {savepoint}")).await;
                Err(error)
            }
        }
    }
}

impl_query_methods!(TransactionConnection);

/// Savepoints are named after the nesting depth they guard; the first
/// nested level is depth 2.
fn savepoint_name(depth: usize) -> String {
    format!("tusker_{depth}")
}

/// Run a top-level transaction on `pinned`. Every retry rolls the
/// failed attempt back cleanly, restarts the transaction, and invokes
/// the handler afresh on the same connection.
pub(crate) async fn run_transaction<T, F>(
    pool: &Arc<PoolInner>,
    pinned: &Arc<Pinned>,
    retry_limit: u32,
    handler: &F,
) -> Result<T, TuskerError>
where
    T: Send,
    F: for<'c> Fn(&'c TransactionConnection) -> BoxFuture<'c, Result<T, TuskerError>>
        + Send
        + Sync,
{
    let mut attempt: u32 = 0;
    loop {
        lifecycle(pinned, "START TRANSACTION").await?;
        let tx = TransactionConnection {
            pool: Arc::clone(pool),
            pinned: Arc::clone(pinned),
            id: TransactionId::next(),
            depth: 1,
            finished: AtomicBool::new(false),
        };
        debug!(transaction_id = %tx.id, attempt, "transaction started");

        let outcome = handler(&tx).await;
        tx.finished.store(true, Ordering::SeqCst);

        let error = match outcome {
            Ok(value) => match lifecycle(pinned, "COMMIT").await {
                Ok(()) => return Ok(value),
                Err(commit_error) => {
                    // The server has already rolled back a failed
                    // commit; the explicit rollback clears the aborted
                    // state marker.
                    let _ = lifecycle(pinned, "ROLLBACK").await;
                    commit_error
                }
            },
            Err(handler_error) => {
                let _ = lifecycle(pinned, "ROLLBACK").await;
                handler_error
            }
        };

        if error.is_transaction_rollback() && attempt < retry_limit {
            attempt += 1;
            warn!(attempt, "transaction retried after rollback error");
            continue;
        }
        return Err(error);
    }
}

/// Transaction lifecycle statements run straight against the pinned
/// driver connection; interceptors observe user queries only.
async fn lifecycle(pinned: &Arc<Pinned>, sql: &str) -> Result<(), TuskerError> {
    let mut slot = pinned.try_borrow()?;
    let pooled = slot.as_mut().ok_or_else(|| {
        TuskerError::UnexpectedState("transaction connection already released".into())
    })?;
    debug!(sql, "transaction lifecycle statement");
    match pooled.conn.execute(sql, &[]).await {
        Ok(_) => Ok(()),
        Err(error) => Err(TuskerError::from_driver(QueryErrorDetail {
            query_id: QueryId::next(),
            sql: sql.to_string(),
            values: Vec::new(),
            message: error.message.clone(),
            sqlstate: error.sqlstate.clone(),
            source: Some(error),
        })),
    }
}
