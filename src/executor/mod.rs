//! The execution pipeline: context creation, interceptor ordering,
//! timeout enforcement, retry, error mapping, and the row pipeline.

mod context;
pub(crate) mod shape;

pub use context::{ConnectionId, PoolId, QueryContext, QueryId, QueryOrigin, TransactionId};

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use crate::config::Timeout;
use crate::connection::Pinned;
use crate::driver::{DriverConnection, DriverError, ExecutionResult};
use crate::error::{QueryErrorDetail, TuskerError};
use crate::interpreter::{Query, interpret};
use crate::pool::{PoolInner, PooledConnection};
use crate::row::QueryResult;
use crate::schema::RowSchema;
use crate::sql::RawSql;

/// A pipeline outcome bundled with the query that produced it, so shape
/// functions can report precise errors.
pub(crate) struct Executed {
    pub(crate) query_id: QueryId,
    pub(crate) query: Query,
    pub(crate) result: QueryResult,
}

/// How a query reaches a physical connection.
pub(crate) enum Binding<'a> {
    /// Acquire from the pool for this query, release right after.
    Pool,
    /// Use the handle's pinned connection.
    Pinned(&'a Pinned),
}

impl Binding<'_> {
    fn connection_id(&self) -> Option<ConnectionId> {
        match self {
            Binding::Pool => None,
            Binding::Pinned(pinned) => Some(pinned.connection_id),
        }
    }
}

pub(crate) async fn run_query(
    pool: &Arc<PoolInner>,
    binding: Binding<'_>,
    origin: QueryOrigin,
    transaction_id: Option<TransactionId>,
    fragment: &RawSql,
) -> Result<Executed, TuskerError> {
    let ctx = QueryContext::new(
        pool.pool_id,
        origin,
        transaction_id,
        binding.connection_id(),
        pool.config.capture_stack_trace,
    );

    for interceptor in &pool.config.interceptors {
        interceptor.before_transform_query(&ctx).await?;
    }

    let original = interpret(fragment)?;
    ctx.record_original_query(original.clone());
    let mut query = original;
    for interceptor in &pool.config.interceptors {
        query = interceptor.transform_query(&ctx, query).await?;
    }

    for interceptor in &pool.config.interceptors {
        if let Some(result) = interceptor.before_query_execution(&ctx, &query).await? {
            debug!(query_id = %ctx.query_id, "execution short-circuited by interceptor");
            return Ok(Executed {
                query_id: ctx.query_id,
                query,
                result,
            });
        }
    }

    if origin == QueryOrigin::ImplicitQuery {
        for interceptor in &pool.config.interceptors {
            if let Some(alternate) = interceptor.before_pool_connection(&ctx, &query).await? {
                debug!(query_id = %ctx.query_id, "query re-routed to an alternate pool");
                return execute_on(
                    &alternate.inner,
                    Binding::Pool,
                    &ctx,
                    query,
                    fragment.schema.clone(),
                )
                .await;
            }
        }
    }

    execute_on(pool, binding, &ctx, query, fragment.schema.clone()).await
}

/// Releases a per-query checkout on every exit path, including futures
/// dropped mid-flight; a drop without an explicit finish destroys the
/// connection since its state is unknown.
pub(crate) struct CheckoutGuard<'p> {
    pool: &'p PoolInner,
    pub(crate) conn: Option<PooledConnection>,
}

impl<'p> CheckoutGuard<'p> {
    pub(crate) fn new(pool: &'p PoolInner, conn: PooledConnection) -> Self {
        Self {
            pool,
            conn: Some(conn),
        }
    }

    pub(crate) fn finish(mut self, destroy: bool) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn, destroy);
        }
    }
}

impl Drop for CheckoutGuard<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn, true);
        }
    }
}

/// Whether an error leaves the physical connection unusable.
pub(crate) fn poisons_connection(error: &TuskerError) -> bool {
    matches!(error, TuskerError::BackendTerminated(_))
}

async fn execute_on(
    pool: &Arc<PoolInner>,
    binding: Binding<'_>,
    ctx: &QueryContext,
    query: Query,
    schema: Option<Arc<dyn RowSchema>>,
) -> Result<Executed, TuskerError> {
    let outcome = match binding {
        Binding::Pool => {
            let pooled = pool.acquire().await?;
            ctx.bind_connection(pooled.id);
            let mut guard = CheckoutGuard::new(pool, pooled);
            let outcome = match guard.conn.as_mut() {
                Some(pooled) => {
                    execute_attempts(pool, &mut pooled.conn, ctx, &query, schema.as_deref(), true)
                        .await
                }
                None => Err(TuskerError::UnexpectedState(
                    "checkout lost its connection".into(),
                )),
            };
            let destroy = outcome.as_ref().is_err_and(|e| poisons_connection(e));
            guard.finish(destroy);
            outcome
        }
        Binding::Pinned(pinned) => {
            let mut slot = pinned.try_borrow()?;
            match slot.as_mut() {
                Some(pooled) => {
                    // Standalone queries on an explicit connection are
                    // retried; queries inside a transaction are not,
                    // the transaction machinery retries as a whole.
                    let allow_retry = ctx.origin == QueryOrigin::Explicit;
                    execute_attempts(
                        pool,
                        &mut pooled.conn,
                        ctx,
                        &query,
                        schema.as_deref(),
                        allow_retry,
                    )
                    .await
                }
                None => Err(TuskerError::UnexpectedState(
                    "connection handle already released".into(),
                )),
            }
        }
    };

    outcome.map(|result| Executed {
        query_id: ctx.query_id,
        query,
        result,
    })
}

async fn execute_attempts(
    pool: &Arc<PoolInner>,
    conn: &mut Box<dyn DriverConnection>,
    ctx: &QueryContext,
    query: &Query,
    schema: Option<&dyn RowSchema>,
    allow_retry: bool,
) -> Result<QueryResult, TuskerError> {
    let retry_limit = if allow_retry {
        pool.config.query_retry_limit
    } else {
        0
    };
    let mut attempt: u32 = 0;
    loop {
        match execute_once(pool, conn, ctx, query, schema).await {
            Ok(result) => return Ok(result),
            Err(error) => {
                for interceptor in &pool.config.interceptors {
                    interceptor.query_execution_error(ctx, query, &error).await?;
                }
                if error.is_transaction_rollback() && attempt < retry_limit {
                    attempt += 1;
                    warn!(
                        query_id = %ctx.query_id,
                        attempt,
                        "statement retried after transaction rollback"
                    );
                    continue;
                }
                return Err(error);
            }
        }
    }
}

async fn execute_once(
    pool: &Arc<PoolInner>,
    conn: &mut Box<dyn DriverConnection>,
    ctx: &QueryContext,
    query: &Query,
    schema: Option<&dyn RowSchema>,
) -> Result<QueryResult, TuskerError> {
    let started = Instant::now();
    let raw = match execute_with_timeout(
        conn,
        &query.sql,
        &query.values,
        pool.config.statement_timeout,
    )
    .await
    {
        Ok(raw) => raw,
        Err(ExecFailure::Driver(error)) => {
            return Err(TuskerError::from_driver(driver_detail(ctx, query, error)));
        }
        Err(ExecFailure::TimedOut(error)) => {
            return Err(TuskerError::StatementTimeout(Box::new(driver_detail(
                ctx, query, error,
            ))));
        }
    };
    debug!(
        query_id = %ctx.query_id,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "statement executed"
    );

    let mut result = QueryResult::from_execution(raw);

    for interceptor in &pool.config.interceptors {
        interceptor.before_query_result(ctx, query, &result).await?;
    }

    if !pool.config.interceptors.is_empty() || schema.is_some() {
        let rows = std::mem::take(&mut result.rows);
        let mut shaped = Vec::with_capacity(rows.len());
        for mut row in rows {
            for interceptor in &pool.config.interceptors {
                row = interceptor.transform_row(ctx, query, row)?;
            }
            if let Some(schema) = schema {
                let seen = row.clone();
                row = schema.parse(row).map_err(|issues| {
                    let message = format!("row failed schema validation: {issues}");
                    TuskerError::SchemaValidation {
                        issues: issues.issues,
                        row: Box::new(seen),
                        detail: Box::new(QueryErrorDetail {
                            query_id: ctx.query_id,
                            sql: query.sql.clone(),
                            values: query.values.clone(),
                            message,
                            sqlstate: None,
                            source: None,
                        }),
                    }
                })?;
            }
            shaped.push(row);
        }
        result.rows = shaped;
    }

    for interceptor in &pool.config.interceptors {
        interceptor.after_query_execution(ctx, query, &result).await?;
    }

    Ok(result)
}

enum ExecFailure {
    Driver(DriverError),
    /// The statement exceeded the client-side deadline; the inner error
    /// is whatever the driver reported after the cancel.
    TimedOut(DriverError),
}

/// Race the driver call against the statement timeout. On expiry the
/// out-of-band cancel is issued first, then the call is awaited so the
/// outcome is deterministic.
async fn execute_with_timeout(
    conn: &mut Box<dyn DriverConnection>,
    sql: &str,
    values: &[crate::value::PrimitiveValue],
    statement_timeout: Timeout,
) -> Result<ExecutionResult, ExecFailure> {
    let Some(limit) = statement_timeout.as_duration() else {
        return conn.execute(sql, values).await.map_err(ExecFailure::Driver);
    };

    let cancel = conn.cancel_handle();
    let exec = conn.execute(sql, values);
    tokio::pin!(exec);
    match tokio::time::timeout(limit, &mut exec).await {
        Ok(result) => result.map_err(ExecFailure::Driver),
        Err(_) => {
            warn!("statement deadline exceeded, cancelling");
            let _ = cancel.cancel().await;
            match exec.await {
                // The call won the race against its own cancellation.
                Ok(result) => Ok(result),
                Err(error) => Err(ExecFailure::TimedOut(error)),
            }
        }
    }
}

pub(crate) fn driver_detail(
    ctx: &QueryContext,
    query: &Query,
    error: DriverError,
) -> QueryErrorDetail {
    QueryErrorDetail {
        query_id: ctx.query_id,
        sql: query.sql.clone(),
        values: query.values.clone(),
        message: error.message.clone(),
        sqlstate: error.sqlstate.clone(),
        source: Some(error),
    }
}
