//! Cursor-backed streaming: rows are fetched in batches and delivered
//! to a sink one at a time. The cursor is closed and the connection
//! released on sink failure, early error, and completion alike.

use std::sync::Arc;

use tracing::debug;

use crate::driver::DriverConnection;
use crate::error::TuskerError;
use crate::executor::{
    Binding, CheckoutGuard, QueryContext, QueryOrigin, TransactionId, driver_detail,
    poisons_connection,
};
use crate::interpreter::{Query, interpret};
use crate::pool::PoolInner;
use crate::row::{QueryResult, Row};
use crate::schema::RowSchema;
use crate::sql::RawSql;

pub(crate) async fn run_stream<F>(
    pool: &Arc<PoolInner>,
    binding: Binding<'_>,
    origin: QueryOrigin,
    transaction_id: Option<TransactionId>,
    fragment: &RawSql,
    batch_size: usize,
    mut sink: F,
) -> Result<u64, TuskerError>
where
    F: FnMut(Row) -> Result<(), TuskerError> + Send,
{
    let ctx = QueryContext::new(
        pool.pool_id,
        origin,
        transaction_id,
        match &binding {
            Binding::Pool => None,
            Binding::Pinned(pinned) => Some(pinned.connection_id),
        },
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

    let batch_size = batch_size.max(1);
    let schema = fragment.schema.clone();

    match binding {
        Binding::Pool => {
            let pooled = pool.acquire().await?;
            ctx.bind_connection(pooled.id);
            let mut guard = CheckoutGuard::new(pool, pooled);
            let outcome = match guard.conn.as_mut() {
                Some(pooled) => {
                    stream_rows(
                        pool,
                        &mut pooled.conn,
                        &ctx,
                        &query,
                        schema.as_deref(),
                        batch_size,
                        &mut sink,
                    )
                    .await
                }
                None => Err(TuskerError::UnexpectedState(
                    "checkout lost its connection".into(),
                )),
            };
            let destroy = outcome.as_ref().is_err_and(poisons_connection);
            guard.finish(destroy);
            outcome
        }
        Binding::Pinned(pinned) => {
            let mut slot = pinned.try_borrow()?;
            match slot.as_mut() {
                Some(pooled) => {
                    stream_rows(
                        pool,
                        &mut pooled.conn,
                        &ctx,
                        &query,
                        schema.as_deref(),
                        batch_size,
                        &mut sink,
                    )
                    .await
                }
                None => Err(TuskerError::UnexpectedState(
                    "connection handle already released".into(),
                )),
            }
        }
    }
}

async fn stream_rows<F>(
    pool: &Arc<PoolInner>,
    conn: &mut Box<dyn DriverConnection>,
    ctx: &QueryContext,
    query: &Query,
    schema: Option<&dyn RowSchema>,
    batch_size: usize,
    sink: &mut F,
) -> Result<u64, TuskerError>
where
    F: FnMut(Row) -> Result<(), TuskerError> + Send,
{
    let cursor = format!("tusker_cursor_{}", ctx.query_id);
    conn.open_cursor(&cursor, &query.sql, &query.values)
        .await
        .map_err(|error| TuskerError::from_driver(driver_detail(ctx, query, error)))?;
    debug!(query_id = %ctx.query_id, cursor, batch_size, "stream opened");

    let outcome = drain_cursor(pool, conn, &cursor, ctx, query, schema, batch_size, sink).await;

    // Closed on every path; a close failure only surfaces when the
    // stream itself succeeded.
    let closed = conn.close_cursor(&cursor).await;
    match (outcome, closed) {
        (Err(error), _) => Err(error),
        (Ok(_), Err(error)) => Err(TuskerError::from_driver(driver_detail(ctx, query, error))),
        (Ok(delivered), Ok(())) => Ok(delivered),
    }
}

#[allow(clippy::too_many_arguments)]
async fn drain_cursor<F>(
    pool: &Arc<PoolInner>,
    conn: &mut Box<dyn DriverConnection>,
    cursor: &str,
    ctx: &QueryContext,
    query: &Query,
    schema: Option<&dyn RowSchema>,
    batch_size: usize,
    sink: &mut F,
) -> Result<u64, TuskerError>
where
    F: FnMut(Row) -> Result<(), TuskerError> + Send,
{
    let mut delivered: u64 = 0;
    loop {
        let batch = conn
            .fetch_from_cursor(cursor, batch_size)
            .await
            .map_err(|error| TuskerError::from_driver(driver_detail(ctx, query, error)))?;
        if batch.rows.is_empty() {
            return Ok(delivered);
        }

        let materialised = QueryResult::from_execution(batch);
        for mut row in materialised.rows {
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
                        detail: Box::new(crate::error::QueryErrorDetail {
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
            sink(row)?;
            delivered += 1;
        }
    }
}
