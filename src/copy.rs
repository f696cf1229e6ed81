//! Binary COPY IN: the statement is interpreted like any other
//! fragment, the pre-typed tuples go straight to the driver.

use std::sync::Arc;

use tracing::debug;

use crate::error::TuskerError;
use crate::executor::{
    Binding, CheckoutGuard, QueryContext, QueryOrigin, driver_detail, poisons_connection,
};
use crate::interpreter::interpret;
use crate::pool::PoolInner;
use crate::sql::RawSql;
use crate::value::PrimitiveValue;

pub(crate) async fn run_copy(
    pool: &Arc<PoolInner>,
    binding: Binding<'_>,
    fragment: &RawSql,
    tuples: &[Vec<PrimitiveValue>],
    column_types: &[String],
) -> Result<u64, TuskerError> {
    if column_types.is_empty() {
        return Err(TuskerError::InvalidInput(
            "copy requires at least one column type".into(),
        ));
    }
    for (index, tuple) in tuples.iter().enumerate() {
        if tuple.len() != column_types.len() {
            return Err(TuskerError::InvalidInput(format!(
                "copy tuple {} has {} members, expected {}",
                index,
                tuple.len(),
                column_types.len()
            )));
        }
        for value in tuple {
            value.ensure_finite()?;
        }
    }

    let query = interpret(fragment)?;
    if !query.values.is_empty() {
        return Err(TuskerError::InvalidInput(
            "a copy statement cannot carry bind values".into(),
        ));
    }

    let ctx = QueryContext::new(
        pool.pool_id,
        match binding {
            Binding::Pool => QueryOrigin::ImplicitQuery,
            Binding::Pinned(_) => QueryOrigin::Explicit,
        },
        None,
        match &binding {
            Binding::Pool => None,
            Binding::Pinned(pinned) => Some(pinned.connection_id),
        },
        pool.config.capture_stack_trace,
    );
    debug!(query_id = %ctx.query_id, rows = tuples.len(), "binary copy started");

    match binding {
        Binding::Pool => {
            let pooled = pool.acquire().await?;
            ctx.bind_connection(pooled.id);
            let mut guard = CheckoutGuard::new(pool, pooled);
            let outcome = match guard.conn.as_mut() {
                Some(pooled) => pooled
                    .conn
                    .copy_in_binary(&query.sql, column_types, tuples)
                    .await
                    .map_err(|error| {
                        TuskerError::from_driver(driver_detail(&ctx, &query, error))
                    }),
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
                Some(pooled) => pooled
                    .conn
                    .copy_in_binary(&query.sql, column_types, tuples)
                    .await
                    .map_err(|error| {
                        TuskerError::from_driver(driver_detail(&ctx, &query, error))
                    }),
                None => Err(TuskerError::UnexpectedState(
                    "connection handle already released".into(),
                )),
            }
        }
    }
}
