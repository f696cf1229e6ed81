//! The middleware chain. An interceptor is a bundle of optional hooks
//! invoked at fixed pipeline points, in registration order. Every hook
//! has a no-op default, so implementations override only what they
//! need:
//!
//! ```rust
//! use async_trait::async_trait;
//! use tusker::{Interceptor, QueryContext, Query, TuskerError};
//!
//! struct CommentTagger;
//!
//! #[async_trait]
//! impl Interceptor for CommentTagger {
//!     async fn transform_query(
//!         &self,
//!         _ctx: &QueryContext,
//!         mut query: Query,
//!     ) -> Result<Query, TuskerError> {
//!         query.sql.push_str(" /* tagged */");
//!         Ok(query)
//!     }
//! }
//! ```

use async_trait::async_trait;

use crate::error::TuskerError;
use crate::executor::QueryContext;
use crate::interpreter::Query;
use crate::pool::DatabasePool;
use crate::row::{QueryResult, Row};

#[async_trait]
pub trait Interceptor: Send + Sync {
    /// Observational; runs before the token tree is interpreted.
    async fn before_transform_query(&self, _ctx: &QueryContext) -> Result<(), TuskerError> {
        Ok(())
    }

    /// Replace the interpreted query. Hooks run in order, each seeing
    /// the previous hook's output; the final form goes to the driver.
    async fn transform_query(
        &self,
        _ctx: &QueryContext,
        query: Query,
    ) -> Result<Query, TuskerError> {
        Ok(query)
    }

    /// Re-route a pool query to another pool. The first hook returning
    /// a pool wins. Only runs for queries issued directly on a pool.
    async fn before_pool_connection(
        &self,
        _ctx: &QueryContext,
        _query: &Query,
    ) -> Result<Option<DatabasePool>, TuskerError> {
        Ok(None)
    }

    /// Short-circuit execution with a synthetic result; used by mocks
    /// and caches. The first hook returning a result wins.
    async fn before_query_execution(
        &self,
        _ctx: &QueryContext,
        _query: &Query,
    ) -> Result<Option<QueryResult>, TuskerError> {
        Ok(None)
    }

    /// Observational; runs after a successful driver call, before rows
    /// are transformed.
    async fn before_query_result(
        &self,
        _ctx: &QueryContext,
        _query: &Query,
        _result: &QueryResult,
    ) -> Result<(), TuskerError> {
        Ok(())
    }

    /// Observational; runs when the driver call failed, after the error
    /// has been mapped onto the taxonomy.
    async fn query_execution_error(
        &self,
        _ctx: &QueryContext,
        _query: &Query,
        _error: &TuskerError,
    ) -> Result<(), TuskerError> {
        Ok(())
    }

    /// Reshape one row. Applied to every row, in registration order,
    /// before the row schema runs.
    fn transform_row(
        &self,
        _ctx: &QueryContext,
        _query: &Query,
        row: Row,
    ) -> Result<Row, TuskerError> {
        Ok(row)
    }

    /// Observational; runs after the result is fully materialised.
    async fn after_query_execution(
        &self,
        _ctx: &QueryContext,
        _query: &Query,
        _result: &QueryResult,
    ) -> Result<(), TuskerError> {
        Ok(())
    }
}
