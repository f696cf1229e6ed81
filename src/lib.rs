/*!
 * tusker - a PostgreSQL client toolkit
 *
 * This crate provides safe SQL composition, typed result parsing, and a
 * connection/transaction lifecycle manager with interceptors and
 * retries. Queries are assembled as token trees (never by string
 * concatenation of user data), flattened into a single parameterised
 * statement, executed on a pooled or transaction-pinned connection, and
 * parsed into typed rows.
 *
 * # Example
 *
 * ```rust,no_run
 * use tusker::prelude::*;
 *
 * async fn example() -> Result<(), TuskerError> {
 *     let pool = tusker::create_pool(
 *         "postgres://app@localhost/app",
 *         ClientConfiguration::default(),
 *     )?;
 *
 *     // Values travel as bind parameters; identifiers are quoted.
 *     let row = pool
 *         .one(sql::tagged(
 *             &["SELECT name FROM users WHERE id = ", ""],
 *             vec![42.into()],
 *         )?)
 *         .await?;
 *     println!("name = {:?}", row.get("name"));
 *
 *     // Transactions retry on serialization failures.
 *     pool.transaction(|tx| {
 *         Box::pin(async move {
 *             tx.query(sql::tagged(
 *                 &["UPDATE accounts SET balance = balance - ", ""],
 *                 vec![100.into()],
 *             )?)
 *             .await?;
 *             Ok(())
 *         })
 *     })
 *     .await?;
 *
 *     pool.end().await;
 *     Ok(())
 * }
 * ```
 */

#![forbid(unsafe_code)]

// Core modules
pub mod config;
pub mod driver;
pub mod error;
pub mod interceptor;
pub mod interpreter;
pub mod schema;
pub mod sql;
pub mod testing;
pub mod type_registry;
pub mod value;

mod connection;
mod copy;
mod executor;
mod pool;
mod row;
mod stream;
mod transaction;

// Re-export everything that should be part of the public API
pub mod prelude {
    //! Convenient imports for common functionality.

    pub use crate::config::{ClientConfiguration, ConnectionOptions, SslMode, Timeout};
    pub use crate::error::TuskerError;
    pub use crate::interceptor::Interceptor;
    pub use crate::interpreter::Query;
    pub use crate::pool::{DatabasePool, PoolState};
    pub use crate::row::{QueryResult, Row};
    pub use crate::schema::{RowSchema, SchemaIssues};
    pub use crate::sql;
    pub use crate::value::PrimitiveValue;

    #[cfg(feature = "postgres")]
    pub use crate::pool::create_pool;
}

// Direct exports of frequently used types
pub use config::{ClientConfiguration, ConnectionOptions, SslMode, Timeout};
pub use connection::PoolConnection;
pub use error::{QueryErrorDetail, TuskerError};
pub use executor::{ConnectionId, PoolId, QueryContext, QueryId, QueryOrigin, TransactionId};
pub use interceptor::Interceptor;
pub use interpreter::{Query, interpret};
pub use pool::{DatabasePool, PoolState};
pub use row::{QueryResult, Row};
pub use schema::{RowSchema, SchemaIssues};
pub use sql::{RawSql, SqlExpression, SqlToken, TypeSpec};
pub use transaction::TransactionConnection;
pub use type_registry::{TypeParser, TypeRegistry};
pub use value::PrimitiveValue;

#[cfg(feature = "postgres")]
pub use pool::create_pool;
