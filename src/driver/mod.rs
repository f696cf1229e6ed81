//! The narrow seam between the query engine and a PostgreSQL wire
//! driver. The engine only ever talks to these traits; the bundled
//! tokio-postgres adapter lives in [`postgres`], and a scriptable
//! in-memory implementation lives in [`crate::testing`].

#[cfg(feature = "postgres")]
pub mod postgres;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::ConnectionOptions;
use crate::type_registry::TypeRegistry;
use crate::value::PrimitiveValue;

/// A failure reported by the wire driver, with the server's SQLSTATE
/// when one was sent.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct DriverError {
    pub message: String,
    pub sqlstate: Option<String>,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl DriverError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            sqlstate: None,
            source: None,
        }
    }

    #[must_use]
    pub fn with_sqlstate(mut self, sqlstate: impl Into<String>) -> Self {
        self.sqlstate = Some(sqlstate.into());
        self
    }

    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }
}

/// One result column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    /// PostgreSQL type name, e.g. `int8`. Empty for synthetic results.
    pub type_name: String,
}

/// A server notice (`RAISE NOTICE`, deprecation warnings, …).
#[derive(Debug, Clone)]
pub struct Notice {
    pub severity: String,
    pub code: Option<String>,
    pub message: String,
}

/// Raw outcome of one driver call. Cell values have already been run
/// through the type registry installed at connection initialisation.
#[derive(Debug, Clone, Default)]
pub struct ExecutionResult {
    pub command_tag: Option<String>,
    pub rows_affected: u64,
    pub fields: Vec<Field>,
    pub rows: Vec<Vec<PrimitiveValue>>,
    /// Notices emitted during this call and no other.
    pub notices: Vec<Notice>,
}

/// Opens physical connections. Implementations are cheap to share; the
/// pool holds one driver for its whole life.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Open a connection and install the type registry on it.
    async fn connect(
        &self,
        options: &ConnectionOptions,
        registry: &TypeRegistry,
    ) -> Result<Box<dyn DriverConnection>, DriverError>;
}

/// One physical connection. Never shared: at any instant a connection
/// is owned by at most one handle.
#[async_trait]
pub trait DriverConnection: Send {
    /// Execute a parameterised statement and materialise the result.
    async fn execute(
        &mut self,
        sql: &str,
        values: &[PrimitiveValue],
    ) -> Result<ExecutionResult, DriverError>;

    /// Declare a server-side cursor over `sql`.
    async fn open_cursor(
        &mut self,
        name: &str,
        sql: &str,
        values: &[PrimitiveValue],
    ) -> Result<(), DriverError>;

    /// Fetch the next batch from an open cursor. An empty row set means
    /// the cursor is exhausted.
    async fn fetch_from_cursor(
        &mut self,
        name: &str,
        batch_size: usize,
    ) -> Result<ExecutionResult, DriverError>;

    /// Close a cursor opened with [`DriverConnection::open_cursor`].
    async fn close_cursor(&mut self, name: &str) -> Result<(), DriverError>;

    /// Run a binary `COPY … FROM STDIN` with pre-typed tuples; returns
    /// the copied row count.
    async fn copy_in_binary(
        &mut self,
        sql: &str,
        column_types: &[String],
        tuples: &[Vec<PrimitiveValue>],
    ) -> Result<u64, DriverError>;

    /// Apply session parameters (`SET name = value`).
    async fn set_session_parameters(
        &mut self,
        parameters: &[(String, String)],
    ) -> Result<(), DriverError>;

    /// An out-of-band handle that can cancel whatever this connection
    /// is currently executing.
    fn cancel_handle(&self) -> Box<dyn CancelHandle>;

    /// Graceful shutdown. Dropping the connection also closes it.
    async fn close(&mut self) -> Result<(), DriverError>;
}

/// Out-of-band cancellation, usable while the owning connection is busy.
#[async_trait]
pub trait CancelHandle: Send {
    async fn cancel(&self) -> Result<(), DriverError>;
}
