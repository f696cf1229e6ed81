use std::backtrace::Backtrace;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

use crate::interpreter::Query;

macro_rules! sequential_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(u64);

        impl $name {
            pub(crate) fn next() -> Self {
                static NEXT: AtomicU64 = AtomicU64::new(1);
                Self(NEXT.fetch_add(1, Ordering::Relaxed))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

sequential_id!(
    /// Unique per user-visible query call.
    QueryId
);
sequential_id!(
    /// Unique per pool.
    PoolId
);
sequential_id!(
    /// Unique per top-level transaction.
    TransactionId
);

/// Stable across pool reuse: the same physical connection keeps its id
/// from connect to close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How the query reached the pipeline; drives interceptor context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOrigin {
    /// On an explicit connection obtained with `connect`.
    Explicit,
    /// Directly on the pool; a connection is acquired per query.
    ImplicitQuery,
    /// Inside a transaction, on its pinned connection.
    ImplicitTransaction,
}

/// Created once per user-visible query call and passed by reference
/// into every interceptor hook.
pub struct QueryContext {
    pub query_id: QueryId,
    pub pool_id: PoolId,
    pub origin: QueryOrigin,
    pub transaction_id: Option<TransactionId>,
    /// Monotonic submission timestamp.
    pub submitted_at: Instant,
    /// Trimmed call-site capture, when enabled.
    pub stack_trace: Option<String>,
    /// Per-query scratch space shared by the interceptor chain.
    pub sandbox: Mutex<HashMap<String, serde_json::Value>>,
    connection_id: OnceLock<ConnectionId>,
    original_query: OnceLock<Query>,
}

impl QueryContext {
    pub(crate) fn new(
        pool_id: PoolId,
        origin: QueryOrigin,
        transaction_id: Option<TransactionId>,
        connection_id: Option<ConnectionId>,
        capture_stack_trace: bool,
    ) -> Self {
        let slot = OnceLock::new();
        if let Some(id) = connection_id {
            let _ = slot.set(id);
        }
        Self {
            query_id: QueryId::next(),
            pool_id,
            origin,
            transaction_id,
            submitted_at: Instant::now(),
            stack_trace: capture_stack_trace.then(capture_call_sites),
            sandbox: Mutex::new(HashMap::new()),
            connection_id: slot,
            original_query: OnceLock::new(),
        }
    }

    /// The connection this query ran on. For pool queries this is set
    /// once a connection has been acquired, so hooks running earlier
    /// observe `None`.
    #[must_use]
    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.connection_id.get().copied()
    }

    /// The interpreted query before any `transform_query` hook ran.
    /// `None` only in hooks that run before interpretation.
    #[must_use]
    pub fn original_query(&self) -> Option<&Query> {
        self.original_query.get()
    }

    pub(crate) fn bind_connection(&self, id: ConnectionId) {
        let _ = self.connection_id.set(id);
    }

    pub(crate) fn record_original_query(&self, query: Query) {
        let _ = self.original_query.set(query);
    }
}

impl fmt::Debug for QueryContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryContext")
            .field("query_id", &self.query_id)
            .field("pool_id", &self.pool_id)
            .field("origin", &self.origin)
            .field("transaction_id", &self.transaction_id)
            .field("connection_id", &self.connection_id.get())
            .finish()
    }
}

/// Capture the calling frames, dropping the capture machinery itself
/// and bounding the depth so contexts stay cheap to keep around.
fn capture_call_sites() -> String {
    let backtrace = Backtrace::force_capture().to_string();
    let mut lines: Vec<&str> = backtrace.lines().collect();
    if lines.len() > 48 {
        lines.truncate(48);
    }
    lines.join("\n")
}
