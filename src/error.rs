use thiserror::Error;

use crate::driver::DriverError;
use crate::executor::QueryId;
use crate::value::PrimitiveValue;

/// Context attached to every error raised while executing a statement:
/// the originating query id, the SQL text and bind values as sent to the
/// driver, and the driver-level cause when there is one.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct QueryErrorDetail {
    pub query_id: QueryId,
    pub sql: String,
    pub values: Vec<PrimitiveValue>,
    pub message: String,
    pub sqlstate: Option<String>,
    #[source]
    pub source: Option<DriverError>,
}

#[derive(Debug, Error)]
pub enum TuskerError {
    /// Bad input to the fragment builder: non-finite number, reserved
    /// placeholder in a literal, width-mismatched unnest, and the like.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Pool acquisition failed: timeout while waiting, or the connect
    /// retry budget was exhausted.
    #[error("connection failure: {0}")]
    Connection(String),

    /// The pool was ended with `end()` and refuses new work.
    #[error("pool has ended")]
    PoolEnded,

    /// A pinned handle (explicit connection or transaction) was used by
    /// two callers at once.
    #[error("connection handle is already in use")]
    Concurrency,

    #[error("statement timed out")]
    StatementTimeout(#[source] Box<QueryErrorDetail>),

    #[error("server aborted an idle transaction")]
    IdleTransactionTimeout(#[source] Box<QueryErrorDetail>),

    /// SQLSTATE class 40. The only error class that is retried
    /// automatically.
    #[error("transaction was rolled back by the server")]
    TransactionRollback(#[source] Box<QueryErrorDetail>),

    #[error("query returned no rows")]
    NotFound(#[source] Box<QueryErrorDetail>),

    /// A shape function's row or column cardinality check failed.
    #[error("data integrity: {message}")]
    DataIntegrity {
        message: String,
        #[source]
        detail: Box<QueryErrorDetail>,
    },

    /// The row schema attached to the query rejected a row.
    #[error("row failed schema validation")]
    SchemaValidation {
        issues: Vec<String>,
        /// The row that failed, as it looked when the schema saw it.
        row: Box<crate::row::Row>,
        #[source]
        detail: Box<QueryErrorDetail>,
    },

    #[error("unique constraint violation")]
    UniqueConstraintViolation(#[source] Box<QueryErrorDetail>),

    #[error("foreign key constraint violation")]
    ForeignKeyConstraintViolation(#[source] Box<QueryErrorDetail>),

    #[error("not null constraint violation")]
    NotNullConstraintViolation(#[source] Box<QueryErrorDetail>),

    #[error("check constraint violation")]
    CheckConstraintViolation(#[source] Box<QueryErrorDetail>),

    #[error("tuple moved to another partition")]
    TupleMovedToAnotherPartition(#[source] Box<QueryErrorDetail>),

    #[error("backend terminated the connection")]
    BackendTerminated(#[source] Box<QueryErrorDetail>),

    #[error("input syntax error")]
    InputSyntax(#[source] Box<QueryErrorDetail>),

    /// Driver failure with no more specific mapping.
    #[error("query failed: {}", .0.message)]
    QueryFailed(#[source] Box<QueryErrorDetail>),

    /// An internal invariant was broken.
    #[error("unexpected state: {0}")]
    UnexpectedState(String),
}

impl TuskerError {
    /// Map a failed driver call onto the taxonomy by SQLSTATE.
    pub(crate) fn from_driver(detail: QueryErrorDetail) -> Self {
        let detail = Box::new(detail);
        let moved = detail.message.contains("moved to another partition");
        match detail.sqlstate.as_deref() {
            Some("23505") => TuskerError::UniqueConstraintViolation(detail),
            Some("23503") => TuskerError::ForeignKeyConstraintViolation(detail),
            Some("23502") => TuskerError::NotNullConstraintViolation(detail),
            Some("23514") => TuskerError::CheckConstraintViolation(detail),
            Some("57014") => TuskerError::StatementTimeout(detail),
            Some("25P03") => TuskerError::IdleTransactionTimeout(detail),
            Some("57P01") => TuskerError::BackendTerminated(detail),
            Some("42601") => TuskerError::InputSyntax(detail),
            Some(s) if s.starts_with("40") => TuskerError::TransactionRollback(detail),
            _ if moved => TuskerError::TupleMovedToAnotherPartition(detail),
            _ => TuskerError::QueryFailed(detail),
        }
    }

    /// The SQLSTATE carried by this error, when it originated from the
    /// server.
    #[must_use]
    pub fn sqlstate(&self) -> Option<&str> {
        self.detail().and_then(|d| d.sqlstate.as_deref())
    }

    /// Statement context (query id, sql, values) when this error was
    /// raised on the execution path.
    #[must_use]
    pub fn detail(&self) -> Option<&QueryErrorDetail> {
        match self {
            TuskerError::StatementTimeout(d)
            | TuskerError::IdleTransactionTimeout(d)
            | TuskerError::TransactionRollback(d)
            | TuskerError::NotFound(d)
            | TuskerError::DataIntegrity { detail: d, .. }
            | TuskerError::SchemaValidation { detail: d, .. }
            | TuskerError::UniqueConstraintViolation(d)
            | TuskerError::ForeignKeyConstraintViolation(d)
            | TuskerError::NotNullConstraintViolation(d)
            | TuskerError::CheckConstraintViolation(d)
            | TuskerError::TupleMovedToAnotherPartition(d)
            | TuskerError::BackendTerminated(d)
            | TuskerError::InputSyntax(d)
            | TuskerError::QueryFailed(d) => Some(d),
            _ => None,
        }
    }

    /// SQLSTATE class 40 is the sole class retried automatically, for
    /// both standalone queries and top-level transactions.
    #[must_use]
    pub fn is_transaction_rollback(&self) -> bool {
        matches!(self, TuskerError::TransactionRollback(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detail(sqlstate: Option<&str>, message: &str) -> QueryErrorDetail {
        QueryErrorDetail {
            query_id: QueryId::next(),
            sql: "SELECT 1".into(),
            values: vec![],
            message: message.into(),
            sqlstate: sqlstate.map(str::to_string),
            source: None,
        }
    }

    #[test]
    fn maps_integrity_constraint_subcodes() {
        assert!(matches!(
            TuskerError::from_driver(detail(Some("23505"), "dup")),
            TuskerError::UniqueConstraintViolation(_)
        ));
        assert!(matches!(
            TuskerError::from_driver(detail(Some("23503"), "fk")),
            TuskerError::ForeignKeyConstraintViolation(_)
        ));
        assert!(matches!(
            TuskerError::from_driver(detail(Some("23502"), "null")),
            TuskerError::NotNullConstraintViolation(_)
        ));
        assert!(matches!(
            TuskerError::from_driver(detail(Some("23514"), "check")),
            TuskerError::CheckConstraintViolation(_)
        ));
    }

    #[test]
    fn class_40_is_retryable() {
        let err = TuskerError::from_driver(detail(Some("40001"), "serialization failure"));
        assert!(err.is_transaction_rollback());
        let err = TuskerError::from_driver(detail(Some("40P01"), "deadlock detected"));
        assert!(err.is_transaction_rollback());
        let err = TuskerError::from_driver(detail(Some("23505"), "dup"));
        assert!(!err.is_transaction_rollback());
    }

    #[test]
    fn maps_timeouts_and_termination() {
        assert!(matches!(
            TuskerError::from_driver(detail(Some("57014"), "canceling statement")),
            TuskerError::StatementTimeout(_)
        ));
        assert!(matches!(
            TuskerError::from_driver(detail(Some("25P03"), "idle-in-transaction timeout")),
            TuskerError::IdleTransactionTimeout(_)
        ));
        assert!(matches!(
            TuskerError::from_driver(detail(Some("57P01"), "terminating connection")),
            TuskerError::BackendTerminated(_)
        ));
    }

    #[test]
    fn maps_partition_moves_by_message() {
        let err = TuskerError::from_driver(detail(
            None,
            "tuple to be locked was already moved to another partition due to concurrent update",
        ));
        assert!(matches!(err, TuskerError::TupleMovedToAnotherPartition(_)));
    }

    #[test]
    fn unmapped_states_fall_through() {
        let err = TuskerError::from_driver(detail(Some("42P01"), "relation does not exist"));
        assert!(matches!(err, TuskerError::QueryFailed(_)));
        assert_eq!(err.sqlstate(), Some("42P01"));
    }
}
