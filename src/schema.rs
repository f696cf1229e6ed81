use std::fmt;

use crate::row::Row;

/// Pluggable row validation. A schema receives each parsed, transformed
/// row and either returns it (possibly reshaped) or rejects it with a
/// report; rejection surfaces as `TuskerError::SchemaValidation`.
///
/// The crate never inspects rows itself beyond column counts; what a
/// "valid" row means is entirely the schema's business.
pub trait RowSchema: Send + Sync {
    /// Validate one row.
    ///
    /// # Errors
    /// Returns the schema's issue report when the row is rejected.
    fn parse(&self, row: Row) -> Result<Row, SchemaIssues>;
}

/// The error report produced by a rejecting schema.
#[derive(Debug, Clone, Default)]
pub struct SchemaIssues {
    pub issues: Vec<String>,
}

impl SchemaIssues {
    #[must_use]
    pub fn new(issues: Vec<String>) -> Self {
        Self { issues }
    }

    #[must_use]
    pub fn single(issue: impl Into<String>) -> Self {
        Self {
            issues: vec![issue.into()],
        }
    }
}

impl fmt::Display for SchemaIssues {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.issues.join("; "))
    }
}
