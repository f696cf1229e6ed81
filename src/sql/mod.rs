//! The SQL fragment algebra: a typed tree of tokens assembled by the
//! builder functions in this module and flattened by the interpreter
//! into one parameterised statement.
//!
//! Tokens are immutable after construction. Every variant carries only
//! values a caller cannot smuggle SQL through; the only way to inject
//! raw text is `tagged`'s fragment literals, which are written by the
//! caller, not derived from data.

mod builder;

pub use builder::{
    TypedSqlBuilder, array, binary, identifier, join, json, jsonb, literal_value, tagged, typed,
    unnest,
};

use std::fmt;
use std::sync::Arc;

use crate::schema::RowSchema;
use crate::value::PrimitiveValue;

/// Reserved local-placeholder prefix inside `RawSql::sql`. Generated by
/// `tagged`, consumed by the interpreter, forbidden in caller fragments.
pub(crate) const SENTINEL_PREFIX: &str = "$tusker_";

/// A raw SQL fragment: literal text with local placeholders
/// `$tusker_N`, N indexing into `values` (1-based, contiguous).
#[derive(Clone)]
pub struct RawSql {
    pub(crate) sql: String,
    pub(crate) values: Vec<SqlExpression>,
    pub(crate) schema: Option<Arc<dyn RowSchema>>,
}

impl RawSql {
    /// Attach a row schema; rows of the result are validated through it
    /// after parsing and row transforms.
    #[must_use]
    pub fn with_schema(mut self, schema: Arc<dyn RowSchema>) -> Self {
        self.schema = Some(schema);
        self
    }

    #[must_use]
    pub fn has_schema(&self) -> bool {
        self.schema.is_some()
    }
}

impl fmt::Debug for RawSql {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawSql")
            .field("sql", &self.sql)
            .field("values", &self.values)
            .field("schema", &self.schema.is_some())
            .finish()
    }
}

/// A value interleaved between fragment literals: either a primitive
/// bind value or a nested token expanded in place.
#[derive(Debug, Clone)]
pub enum SqlExpression {
    Value(PrimitiveValue),
    Token(SqlToken),
}

/// A node in the SQL fragment tree.
#[derive(Debug, Clone)]
pub enum SqlToken {
    Raw(RawSql),
    /// Renders as `"a"."b"` with embedded quotes doubled.
    Identifier(Vec<String>),
    /// One bind parameter cast to `member_type[]`.
    Array {
        values: Vec<PrimitiveValue>,
        member_type: TypeSpec,
    },
    /// One bind parameter cast to `bytea`.
    Binary(Vec<u8>),
    /// One bind parameter cast to `json`; serialised with deterministic
    /// key order.
    Json(serde_json::Value),
    /// One bind parameter cast to `jsonb`.
    JsonBinary(serde_json::Value),
    /// Members rendered in order with the glue fragment between them.
    List {
        members: Vec<SqlExpression>,
        glue: RawSql,
    },
    /// `unnest($1::T1[], …, $k::Tk[])`; tuples are transposed into one
    /// array bind parameter per column.
    Unnest {
        tuples: Vec<Vec<PrimitiveValue>>,
        column_types: Vec<TypeSpec>,
    },
}

/// A column or array member type: a bare type name, or a fragment for
/// types that need composition (e.g. `numeric(10, 2)`).
#[derive(Debug, Clone)]
pub enum TypeSpec {
    Name(String),
    Fragment(Box<RawSql>),
}

impl From<&str> for TypeSpec {
    fn from(name: &str) -> Self {
        TypeSpec::Name(name.to_string())
    }
}

impl From<String> for TypeSpec {
    fn from(name: String) -> Self {
        TypeSpec::Name(name)
    }
}

impl From<RawSql> for TypeSpec {
    fn from(fragment: RawSql) -> Self {
        TypeSpec::Fragment(Box::new(fragment))
    }
}

impl From<PrimitiveValue> for SqlExpression {
    fn from(value: PrimitiveValue) -> Self {
        SqlExpression::Value(value)
    }
}

impl From<SqlToken> for SqlExpression {
    fn from(token: SqlToken) -> Self {
        SqlExpression::Token(token)
    }
}

impl From<RawSql> for SqlExpression {
    fn from(fragment: RawSql) -> Self {
        SqlExpression::Token(SqlToken::Raw(fragment))
    }
}

impl From<bool> for SqlExpression {
    fn from(value: bool) -> Self {
        SqlExpression::Value(PrimitiveValue::Bool(value))
    }
}

impl From<i32> for SqlExpression {
    fn from(value: i32) -> Self {
        SqlExpression::Value(PrimitiveValue::Int(i64::from(value)))
    }
}

impl From<i64> for SqlExpression {
    fn from(value: i64) -> Self {
        SqlExpression::Value(PrimitiveValue::Int(value))
    }
}

impl From<f64> for SqlExpression {
    fn from(value: f64) -> Self {
        // Finiteness is re-checked at interpretation time.
        SqlExpression::Value(PrimitiveValue::Float(value))
    }
}

impl From<&str> for SqlExpression {
    fn from(value: &str) -> Self {
        SqlExpression::Value(PrimitiveValue::Text(value.to_string()))
    }
}

impl From<String> for SqlExpression {
    fn from(value: String) -> Self {
        SqlExpression::Value(PrimitiveValue::Text(value))
    }
}

impl From<Vec<u8>> for SqlExpression {
    fn from(value: Vec<u8>) -> Self {
        SqlExpression::Value(PrimitiveValue::Bytes(value))
    }
}
