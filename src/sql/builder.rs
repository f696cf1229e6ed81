use std::sync::Arc;

use crate::error::TuskerError;
use crate::schema::RowSchema;
use crate::value::PrimitiveValue;

use super::{RawSql, SENTINEL_PREFIX, SqlExpression, SqlToken, TypeSpec};

/// Tagged-template entry point: interleaves fragment literals with
/// value expressions.
///
/// `fragments` must be exactly one longer than `values`; the produced
/// fragment carries a local placeholder per value.
///
/// ```rust
/// use tusker::sql;
///
/// let q = sql::tagged(
///     &["SELECT id FROM users WHERE name = ", " AND active = ", ""],
///     vec!["alice".into(), true.into()],
/// )?;
/// # Ok::<(), tusker::TuskerError>(())
/// ```
///
/// # Errors
/// Returns `TuskerError::InvalidInput` on a fragment/value count
/// mismatch, or if a fragment literal contains the reserved placeholder
/// prefix.
pub fn tagged(fragments: &[&str], values: Vec<SqlExpression>) -> Result<RawSql, TuskerError> {
    if fragments.len() != values.len() + 1 {
        return Err(TuskerError::InvalidInput(format!(
            "expected {} fragments for {} values, got {}",
            values.len() + 1,
            values.len(),
            fragments.len()
        )));
    }

    let mut sql = String::new();
    for (index, fragment) in fragments.iter().enumerate() {
        if fragment.contains(SENTINEL_PREFIX) {
            return Err(TuskerError::InvalidInput(format!(
                "fragment literal contains the reserved placeholder prefix {SENTINEL_PREFIX}"
            )));
        }
        sql.push_str(fragment);
        if index < values.len() {
            sql.push_str(SENTINEL_PREFIX);
            sql.push_str(&(index + 1).to_string());
        }
    }

    Ok(RawSql {
        sql,
        values,
        schema: None,
    })
}

/// A dot-joined, quote-doubled identifier: `identifier(["u", "id"])`
/// renders `"u"."id"`.
pub fn identifier<I, S>(names: I) -> SqlToken
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    SqlToken::Identifier(names.into_iter().map(Into::into).collect())
}

/// An array bind parameter: renders `$k::member_type[]` with all
/// `values` bound as one array.
pub fn array<I>(values: I, member_type: impl Into<TypeSpec>) -> SqlToken
where
    I: IntoIterator<Item = PrimitiveValue>,
{
    SqlToken::Array {
        values: values.into_iter().collect(),
        member_type: member_type.into(),
    }
}

/// A `bytea` bind parameter.
pub fn binary(data: Vec<u8>) -> SqlToken {
    SqlToken::Binary(data)
}

/// A `json` bind parameter. Serialisation uses deterministic key order.
pub fn json(value: serde_json::Value) -> SqlToken {
    SqlToken::Json(value)
}

/// A `jsonb` bind parameter.
pub fn jsonb(value: serde_json::Value) -> SqlToken {
    SqlToken::JsonBinary(value)
}

/// Renders each member in order with `glue`'s SQL verbatim between
/// them. The glue must be a fragment with no values of its own.
pub fn join<I>(members: I, glue: RawSql) -> SqlToken
where
    I: IntoIterator<Item = SqlExpression>,
{
    SqlToken::List {
        members: members.into_iter().collect(),
        glue,
    }
}

/// `unnest($1::T1[], …, $k::Tk[])` over row tuples. Every tuple must be
/// exactly as wide as `column_types`.
pub fn unnest<I, T>(tuples: Vec<Vec<PrimitiveValue>>, column_types: I) -> SqlToken
where
    I: IntoIterator<Item = T>,
    T: Into<TypeSpec>,
{
    SqlToken::Unnest {
        tuples,
        column_types: column_types.into_iter().map(Into::into).collect(),
    }
}

/// An escaped string literal fragment: `literal_value("O'Reilly")`
/// renders `'O''Reilly'` inline, with no bind parameter.
#[must_use]
pub fn literal_value(value: &str) -> RawSql {
    let mut sql = String::with_capacity(value.len() + 2);
    sql.push('\'');
    for ch in value.chars() {
        if ch == '\'' {
            sql.push('\'');
        }
        sql.push(ch);
    }
    sql.push('\'');
    RawSql {
        sql,
        values: Vec::new(),
        schema: None,
    }
}

/// Combinator returning a builder whose `tagged` attaches `schema` to
/// the produced fragment.
#[must_use]
pub fn typed(schema: Arc<dyn RowSchema>) -> TypedSqlBuilder {
    TypedSqlBuilder { schema }
}

/// See [`typed`].
pub struct TypedSqlBuilder {
    schema: Arc<dyn RowSchema>,
}

impl TypedSqlBuilder {
    /// Tagged-template entry that carries the builder's row schema.
    ///
    /// # Errors
    /// Same conditions as the free [`tagged`] function.
    pub fn tagged(
        &self,
        fragments: &[&str],
        values: Vec<SqlExpression>,
    ) -> Result<RawSql, TuskerError> {
        Ok(tagged(fragments, values)?.with_schema(Arc::clone(&self.schema)))
    }
}
