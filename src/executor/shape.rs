//! Shape functions: row/column cardinality enforcement applied after
//! the pipeline returns.

use crate::error::{QueryErrorDetail, TuskerError};
use crate::interpreter::Query;
use crate::row::Row;
use crate::value::PrimitiveValue;

use super::{Executed, QueryId};

fn detail(query_id: QueryId, query: &Query, message: &str) -> Box<QueryErrorDetail> {
    Box::new(QueryErrorDetail {
        query_id,
        sql: query.sql.clone(),
        values: query.values.clone(),
        message: message.to_string(),
        sqlstate: None,
        source: None,
    })
}

fn integrity(query_id: QueryId, query: &Query, message: String) -> TuskerError {
    let boxed = detail(query_id, query, &message);
    TuskerError::DataIntegrity {
        message,
        detail: boxed,
    }
}

/// Exactly one row.
pub(crate) fn one(mut executed: Executed) -> Result<Row, TuskerError> {
    match executed.result.rows.len() {
        0 => Err(TuskerError::NotFound(detail(
            executed.query_id,
            &executed.query,
            "expected one row, the query returned none",
        ))),
        1 => Ok(executed.result.rows.remove(0)),
        count => Err(integrity(
            executed.query_id,
            &executed.query,
            format!("expected one row, the query returned {count}"),
        )),
    }
}

/// Zero or one row.
pub(crate) fn maybe_one(mut executed: Executed) -> Result<Option<Row>, TuskerError> {
    match executed.result.rows.len() {
        0 => Ok(None),
        1 => Ok(Some(executed.result.rows.remove(0))),
        count => Err(integrity(
            executed.query_id,
            &executed.query,
            format!("expected at most one row, the query returned {count}"),
        )),
    }
}

/// At least one row.
pub(crate) fn many(executed: Executed) -> Result<Vec<Row>, TuskerError> {
    if executed.result.rows.is_empty() {
        return Err(TuskerError::NotFound(detail(
            executed.query_id,
            &executed.query,
            "expected at least one row, the query returned none",
        )));
    }
    Ok(executed.result.rows)
}

/// Any number of rows.
pub(crate) fn any(executed: Executed) -> Result<Vec<Row>, TuskerError> {
    Ok(executed.result.rows)
}

fn single_column(query_id: QueryId, query: &Query, row: Row) -> Result<PrimitiveValue, TuskerError> {
    let width = row.len();
    if width != 1 {
        return Err(integrity(
            query_id,
            query,
            format!("expected the row to have one column, it has {width}"),
        ));
    }
    let mut values = row.into_values();
    match values.pop() {
        Some(value) => Ok(value),
        None => Err(TuskerError::UnexpectedState(
            "single-column row yielded no value".into(),
        )),
    }
}

pub(crate) fn one_first(executed: Executed) -> Result<PrimitiveValue, TuskerError> {
    let query_id = executed.query_id;
    let query = executed.query.clone();
    let row = one(executed)?;
    single_column(query_id, &query, row)
}

pub(crate) fn maybe_one_first(executed: Executed) -> Result<Option<PrimitiveValue>, TuskerError> {
    let query_id = executed.query_id;
    let query = executed.query.clone();
    match maybe_one(executed)? {
        Some(row) => Ok(Some(single_column(query_id, &query, row)?)),
        None => Ok(None),
    }
}

pub(crate) fn many_first(executed: Executed) -> Result<Vec<PrimitiveValue>, TuskerError> {
    let query_id = executed.query_id;
    let query = executed.query.clone();
    many(executed)?
        .into_iter()
        .map(|row| single_column(query_id, &query, row))
        .collect()
}

pub(crate) fn any_first(executed: Executed) -> Result<Vec<PrimitiveValue>, TuskerError> {
    let query_id = executed.query_id;
    let query = executed.query.clone();
    any(executed)?
        .into_iter()
        .map(|row| single_column(query_id, &query, row))
        .collect()
}

/// Interpret a `SELECT EXISTS (…)` wrapper's result.
pub(crate) fn exists(executed: Executed) -> Result<bool, TuskerError> {
    match one_first(executed)? {
        PrimitiveValue::Bool(value) => Ok(value),
        other => Err(TuskerError::UnexpectedState(format!(
            "EXISTS query returned a non-boolean value: {other:?}"
        ))),
    }
}
