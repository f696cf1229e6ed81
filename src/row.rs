use std::collections::HashMap;
use std::sync::Arc;

use crate::driver::{ExecutionResult, Field, Notice};
use crate::value::PrimitiveValue;

/// One result row. Column names and the name→index map are shared
/// across all rows of a result set, so a row is one `Vec` of values
/// plus two `Arc` pointers.
#[derive(Debug, Clone)]
pub struct Row {
    columns: Arc<Vec<String>>,
    index: Arc<HashMap<String, usize>>,
    values: Vec<PrimitiveValue>,
}

impl Row {
    pub(crate) fn new(
        columns: Arc<Vec<String>>,
        index: Arc<HashMap<String, usize>>,
        values: Vec<PrimitiveValue>,
    ) -> Self {
        Self {
            columns,
            index,
            values,
        }
    }

    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Value by column name.
    #[must_use]
    pub fn get(&self, column: &str) -> Option<&PrimitiveValue> {
        self.index
            .get(column)
            .copied()
            .or_else(|| self.columns.iter().position(|c| c == column))
            .and_then(|i| self.values.get(i))
    }

    /// Value by column position.
    #[must_use]
    pub fn get_index(&self, index: usize) -> Option<&PrimitiveValue> {
        self.values.get(index)
    }

    /// Replace a value in place; returns false if the column does not
    /// exist. Useful inside `transform_row` interceptors.
    pub fn set(&mut self, column: &str, value: PrimitiveValue) -> bool {
        let Some(&index) = self.index.get(column) else {
            return false;
        };
        self.values[index] = value;
        true
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    #[must_use]
    pub fn values(&self) -> &[PrimitiveValue] {
        &self.values
    }

    #[must_use]
    pub fn into_values(self) -> Vec<PrimitiveValue> {
        self.values
    }
}

/// The fully materialised outcome of one statement.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    /// Command tag reported by the server (e.g. `INSERT 0 1`).
    pub command_tag: Option<String>,
    /// Rows affected for DML, row count for selects.
    pub row_count: u64,
    pub fields: Vec<Field>,
    pub rows: Vec<Row>,
    /// Server notices emitted during this statement, and only this one.
    pub notices: Vec<Notice>,
}

impl QueryResult {
    /// Build a result from a driver execution, sharing one column
    /// header across all rows.
    pub(crate) fn from_execution(result: ExecutionResult) -> Self {
        let columns: Arc<Vec<String>> =
            Arc::new(result.fields.iter().map(|f| f.name.clone()).collect());
        let index: Arc<HashMap<String, usize>> = Arc::new(
            columns
                .iter()
                .enumerate()
                .map(|(i, name)| (name.clone(), i))
                .collect(),
        );
        let rows = result
            .rows
            .into_iter()
            .map(|values| Row::new(Arc::clone(&columns), Arc::clone(&index), values))
            .collect();
        Self {
            command_tag: result.command_tag,
            row_count: result.rows_affected,
            fields: result.fields,
            rows,
            notices: result.notices,
        }
    }

    /// Assemble a synthetic result, e.g. from a `before_query_execution`
    /// interceptor standing in for the server.
    #[must_use]
    pub fn from_rows(columns: Vec<String>, rows: Vec<Vec<PrimitiveValue>>) -> Self {
        let fields = columns
            .iter()
            .map(|name| Field {
                name: name.clone(),
                type_name: String::new(),
            })
            .collect();
        let row_count = rows.len() as u64;
        let columns = Arc::new(columns);
        let index: Arc<HashMap<String, usize>> = Arc::new(
            columns
                .iter()
                .enumerate()
                .map(|(i, name)| (name.clone(), i))
                .collect(),
        );
        Self {
            command_tag: None,
            row_count,
            fields,
            rows: rows
                .into_iter()
                .map(|values| Row::new(Arc::clone(&columns), Arc::clone(&index), values))
                .collect(),
            notices: Vec::new(),
        }
    }
}
