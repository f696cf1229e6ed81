//! A scriptable in-memory driver. Queue responses, point a pool at
//! [`MockDriver`], and assert on the statements the engine produced.
//!
//! ```rust
//! use std::sync::Arc;
//! use tusker::testing::{MockDriver, MockResponse};
//!
//! let driver = MockDriver::new();
//! driver.respond_with(
//!     MockResponse::with_columns(&[("id", "int8")]).row(vec![1.into()]),
//! );
//! # let _ = driver;
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::config::{ConnectionOptions, SslMode};
use crate::driver::{
    CancelHandle, Driver, DriverConnection, DriverError, ExecutionResult, Field, Notice,
};
use crate::type_registry::TypeRegistry;
use crate::value::PrimitiveValue;

/// A statement the engine handed to the driver, with the connection
/// that ran it.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedStatement {
    pub connection: u64,
    pub sql: String,
    pub values: Vec<PrimitiveValue>,
}

/// One scripted outcome, consumed in FIFO order by non-lifecycle
/// statements.
#[derive(Debug, Clone, Default)]
pub struct MockResponse {
    fields: Vec<Field>,
    rows: Vec<Vec<PrimitiveValue>>,
    rows_affected: Option<u64>,
    command_tag: Option<String>,
    notices: Vec<Notice>,
    failure: Option<(Option<String>, String)>,
    latency: Option<Duration>,
}

impl MockResponse {
    /// A result with no columns and no rows.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// A result shaped `(column name, type name)` per column.
    #[must_use]
    pub fn with_columns(columns: &[(&str, &str)]) -> Self {
        Self {
            fields: columns
                .iter()
                .map(|(name, type_name)| Field {
                    name: (*name).to_string(),
                    type_name: (*type_name).to_string(),
                })
                .collect(),
            ..Self::default()
        }
    }

    /// Append a row of values.
    #[must_use]
    pub fn row(mut self, values: Vec<PrimitiveValue>) -> Self {
        self.rows.push(values);
        self
    }

    #[must_use]
    pub fn rows_affected(mut self, count: u64) -> Self {
        self.rows_affected = Some(count);
        self
    }

    #[must_use]
    pub fn command_tag(mut self, tag: impl Into<String>) -> Self {
        self.command_tag = Some(tag.into());
        self
    }

    #[must_use]
    pub fn notice(mut self, severity: &str, code: Option<&str>, message: &str) -> Self {
        self.notices.push(Notice {
            severity: severity.to_string(),
            code: code.map(str::to_string),
            message: message.to_string(),
        });
        self
    }

    /// Make this response a driver failure.
    #[must_use]
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            failure: Some((None, message.into())),
            ..Self::default()
        }
    }

    /// A server failure carrying a SQLSTATE, e.g. `40001`.
    #[must_use]
    pub fn failure_with_sqlstate(sqlstate: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            failure: Some((Some(sqlstate.into()), message.into())),
            ..Self::default()
        }
    }

    /// Delay the outcome; a cancel arriving during the delay resolves
    /// the call as SQLSTATE 57014, mirroring a server-side cancel.
    #[must_use]
    pub fn delayed(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }
}

/// Connection options for pools backed by the mock driver, which
/// ignores them.
#[must_use]
pub fn mock_options() -> ConnectionOptions {
    ConnectionOptions {
        application_name: None,
        database_name: "mock".to_string(),
        host: "localhost".to_string(),
        password: None,
        port: 5432,
        ssl_mode: SslMode::Disable,
        username: "mock".to_string(),
    }
}

#[derive(Default)]
struct MockState {
    responses: Mutex<VecDeque<MockResponse>>,
    statements: Mutex<Vec<RecordedStatement>>,
    connect_failures: AtomicU32,
    connections_opened: AtomicU64,
    open_connections: AtomicUsize,
    max_open_connections: AtomicUsize,
}

/// The scriptable driver. Clones share one script and one statement log.
#[derive(Clone, Default)]
pub struct MockDriver {
    state: Arc<MockState>,
}

impl MockDriver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for the next non-lifecycle statement.
    pub fn respond_with(&self, response: MockResponse) {
        self.state.responses.lock().unwrap().push_back(response);
    }

    /// Make the next `count` connection attempts fail.
    pub fn fail_connects(&self, count: u32) {
        self.state.connect_failures.store(count, Ordering::SeqCst);
    }

    /// Every statement the engine executed, in order.
    #[must_use]
    pub fn statements(&self) -> Vec<RecordedStatement> {
        self.state.statements.lock().unwrap().clone()
    }

    /// Executed SQL texts, in order.
    #[must_use]
    pub fn executed_sql(&self) -> Vec<String> {
        self.state
            .statements
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.sql.clone())
            .collect()
    }

    /// How often a statement matching `needle` was executed.
    #[must_use]
    pub fn count_matching(&self, needle: &str) -> usize {
        self.state
            .statements
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.sql.contains(needle))
            .count()
    }

    #[must_use]
    pub fn connections_opened(&self) -> u64 {
        self.state.connections_opened.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn open_connections(&self) -> usize {
        self.state.open_connections.load(Ordering::SeqCst)
    }

    /// High-water mark of simultaneously open connections.
    #[must_use]
    pub fn max_concurrent_connections(&self) -> usize {
        self.state.max_open_connections.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Driver for MockDriver {
    async fn connect(
        &self,
        _options: &ConnectionOptions,
        registry: &TypeRegistry,
    ) -> Result<Box<dyn DriverConnection>, DriverError> {
        let remaining = self.state.connect_failures.load(Ordering::SeqCst);
        if remaining > 0
            && self
                .state
                .connect_failures
                .compare_exchange(remaining, remaining - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            return Err(DriverError::new("mock connect refused"));
        }

        let id = self.state.connections_opened.fetch_add(1, Ordering::SeqCst) + 1;
        let open = self.state.open_connections.fetch_add(1, Ordering::SeqCst) + 1;
        self.state
            .max_open_connections
            .fetch_max(open, Ordering::SeqCst);

        Ok(Box::new(MockConnection {
            id,
            state: Arc::clone(&self.state),
            registry: registry.clone(),
            cancelled: Arc::new(Notify::new()),
            cursors: HashMap::new(),
        }))
    }
}

struct MockCursor {
    fields: Vec<Field>,
    rows: VecDeque<Vec<PrimitiveValue>>,
}

struct MockConnection {
    id: u64,
    state: Arc<MockState>,
    registry: TypeRegistry,
    cancelled: Arc<Notify>,
    cursors: HashMap<String, MockCursor>,
}

impl Drop for MockConnection {
    fn drop(&mut self) {
        self.state.open_connections.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Statements the state machines issue themselves; they succeed without
/// consuming the script.
fn is_lifecycle(sql: &str) -> bool {
    let sql = sql.trim_start();
    ["START TRANSACTION", "COMMIT", "ROLLBACK", "SAVEPOINT", "RELEASE SAVEPOINT", "SET "]
        .iter()
        .any(|prefix| sql.starts_with(prefix))
}

impl MockConnection {
    fn record(&self, sql: &str, values: &[PrimitiveValue]) {
        self.state
            .statements
            .lock()
            .unwrap()
            .push(RecordedStatement {
                connection: self.id,
                sql: sql.to_string(),
                values: values.to_vec(),
            });
    }

    fn pop_response(&self) -> MockResponse {
        self.state
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default()
    }

    async fn resolve(&self, response: MockResponse) -> Result<ExecutionResult, DriverError> {
        if let Some(latency) = response.latency {
            tokio::select! {
                () = tokio::time::sleep(latency) => {}
                () = self.cancelled.notified() => {
                    return Err(DriverError::new(
                        "canceling statement due to user request",
                    )
                    .with_sqlstate("57014"));
                }
            }
        }

        if let Some((sqlstate, message)) = response.failure {
            let mut error = DriverError::new(message);
            if let Some(state) = sqlstate {
                error = error.with_sqlstate(state);
            }
            return Err(error);
        }

        let mut rows = Vec::with_capacity(response.rows.len());
        for row in response.rows {
            rows.push(self.parse_row(&response.fields, row)?);
        }

        Ok(ExecutionResult {
            command_tag: response.command_tag,
            rows_affected: response.rows_affected.unwrap_or(rows.len() as u64),
            fields: response.fields,
            rows,
            notices: response.notices,
        })
    }

    /// Apply the installed registry to text cells, the way a wire
    /// driver would while decoding.
    fn parse_row(
        &self,
        fields: &[Field],
        row: Vec<PrimitiveValue>,
    ) -> Result<Vec<PrimitiveValue>, DriverError> {
        row.into_iter()
            .enumerate()
            .map(|(index, value)| {
                let Some(field) = fields.get(index) else {
                    return Ok(value);
                };
                if !self.registry.has(&field.type_name) {
                    return Ok(value);
                }
                match value {
                    PrimitiveValue::Text(text) => self
                        .registry
                        .parse(&field.type_name, &text)
                        .map_err(|message| {
                            DriverError::new(format!(
                                "column {} ({}): {message}",
                                field.name, field.type_name
                            ))
                        }),
                    other => Ok(other),
                }
            })
            .collect()
    }
}

#[async_trait]
impl DriverConnection for MockConnection {
    async fn execute(
        &mut self,
        sql: &str,
        values: &[PrimitiveValue],
    ) -> Result<ExecutionResult, DriverError> {
        self.record(sql, values);
        if is_lifecycle(sql) {
            return Ok(ExecutionResult::default());
        }
        let response = self.pop_response();
        self.resolve(response).await
    }

    async fn open_cursor(
        &mut self,
        name: &str,
        sql: &str,
        values: &[PrimitiveValue],
    ) -> Result<(), DriverError> {
        self.record(sql, values);
        let response = self.pop_response();
        let result = self.resolve(response).await?;
        self.cursors.insert(
            name.to_string(),
            MockCursor {
                fields: result.fields,
                rows: result.rows.into(),
            },
        );
        Ok(())
    }

    async fn fetch_from_cursor(
        &mut self,
        name: &str,
        batch_size: usize,
    ) -> Result<ExecutionResult, DriverError> {
        let cursor = self
            .cursors
            .get_mut(name)
            .ok_or_else(|| DriverError::new(format!("no open cursor named {name}")))?;
        let mut rows = Vec::new();
        while rows.len() < batch_size {
            match cursor.rows.pop_front() {
                Some(row) => rows.push(row),
                None => break,
            }
        }
        Ok(ExecutionResult {
            command_tag: None,
            rows_affected: rows.len() as u64,
            fields: cursor.fields.clone(),
            rows,
            notices: Vec::new(),
        })
    }

    async fn close_cursor(&mut self, name: &str) -> Result<(), DriverError> {
        self.cursors.remove(name);
        Ok(())
    }

    async fn copy_in_binary(
        &mut self,
        sql: &str,
        _column_types: &[String],
        tuples: &[Vec<PrimitiveValue>],
    ) -> Result<u64, DriverError> {
        self.record(sql, &[]);
        let queued = {
            let mut responses = self.state.responses.lock().unwrap();
            if responses.is_empty() {
                None
            } else {
                responses.pop_front()
            }
        };
        match queued {
            Some(response) => {
                let result = self.resolve(response).await?;
                Ok(result.rows_affected)
            }
            None => Ok(tuples.len() as u64),
        }
    }

    async fn set_session_parameters(
        &mut self,
        parameters: &[(String, String)],
    ) -> Result<(), DriverError> {
        for (name, value) in parameters {
            self.record(&format!("SET {name} = '{value}'"), &[]);
        }
        Ok(())
    }

    fn cancel_handle(&self) -> Box<dyn CancelHandle> {
        Box::new(MockCancelHandle {
            cancelled: Arc::clone(&self.cancelled),
        })
    }

    async fn close(&mut self) -> Result<(), DriverError> {
        Ok(())
    }
}

struct MockCancelHandle {
    cancelled: Arc<Notify>,
}

#[async_trait]
impl CancelHandle for MockCancelHandle {
    async fn cancel(&self) -> Result<(), DriverError> {
        self.cancelled.notify_one();
        Ok(())
    }
}
