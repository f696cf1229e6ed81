use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tusker::QueryContext;
use tusker::prelude::*;
use tusker::testing::{MockDriver, MockResponse, mock_options};

fn mock_pool(driver: &MockDriver, configuration: ClientConfiguration) -> DatabasePool {
    DatabasePool::with_driver(Arc::new(driver.clone()), mock_options(), configuration)
        .expect("pool construction")
}

fn quiet_config() -> ClientConfiguration {
    ClientConfiguration::default().with_capture_stack_trace(false)
}

/// Records every hook invocation so ordering can be asserted.
struct Recorder {
    name: &'static str,
    events: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    fn log(&self, hook: &str) {
        self.events
            .lock()
            .unwrap()
            .push(format!("{}:{hook}", self.name));
    }
}

#[async_trait]
impl Interceptor for Recorder {
    async fn before_transform_query(&self, _ctx: &QueryContext) -> Result<(), TuskerError> {
        self.log("before_transform_query");
        Ok(())
    }

    async fn transform_query(
        &self,
        _ctx: &QueryContext,
        query: Query,
    ) -> Result<Query, TuskerError> {
        self.log("transform_query");
        Ok(query)
    }

    async fn before_query_execution(
        &self,
        _ctx: &QueryContext,
        _query: &Query,
    ) -> Result<Option<QueryResult>, TuskerError> {
        self.log("before_query_execution");
        Ok(None)
    }

    async fn before_query_result(
        &self,
        _ctx: &QueryContext,
        _query: &Query,
        _result: &QueryResult,
    ) -> Result<(), TuskerError> {
        self.log("before_query_result");
        Ok(())
    }

    fn transform_row(
        &self,
        _ctx: &QueryContext,
        _query: &Query,
        row: Row,
    ) -> Result<Row, TuskerError> {
        self.log("transform_row");
        Ok(row)
    }

    async fn after_query_execution(
        &self,
        _ctx: &QueryContext,
        _query: &Query,
        _result: &QueryResult,
    ) -> Result<(), TuskerError> {
        self.log("after_query_execution");
        Ok(())
    }

    async fn query_execution_error(
        &self,
        _ctx: &QueryContext,
        _query: &Query,
        error: &TuskerError,
    ) -> Result<(), TuskerError> {
        self.log(&format!("query_execution_error:{}", error.sqlstate().unwrap_or("-")));
        Ok(())
    }
}

#[test]
fn hooks_run_in_registration_order() -> Result<(), Box<dyn std::error::Error>> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let driver = MockDriver::new();
        driver.respond_with(MockResponse::with_columns(&[("a", "int8")]).row(vec![1.into()]));
        let events = Arc::new(Mutex::new(Vec::new()));
        let pool = mock_pool(
            &driver,
            quiet_config()
                .with_interceptor(Arc::new(Recorder {
                    name: "first",
                    events: Arc::clone(&events),
                }))
                .with_interceptor(Arc::new(Recorder {
                    name: "second",
                    events: Arc::clone(&events),
                })),
        );

        pool.query(sql::tagged(&["SELECT a FROM t"], vec![])?).await?;

        let seen = events.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                "first:before_transform_query",
                "second:before_transform_query",
                "first:transform_query",
                "second:transform_query",
                "first:before_query_execution",
                "second:before_query_execution",
                "first:before_query_result",
                "second:before_query_result",
                "first:transform_row",
                "second:transform_row",
                "first:after_query_execution",
                "second:after_query_execution",
            ]
        );
        Ok::<(), TuskerError>(())
    })?;
    Ok(())
}

/// Appends a marker so the driver-visible SQL proves the replacement
/// happened.
struct Tagger;

#[async_trait]
impl Interceptor for Tagger {
    async fn transform_query(
        &self,
        _ctx: &QueryContext,
        mut query: Query,
    ) -> Result<Query, TuskerError> {
        query.sql.push_str(" /* tagged */");
        Ok(query)
    }
}

#[test]
fn transform_query_replaces_the_statement() -> Result<(), Box<dyn std::error::Error>> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let driver = MockDriver::new();
        driver.respond_with(MockResponse::with_columns(&[("a", "int8")]).row(vec![1.into()]));
        let pool = mock_pool(&driver, quiet_config().with_interceptor(Arc::new(Tagger)));

        pool.query(sql::tagged(&["SELECT a FROM t"], vec![])?).await?;

        assert_eq!(driver.count_matching("SELECT a FROM t /* tagged */"), 1);
        Ok::<(), TuskerError>(())
    })?;
    Ok(())
}

/// Stands in for the server entirely.
struct Cache;

#[async_trait]
impl Interceptor for Cache {
    async fn before_query_execution(
        &self,
        _ctx: &QueryContext,
        _query: &Query,
    ) -> Result<Option<QueryResult>, TuskerError> {
        Ok(Some(QueryResult::from_rows(
            vec!["a".to_string()],
            vec![vec![PrimitiveValue::Int(42)]],
        )))
    }
}

#[test]
fn short_circuit_skips_the_driver() -> Result<(), Box<dyn std::error::Error>> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let driver = MockDriver::new();
        let pool = mock_pool(&driver, quiet_config().with_interceptor(Arc::new(Cache)));

        let value = pool
            .one_first(sql::tagged(&["SELECT a FROM t"], vec![])?)
            .await?;
        assert_eq!(value, PrimitiveValue::Int(42));
        assert_eq!(driver.connections_opened(), 0);
        Ok::<(), TuskerError>(())
    })?;
    Ok(())
}

/// Upper-cases every text cell.
struct Shouter;

#[async_trait]
impl Interceptor for Shouter {
    fn transform_row(
        &self,
        _ctx: &QueryContext,
        _query: &Query,
        mut row: Row,
    ) -> Result<Row, TuskerError> {
        if let Some(PrimitiveValue::Text(name)) = row.get("name").cloned() {
            row.set("name", PrimitiveValue::Text(name.to_uppercase()));
        }
        Ok(row)
    }
}

#[test]
fn transform_row_reshapes_results() -> Result<(), Box<dyn std::error::Error>> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let driver = MockDriver::new();
        driver.respond_with(
            MockResponse::with_columns(&[("name", "text")])
                .row(vec![PrimitiveValue::Text("alice".into())]),
        );
        let pool = mock_pool(&driver, quiet_config().with_interceptor(Arc::new(Shouter)));

        let row = pool
            .one(sql::tagged(&["SELECT name FROM users"], vec![])?)
            .await?;
        assert_eq!(row.get("name"), Some(&PrimitiveValue::Text("ALICE".into())));
        Ok::<(), TuskerError>(())
    })?;
    Ok(())
}

#[test]
fn execution_errors_are_observed_after_mapping() -> Result<(), Box<dyn std::error::Error>> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let driver = MockDriver::new();
        driver.respond_with(MockResponse::failure_with_sqlstate(
            "23505",
            "duplicate key value violates unique constraint",
        ));
        let events = Arc::new(Mutex::new(Vec::new()));
        let pool = mock_pool(
            &driver,
            quiet_config().with_interceptor(Arc::new(Recorder {
                name: "observer",
                events: Arc::clone(&events),
            })),
        );

        let err = pool
            .query(sql::tagged(&["INSERT INTO t VALUES (1)"], vec![])?)
            .await
            .unwrap_err();
        assert!(matches!(err, TuskerError::UniqueConstraintViolation(_)));
        assert!(
            events
                .lock()
                .unwrap()
                .iter()
                .any(|e| e == "observer:query_execution_error:23505")
        );
        // The connection was still released.
        assert_eq!(pool.state().active, 0);
        Ok::<(), TuskerError>(())
    })?;
    Ok(())
}

/// Uses the per-query sandbox to pass state between its own hooks.
struct Timer;

#[async_trait]
impl Interceptor for Timer {
    async fn before_transform_query(&self, ctx: &QueryContext) -> Result<(), TuskerError> {
        // Nothing is interpreted yet at this point.
        assert!(ctx.original_query().is_none());
        ctx.sandbox
            .lock()
            .unwrap()
            .insert("phase".to_string(), serde_json::json!("started"));
        Ok(())
    }

    async fn after_query_execution(
        &self,
        ctx: &QueryContext,
        query: &Query,
        _result: &QueryResult,
    ) -> Result<(), TuskerError> {
        assert_eq!(
            ctx.sandbox.lock().unwrap().get("phase"),
            Some(&serde_json::json!("started"))
        );
        // The pre-transform query is pinned in the context.
        assert_eq!(ctx.original_query().map(|q| q.sql.as_str()), Some(query.sql.as_str()));
        assert!(ctx.connection_id().is_some());
        Ok(())
    }
}

#[test]
fn the_sandbox_and_context_span_the_whole_query() -> Result<(), Box<dyn std::error::Error>> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let driver = MockDriver::new();
        driver.respond_with(MockResponse::with_columns(&[("a", "int8")]).row(vec![1.into()]));
        let pool = mock_pool(&driver, quiet_config().with_interceptor(Arc::new(Timer)));

        pool.query(sql::tagged(&["SELECT a FROM t"], vec![])?).await?;
        Ok::<(), TuskerError>(())
    })?;
    Ok(())
}

/// Routes every pool query to a standby pool.
struct Rerouter {
    standby: DatabasePool,
}

#[async_trait]
impl Interceptor for Rerouter {
    async fn before_pool_connection(
        &self,
        _ctx: &QueryContext,
        _query: &Query,
    ) -> Result<Option<DatabasePool>, TuskerError> {
        Ok(Some(self.standby.clone()))
    }
}

#[test]
fn before_pool_connection_reroutes_to_another_pool() -> Result<(), Box<dyn std::error::Error>> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let standby_driver = MockDriver::new();
        standby_driver
            .respond_with(MockResponse::with_columns(&[("a", "int8")]).row(vec![1.into()]));
        let standby = mock_pool(&standby_driver, quiet_config());

        let primary_driver = MockDriver::new();
        let primary = mock_pool(
            &primary_driver,
            quiet_config().with_interceptor(Arc::new(Rerouter {
                standby: standby.clone(),
            })),
        );

        let row = primary
            .one(sql::tagged(&["SELECT a FROM t"], vec![])?)
            .await?;
        assert_eq!(row.get("a"), Some(&PrimitiveValue::Int(1)));

        // The statement ran on the standby, not the primary.
        assert_eq!(primary_driver.connections_opened(), 0);
        assert_eq!(standby_driver.count_matching("SELECT a FROM t"), 1);
        Ok::<(), TuskerError>(())
    })?;
    Ok(())
}
