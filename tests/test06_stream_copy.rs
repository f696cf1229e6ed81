use std::sync::Arc;

use tusker::prelude::*;
use tusker::testing::{MockDriver, MockResponse, mock_options};

fn mock_pool(driver: &MockDriver) -> DatabasePool {
    DatabasePool::with_driver(
        Arc::new(driver.clone()),
        mock_options(),
        ClientConfiguration::default().with_capture_stack_trace(false),
    )
    .expect("pool construction")
}

fn five_rows() -> MockResponse {
    let mut response = MockResponse::with_columns(&[("n", "int8")]);
    for n in 1..=5 {
        response = response.row(vec![n.into()]);
    }
    response
}

#[test]
fn stream_delivers_rows_in_order() -> Result<(), Box<dyn std::error::Error>> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let driver = MockDriver::new();
        driver.respond_with(five_rows());
        let pool = mock_pool(&driver);

        let mut seen = Vec::new();
        let delivered = pool
            .stream(
                sql::tagged(&["SELECT n FROM series"], vec![])?,
                2,
                |row| {
                    seen.push(row.get("n").cloned());
                    Ok(())
                },
            )
            .await?;

        assert_eq!(delivered, 5);
        assert_eq!(
            seen,
            (1..=5)
                .map(|n| Some(PrimitiveValue::Int(n)))
                .collect::<Vec<_>>()
        );
        assert_eq!(pool.state().active, 0);
        Ok::<(), TuskerError>(())
    })?;
    Ok(())
}

#[test]
fn sink_failure_aborts_and_releases() -> Result<(), Box<dyn std::error::Error>> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let driver = MockDriver::new();
        driver.respond_with(five_rows());
        let pool = mock_pool(&driver);

        let mut seen = 0;
        let err = pool
            .stream(
                sql::tagged(&["SELECT n FROM series"], vec![])?,
                2,
                |_row| {
                    seen += 1;
                    if seen == 3 {
                        Err(TuskerError::InvalidInput("sink full".into()))
                    } else {
                        Ok(())
                    }
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, TuskerError::InvalidInput(_)));
        assert_eq!(seen, 3);
        // The connection went back to the pool despite the abort.
        assert_eq!(pool.state().active, 0);

        // And the pool still works.
        driver.respond_with(MockResponse::with_columns(&[("n", "int8")]).row(vec![9.into()]));
        let value = pool
            .one_first(sql::tagged(&["SELECT n FROM series"], vec![])?)
            .await?;
        assert_eq!(value, PrimitiveValue::Int(9));
        Ok::<(), TuskerError>(())
    })?;
    Ok(())
}

#[test]
fn stream_works_inside_a_transaction() -> Result<(), Box<dyn std::error::Error>> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let driver = MockDriver::new();
        driver.respond_with(five_rows());
        let pool = mock_pool(&driver);

        let total = pool
            .transaction(|tx| {
                Box::pin(async move {
                    let mut total = 0i64;
                    tx.stream(
                        sql::tagged(&["SELECT n FROM series"], vec![])?,
                        3,
                        |row| {
                            total += row.get("n").and_then(|v| v.as_int()).unwrap_or(0);
                            Ok(())
                        },
                    )
                    .await?;
                    Ok(total)
                })
            })
            .await?;
        assert_eq!(total, 15);
        Ok::<(), TuskerError>(())
    })?;
    Ok(())
}

#[test]
fn copy_from_binary_reports_the_row_count() -> Result<(), Box<dyn std::error::Error>> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let driver = MockDriver::new();
        let pool = mock_pool(&driver);

        let copied = pool
            .copy_from_binary(
                sql::tagged(&["COPY t (id, name) FROM STDIN BINARY"], vec![])?,
                vec![
                    vec![1.into(), PrimitiveValue::Text("a".into())],
                    vec![2.into(), PrimitiveValue::Text("b".into())],
                ],
                vec!["int8".to_string(), "text".to_string()],
            )
            .await?;
        assert_eq!(copied, 2);
        assert_eq!(driver.count_matching("COPY t (id, name)"), 1);
        Ok::<(), TuskerError>(())
    })?;
    Ok(())
}

#[test]
fn copy_validates_tuples_up_front() -> Result<(), Box<dyn std::error::Error>> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let driver = MockDriver::new();
        let pool = mock_pool(&driver);

        let err = pool
            .copy_from_binary(
                sql::tagged(&["COPY t (id) FROM STDIN BINARY"], vec![])?,
                vec![vec![1.into(), 2.into()]],
                vec!["int8".to_string()],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TuskerError::InvalidInput(_)));
        assert_eq!(driver.connections_opened(), 0);
        Ok::<(), TuskerError>(())
    })?;
    Ok(())
}

/// A schema that only accepts positive ids.
struct PositiveId;

impl RowSchema for PositiveId {
    fn parse(&self, row: Row) -> Result<Row, SchemaIssues> {
        match row.get("id").and_then(|v| v.as_int()) {
            Some(id) if id > 0 => Ok(row),
            Some(id) => Err(SchemaIssues::single(format!("id must be positive, got {id}"))),
            None => Err(SchemaIssues::single("id missing or not an integer")),
        }
    }
}

#[test]
fn row_schema_rejection_carries_the_row() -> Result<(), Box<dyn std::error::Error>> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let driver = MockDriver::new();
        driver.respond_with(
            MockResponse::with_columns(&[("id", "int8")])
                .row(vec![1.into()])
                .row(vec![(-3).into()]),
        );
        let pool = mock_pool(&driver);

        let schema: Arc<dyn RowSchema> = Arc::new(PositiveId);
        let err = pool
            .query(sql::typed(schema).tagged(&["SELECT id FROM t"], vec![])?)
            .await
            .unwrap_err();

        match err {
            TuskerError::SchemaValidation { issues, row, .. } => {
                assert_eq!(issues, vec!["id must be positive, got -3".to_string()]);
                assert_eq!(row.get("id"), Some(&PrimitiveValue::Int(-3)));
            }
            other => panic!("expected SchemaValidation, got {other:?}"),
        }
        Ok::<(), TuskerError>(())
    })?;
    Ok(())
}

#[test]
fn row_schema_applies_during_streaming() -> Result<(), Box<dyn std::error::Error>> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let driver = MockDriver::new();
        driver.respond_with(
            MockResponse::with_columns(&[("id", "int8")])
                .row(vec![5.into()])
                .row(vec![(-1).into()]),
        );
        let pool = mock_pool(&driver);

        let schema: Arc<dyn RowSchema> = Arc::new(PositiveId);
        let mut delivered = 0;
        let err = pool
            .stream(
                sql::typed(schema).tagged(&["SELECT id FROM t"], vec![])?,
                10,
                |_row| {
                    delivered += 1;
                    Ok(())
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, TuskerError::SchemaValidation { .. }));
        assert_eq!(delivered, 1);
        assert_eq!(pool.state().active, 0);
        Ok::<(), TuskerError>(())
    })?;
    Ok(())
}
