use std::sync::Arc;
use std::time::Duration;

use tusker::prelude::*;
use tusker::testing::{MockDriver, MockResponse, mock_options};

fn mock_pool(driver: &MockDriver, configuration: ClientConfiguration) -> DatabasePool {
    DatabasePool::with_driver(Arc::new(driver.clone()), mock_options(), configuration)
        .expect("pool construction")
}

fn quiet_config() -> ClientConfiguration {
    ClientConfiguration::default().with_capture_stack_trace(false)
}

#[test]
fn ended_pool_rejects_new_work() -> Result<(), Box<dyn std::error::Error>> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let driver = MockDriver::new();
        driver.respond_with(MockResponse::with_columns(&[("a", "int8")]).row(vec![1.into()]));
        let pool = mock_pool(&driver, quiet_config());

        pool.query(sql::tagged(&["SELECT a FROM t"], vec![])?).await?;
        pool.end().await;
        // end() is idempotent.
        pool.end().await;

        let state = pool.state();
        assert!(state.ended);
        assert_eq!(state.active, 0);
        assert_eq!(state.idle, 0);

        let err = pool
            .query(sql::tagged(&["SELECT a FROM t"], vec![])?)
            .await
            .unwrap_err();
        assert!(matches!(err, TuskerError::PoolEnded));
        Ok::<(), TuskerError>(())
    })?;
    Ok(())
}

#[test]
fn concurrent_queries_never_exceed_the_pool_size() -> Result<(), Box<dyn std::error::Error>> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let driver = MockDriver::new();
        for _ in 0..6 {
            driver.respond_with(
                MockResponse::with_columns(&[("a", "int8")])
                    .row(vec![1.into()])
                    .delayed(Duration::from_millis(30)),
            );
        }
        let pool = mock_pool(&driver, quiet_config().with_maximum_pool_size(2));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                pool.query(sql::tagged(&["SELECT a FROM t"], vec![]).expect("fragment"))
                    .await
            }));
        }
        for handle in handles {
            handle.await.expect("task join")?;
        }

        assert!(driver.max_concurrent_connections() <= 2);
        let state = pool.state();
        assert_eq!(state.active, 0);
        assert!(state.idle <= 2);
        Ok::<(), TuskerError>(())
    })?;
    Ok(())
}

#[test]
fn sequential_queries_reuse_one_connection() -> Result<(), Box<dyn std::error::Error>> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let driver = MockDriver::new();
        for _ in 0..3 {
            driver.respond_with(
                MockResponse::with_columns(&[("a", "int8")]).row(vec![1.into()]),
            );
        }
        let pool = mock_pool(&driver, quiet_config());

        for _ in 0..3 {
            pool.query(sql::tagged(&["SELECT a FROM t"], vec![])?).await?;
        }
        assert_eq!(driver.connections_opened(), 1);
        Ok::<(), TuskerError>(())
    })?;
    Ok(())
}

#[test]
fn transient_connect_failures_are_retried_with_backoff()
-> Result<(), Box<dyn std::error::Error>> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let driver = MockDriver::new();
        driver.fail_connects(2);
        driver.respond_with(MockResponse::with_columns(&[("a", "int8")]).row(vec![1.into()]));
        let pool = mock_pool(&driver, quiet_config().with_connection_retry_limit(3));

        let row = pool
            .one(sql::tagged(&["SELECT a FROM t"], vec![])?)
            .await?;
        assert_eq!(row.get("a"), Some(&PrimitiveValue::Int(1)));

        // Exhausting the budget surfaces a connection error.
        driver.fail_connects(5);
        let pool = mock_pool(&driver, quiet_config().with_connection_retry_limit(1));
        let err = pool
            .query(sql::tagged(&["SELECT a FROM t"], vec![])?)
            .await
            .unwrap_err();
        assert!(matches!(err, TuskerError::Connection(_)));
        Ok::<(), TuskerError>(())
    })?;
    Ok(())
}

#[test]
fn saturated_pool_times_out_waiting_acquirers() -> Result<(), Box<dyn std::error::Error>> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let driver = MockDriver::new();
        let pool = mock_pool(
            &driver,
            quiet_config()
                .with_maximum_pool_size(1)
                .with_connection_timeout(Timeout::from_millis(50)),
        );

        let holder = pool.clone();
        let held = tokio::spawn(async move {
            holder
                .connect(|_conn| {
                    Box::pin(async move {
                        tokio::time::sleep(Duration::from_millis(300)).await;
                        Ok(())
                    })
                })
                .await
        });
        // Let the holder win the only slot.
        tokio::time::sleep(Duration::from_millis(30)).await;

        let err = pool
            .query(sql::tagged(&["SELECT 1"], vec![])?)
            .await
            .unwrap_err();
        assert!(matches!(err, TuskerError::Connection(_)));

        held.await.expect("task join")?;
        assert_eq!(pool.state().active, 0);
        Ok::<(), TuskerError>(())
    })?;
    Ok(())
}

#[test]
fn session_parameters_apply_on_fresh_connections() -> Result<(), Box<dyn std::error::Error>> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let driver = MockDriver::new();
        driver.respond_with(MockResponse::with_columns(&[("a", "int8")]).row(vec![1.into()]));
        let pool = mock_pool(
            &driver,
            quiet_config()
                .with_statement_timeout(Timeout::from_millis(10_000))
                .with_idle_in_transaction_session_timeout(Timeout::from_millis(30_000)),
        );

        pool.query(sql::tagged(&["SELECT a FROM t"], vec![])?).await?;

        let executed = driver.executed_sql();
        assert!(
            executed
                .iter()
                .any(|s| s == "SET statement_timeout = '10000'")
        );
        assert!(
            executed
                .iter()
                .any(|s| s == "SET idle_in_transaction_session_timeout = '30000'")
        );
        Ok::<(), TuskerError>(())
    })?;
    Ok(())
}

#[test]
fn statement_deadline_cancels_and_maps_to_timeout() -> Result<(), Box<dyn std::error::Error>> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let driver = MockDriver::new();
        driver.respond_with(
            MockResponse::with_columns(&[("a", "int8")])
                .row(vec![1.into()])
                .delayed(Duration::from_secs(30)),
        );
        let pool = mock_pool(
            &driver,
            quiet_config().with_statement_timeout(Timeout::from_millis(50)),
        );

        let err = pool
            .query(sql::tagged(&["SELECT a FROM t"], vec![])?)
            .await
            .unwrap_err();
        assert!(matches!(err, TuskerError::StatementTimeout(_)));
        assert_eq!(pool.state().active, 0);
        Ok::<(), TuskerError>(())
    })?;
    Ok(())
}

#[test]
fn standalone_queries_retry_class_40_up_to_the_limit() -> Result<(), Box<dyn std::error::Error>> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let driver = MockDriver::new();
        for _ in 0..10 {
            driver.respond_with(MockResponse::failure_with_sqlstate(
                "40001",
                "could not serialize access",
            ));
        }
        let pool = mock_pool(&driver, quiet_config().with_query_retry_limit(2));

        let err = pool
            .query(sql::tagged(&["SELECT a FROM t"], vec![])?)
            .await
            .unwrap_err();
        assert!(err.is_transaction_rollback());
        // 1 initial attempt + 2 retries, never more.
        assert_eq!(driver.count_matching("SELECT a FROM t"), 3);

        // A class-40 failure that resolves within the budget succeeds.
        let driver = MockDriver::new();
        driver.respond_with(MockResponse::failure_with_sqlstate(
            "40P01",
            "deadlock detected",
        ));
        driver.respond_with(MockResponse::with_columns(&[("a", "int8")]).row(vec![7.into()]));
        let pool = mock_pool(&driver, quiet_config().with_query_retry_limit(2));
        let value = pool
            .one_first(sql::tagged(&["SELECT a FROM t"], vec![])?)
            .await?;
        assert_eq!(value, PrimitiveValue::Int(7));

        // Non-retryable errors surface immediately.
        let driver = MockDriver::new();
        driver.respond_with(MockResponse::failure_with_sqlstate(
            "23505",
            "duplicate key",
        ));
        driver.respond_with(MockResponse::with_columns(&[("a", "int8")]).row(vec![1.into()]));
        let pool = mock_pool(&driver, quiet_config().with_query_retry_limit(2));
        let err = pool
            .query(sql::tagged(&["SELECT a FROM t"], vec![])?)
            .await
            .unwrap_err();
        assert!(matches!(err, TuskerError::UniqueConstraintViolation(_)));
        assert_eq!(driver.count_matching("SELECT a FROM t"), 1);
        Ok::<(), TuskerError>(())
    })?;
    Ok(())
}

#[test]
fn overlapping_use_of_a_pinned_handle_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let driver = MockDriver::new();
        driver.respond_with(
            MockResponse::with_columns(&[("a", "int8")])
                .row(vec![1.into()])
                .delayed(Duration::from_millis(100)),
        );
        let pool = mock_pool(&driver, quiet_config());

        pool.connect(|conn| {
            Box::pin(async move {
                let slow = conn.query(sql::tagged(&["SELECT a FROM t"], vec![])?);
                let eager = conn.query(sql::tagged(&["SELECT a FROM t"], vec![])?);
                let (slow, eager) = futures::join!(slow, eager);
                assert!(slow.is_ok());
                assert!(matches!(eager.unwrap_err(), TuskerError::Concurrency));
                Ok(())
            })
        })
        .await?;
        Ok::<(), TuskerError>(())
    })?;
    Ok(())
}
