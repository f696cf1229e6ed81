use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::config::{ClientConfiguration, ConnectionOptions, Timeout};
use crate::driver::{Driver, DriverConnection};
use crate::error::TuskerError;
use crate::executor::{ConnectionId, PoolId};
use crate::type_registry::TypeRegistry;

use super::PoolState;

/// A checked-out connection. Holds its pool-slot permit for as long as
/// it is out; releasing or destroying it returns the slot.
pub(crate) struct PooledConnection {
    pub(crate) id: ConnectionId,
    pub(crate) conn: Box<dyn DriverConnection>,
    permit: Option<OwnedSemaphorePermit>,
}

struct IdleConnection {
    id: ConnectionId,
    conn: Box<dyn DriverConnection>,
    idle_since: Instant,
}

struct PoolCore {
    idle: Vec<IdleConnection>,
    active: usize,
    waiting: usize,
    ended: bool,
    next_connection_id: u64,
}

/// Shared pool internals. Handles hold an `Arc` of this.
pub(crate) struct PoolInner {
    pub(crate) pool_id: PoolId,
    pub(crate) driver: Arc<dyn Driver>,
    pub(crate) options: ConnectionOptions,
    pub(crate) config: ClientConfiguration,
    pub(crate) registry: Arc<TypeRegistry>,
    // Guarded by a sync mutex; never held across an await.
    core: Mutex<PoolCore>,
    slots: Arc<Semaphore>,
    drained: Notify,
}

impl PoolInner {
    pub(crate) fn new(
        driver: Arc<dyn Driver>,
        options: ConnectionOptions,
        config: ClientConfiguration,
        registry: TypeRegistry,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(config.maximum_pool_size));
        Self {
            pool_id: PoolId::next(),
            driver,
            options,
            config,
            registry: Arc::new(registry),
            core: Mutex::new(PoolCore {
                idle: Vec::new(),
                active: 0,
                waiting: 0,
                ended: false,
                next_connection_id: 0,
            }),
            slots,
            drained: Notify::new(),
        }
    }

    /// Point-in-time snapshot; never blocks.
    pub(crate) fn state(&self) -> PoolState {
        let core = self.core.lock().unwrap();
        PoolState {
            active: core.active,
            idle: core.idle.len(),
            waiting: core.waiting,
            ended: core.ended,
        }
    }

    /// Check a connection out: reuse a fresh-enough idle one, or open a
    /// new connection with retry and backoff.
    pub(crate) async fn acquire(&self) -> Result<PooledConnection, TuskerError> {
        if self.core.lock().unwrap().ended {
            return Err(TuskerError::PoolEnded);
        }

        let permit = self.wait_for_slot().await?;

        enum Checkout {
            Reuse(ConnectionId, Box<dyn DriverConnection>),
            Fresh(ConnectionId),
        }

        let checkout = {
            let mut core = self.core.lock().unwrap();
            if core.ended {
                return Err(TuskerError::PoolEnded);
            }
            core.active += 1;
            match self.pop_fresh_idle(&mut core) {
                Some(idle) => Checkout::Reuse(idle.id, idle.conn),
                None => {
                    core.next_connection_id += 1;
                    Checkout::Fresh(ConnectionId::new(core.next_connection_id))
                }
            }
        };

        match checkout {
            Checkout::Reuse(id, conn) => Ok(PooledConnection {
                id,
                conn,
                permit: Some(permit),
            }),
            Checkout::Fresh(id) => match self.open_connection().await {
                Ok(conn) => {
                    debug!(pool_id = %self.pool_id, connection_id = %id, "connection opened");
                    Ok(PooledConnection {
                        id,
                        conn,
                        permit: Some(permit),
                    })
                }
                Err(error) => {
                    let mut core = self.core.lock().unwrap();
                    core.active -= 1;
                    if core.ended && core.active == 0 {
                        self.drained.notify_waiters();
                    }
                    Err(error)
                }
            },
        }
    }

    async fn wait_for_slot(&self) -> Result<OwnedSemaphorePermit, TuskerError> {
        // Fast path: a free slot means the caller never counts as
        // waiting, so `waiting > 0` implies the pool is saturated.
        if let Ok(permit) = Arc::clone(&self.slots).try_acquire_owned() {
            return Ok(permit);
        }

        self.core.lock().unwrap().waiting += 1;
        let acquired = match self.config.connection_timeout {
            Timeout::Disabled => Arc::clone(&self.slots)
                .acquire_owned()
                .await
                .map_err(|_| TuskerError::PoolEnded),
            Timeout::After(limit) => {
                match tokio::time::timeout(limit, Arc::clone(&self.slots).acquire_owned()).await {
                    Ok(Ok(permit)) => Ok(permit),
                    Ok(Err(_)) => Err(TuskerError::PoolEnded),
                    Err(_) => Err(TuskerError::Connection(format!(
                        "timed out after {limit:?} waiting for a connection"
                    ))),
                }
            }
        };
        self.core.lock().unwrap().waiting -= 1;
        acquired
    }

    fn pop_fresh_idle(&self, core: &mut PoolCore) -> Option<IdleConnection> {
        let cutoff = self.config.idle_timeout.as_duration();
        while let Some(idle) = core.idle.pop() {
            if let Some(cutoff) = cutoff
                && idle.idle_since.elapsed() > cutoff
            {
                // Stale; dropping the boxed connection closes it.
                continue;
            }
            return Some(idle);
        }
        None
    }

    async fn open_connection(&self) -> Result<Box<dyn DriverConnection>, TuskerError> {
        let mut attempt: u32 = 0;
        loop {
            match self.driver.connect(&self.options, &self.registry).await {
                Ok(mut conn) => {
                    self.apply_session_parameters(&mut conn).await?;
                    return Ok(conn);
                }
                Err(error) if attempt < self.config.connection_retry_limit => {
                    attempt += 1;
                    let backoff = Duration::from_millis(100 * 2u64.pow(attempt - 1));
                    warn!(
                        pool_id = %self.pool_id,
                        attempt,
                        ?backoff,
                        error = %error,
                        "connect failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(error) => {
                    return Err(TuskerError::Connection(format!(
                        "connect failed after {attempt} retries: {error}"
                    )));
                }
            }
        }
    }

    async fn apply_session_parameters(
        &self,
        conn: &mut Box<dyn DriverConnection>,
    ) -> Result<(), TuskerError> {
        let mut parameters = Vec::new();
        if let Some(limit) = self.config.statement_timeout.as_duration() {
            parameters.push(("statement_timeout".to_string(), limit.as_millis().to_string()));
        }
        if let Some(limit) = self
            .config
            .idle_in_transaction_session_timeout
            .as_duration()
        {
            parameters.push((
                "idle_in_transaction_session_timeout".to_string(),
                limit.as_millis().to_string(),
            ));
        }
        if parameters.is_empty() {
            return Ok(());
        }
        conn.set_session_parameters(&parameters)
            .await
            .map_err(|error| TuskerError::Connection(format!("session setup failed: {error}")))
    }

    /// Return a connection. `destroy` drops it instead of parking it
    /// idle; ended pools drop everything.
    pub(crate) fn release(&self, connection: PooledConnection, destroy: bool) {
        let PooledConnection { id, conn, permit } = connection;
        let mut core = self.core.lock().unwrap();
        core.active -= 1;
        if !destroy && !core.ended {
            core.idle.push(IdleConnection {
                id,
                conn,
                idle_since: Instant::now(),
            });
        }
        if core.ended && core.active == 0 {
            self.drained.notify_waiters();
        }
        drop(core);
        drop(permit);
    }

    /// Reject new acquisitions, drop idles, and wait for actives to
    /// drain. Safe to call any number of times.
    pub(crate) async fn end(&self) {
        {
            let mut core = self.core.lock().unwrap();
            core.ended = true;
            core.idle.clear();
        }
        info!(pool_id = %self.pool_id, "pool ending, waiting for active connections");
        loop {
            let drained = self.drained.notified();
            if self.core.lock().unwrap().active == 0 {
                break;
            }
            drained.await;
        }
    }
}
