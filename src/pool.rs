//! Bounded connection pool

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::config::PoolConfiguration;
use crate::connection::{Connectable, ConnectionId, Lease, PoolConnection};
use crate::errors::{PoolError, PoolResult};
use crate::state::{ConnectionState, Decision, Grant, PoolState};
use crate::status::PoolStatus;

type FactoryFuture<T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send>>;
type Factory<T, E> = Box<dyn Fn() -> FactoryFuture<T, E> + Send + Sync>;

struct Shared<T, E> {
    state: Mutex<PoolState<T>>,
    factory: Factory<T, E>,
    config: PoolConfiguration,
}

/// A bounded pool of lazily created connections.
///
/// At most `connection_limit` connections exist at once, counting the ones
/// still being created. Requests that find nothing available queue up and
/// are served strictly in arrival order: a released connection goes straight
/// to the oldest queued request.
///
/// Cloning is cheap; all clones share the same pool.
///
/// # Examples
///
/// ```
/// use async_trait::async_trait;
/// use connections_pool::{Connectable, ConnectionPool};
///
/// struct Session;
///
/// #[async_trait]
/// impl Connectable for Session {
///     async fn close(&self) {}
/// }
///
/// # #[tokio::main]
/// # async fn main() {
/// let pool = ConnectionPool::with_limit(2, || async { Ok::<_, std::io::Error>(Session) }).unwrap();
///
/// let conn = pool.get_connection().await.unwrap();
/// assert_eq!(pool.status().acquired, 1);
///
/// conn.release().unwrap();
/// assert_eq!(pool.status().free, 1);
///
/// pool.close().await;
/// assert!(pool.get_connection().await.is_err());
/// # }
/// ```
pub struct ConnectionPool<T, E> {
    shared: Arc<Shared<T, E>>,
}

impl<T, E> Clone for ConnectionPool<T, E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Connectable, E: Send + 'static> ConnectionPool<T, E> {
    /// Create a pool that opens connections with `factory`.
    ///
    /// No connection is opened up front.
    ///
    /// # Errors
    ///
    /// [`PoolError::InvalidConfiguration`] if the configuration is rejected by
    /// [`PoolConfiguration::validate`].
    pub fn new<F, Fut>(factory: F, config: PoolConfiguration) -> PoolResult<Self, E>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        config.validate().map_err(PoolError::InvalidConfiguration)?;

        let factory: Factory<T, E> = Box::new(move || -> FactoryFuture<T, E> { Box::pin(factory()) });
        debug!(
            connection_limit = config.connection_limit,
            wait_for_connection = config.wait_for_connection,
            "Connection pool created"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                state: Mutex::new(PoolState::new(config.connection_limit)),
                factory,
                config,
            }),
        })
    }

    /// Create a pool with the given limit and default settings otherwise
    pub fn with_limit<F, Fut>(connection_limit: usize, factory: F) -> PoolResult<Self, E>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        Self::new(
            factory,
            PoolConfiguration::new().with_connection_limit(connection_limit),
        )
    }

    /// Get a connection, waiting if the configuration says so
    pub async fn get_connection(&self) -> PoolResult<PoolConnection<T, E>, E> {
        self.acquire(self.shared.config.wait_for_connection).await
    }

    /// Get a connection without queueing
    pub async fn try_get_connection(&self) -> PoolResult<PoolConnection<T, E>, E> {
        self.acquire(false).await
    }

    /// Acquire a connection.
    ///
    /// Opens a new connection while the limit allows it, otherwise reuses the
    /// longest idle one. With nothing available, either queues the request
    /// (`wait_for_connection`) or fails with
    /// [`PoolError::NoAvailableConnection`].
    ///
    /// # Errors
    ///
    /// - [`PoolError::PoolClosed`] once [`close`](Self::close) was called
    /// - [`PoolError::NoAvailableConnection`] in non-waiting mode
    /// - [`PoolError::Factory`] if opening the connection failed; it is not retried
    pub async fn acquire(&self, wait_for_connection: bool) -> PoolResult<PoolConnection<T, E>, E> {
        let decision = self.shared.state.lock().decide(wait_for_connection);
        let grant = match decision {
            Decision::Admitted(grant) => grant,
            Decision::Unavailable => return Err(PoolError::NoAvailableConnection),
            Decision::Queued(receiver) => {
                trace!("No connection available, request queued");
                QueuedRequest {
                    pool: self,
                    receiver,
                }
                .wait()
                .await
            }
        };

        match grant {
            Grant::Closed => Err(PoolError::PoolClosed),
            Grant::Reuse {
                id,
                connection,
                lease,
            } => {
                trace!(connection_id = %id, "Reusing idle connection");
                Ok(PoolConnection::new(self.clone(), id, lease, connection))
            }
            Grant::Create(id) => self.create(id).await,
        }
    }

    async fn create(&self, id: ConnectionId) -> PoolResult<PoolConnection<T, E>, E> {
        let slot = PendingSlot {
            pool: self,
            id,
            settled: false,
        };
        debug!(connection_id = %id, "Opening connection");

        let connection = match (self.shared.factory)().await {
            Ok(connection) => Arc::new(connection),
            Err(err) => {
                drop(slot);
                warn!(connection_id = %id, "Connection factory failed");
                return Err(PoolError::Factory(err));
            }
        };

        match slot.complete(Arc::clone(&connection)) {
            Ok(lease) => {
                debug!(connection_id = %id, "Connection opened");
                Ok(PoolConnection::new(self.clone(), id, lease, connection))
            }
            Err(connection) => {
                debug!(connection_id = %id, "Pool closed while connecting, discarding connection");
                connection.close().await;
                Err(PoolError::PoolClosed)
            }
        }
    }

    /// Permanently evict a connection, idle or checked out.
    ///
    /// The connection is closed unless
    /// [`close_removed_connections`](PoolConfiguration::close_removed_connections)
    /// is off or the pool was already closed. The freed capacity goes to the
    /// oldest queued request. Removing a connection that is not live is a
    /// no-op and returns `false`.
    pub async fn remove_connection(&self, id: ConnectionId) -> bool {
        let (removed, pool_closed) = {
            let mut state = self.shared.state.lock();
            (state.remove(id), state.is_closed())
        };
        let Some(connection) = removed else {
            trace!(connection_id = %id, "Connection not live, nothing to remove");
            return false;
        };

        debug!(connection_id = %id, "Connection removed from pool");
        if self.shared.config.close_removed_connections && !pool_closed {
            connection.close().await;
        }
        true
    }

    /// Close the pool.
    ///
    /// Queued requests fail with [`PoolError::PoolClosed`], every live
    /// connection is closed, and later acquisitions are rejected. Each
    /// connection is closed at most once. If a previous `close` was dropped
    /// partway through, calling it again closes the connections it did not
    /// get to; otherwise a second call does nothing.
    pub async fn close(&self) {
        let started = {
            let mut state = self.shared.state.lock();
            state.close().then(|| state.status().total)
        };
        if let Some(connections) = started {
            debug!(connections, "Closing connection pool");
        }

        loop {
            let next = self.shared.state.lock().next_to_close();
            let Some(connection) = next else {
                break;
            };
            connection.close().await;
        }
    }
}

impl<T, E> ConnectionPool<T, E> {
    /// Return an acquired connection by id.
    ///
    /// # Errors
    ///
    /// - [`PoolError::AlreadyReleased`] if the connection is idle
    /// - [`PoolError::NotAcquired`] if it is not checked out at all
    pub fn release_connection(&self, id: ConnectionId) -> PoolResult<(), E> {
        self.release_lease(id, None)
    }

    pub(crate) fn release_lease(&self, id: ConnectionId, lease: Option<Lease>) -> PoolResult<(), E> {
        self.shared.state.lock().release(id, lease)?;
        trace!(connection_id = %id, "Connection released");
        Ok(())
    }

    /// Snapshot of the pool's bookkeeping
    pub fn status(&self) -> PoolStatus {
        self.shared.state.lock().status()
    }

    pub fn connection_state(&self, id: ConnectionId) -> ConnectionState {
        self.shared.state.lock().state_of(id)
    }

    pub fn connection_limit(&self) -> usize {
        self.shared.config.connection_limit
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().is_closed()
    }
}

impl<T, E> fmt::Debug for ConnectionPool<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("status", &self.status())
            .finish()
    }
}

/// A creation slot reserved by the decision routine.
///
/// Dropping it unsettled (factory error, or the caller gave up) frees the
/// slot for the next queued request.
struct PendingSlot<'a, T, E> {
    pool: &'a ConnectionPool<T, E>,
    id: ConnectionId,
    settled: bool,
}

impl<T, E> PendingSlot<'_, T, E> {
    fn complete(mut self, connection: Arc<T>) -> Result<Lease, Arc<T>> {
        self.settled = true;
        self.pool.shared.state.lock().complete(self.id, connection)
    }
}

impl<T, E> Drop for PendingSlot<'_, T, E> {
    fn drop(&mut self) {
        if !self.settled {
            self.pool.shared.state.lock().abandon(self.id);
        }
    }
}

/// A request parked in the waiter queue.
///
/// If the caller stops waiting after a grant was already sent, the grant is
/// taken back on drop so the connection or creation slot is not lost.
struct QueuedRequest<'a, T, E> {
    pool: &'a ConnectionPool<T, E>,
    receiver: oneshot::Receiver<Grant<T>>,
}

impl<T, E> QueuedRequest<'_, T, E> {
    async fn wait(mut self) -> Grant<T> {
        // a queued sender is always answered unless this receiver was closed first
        (&mut self.receiver).await.unwrap_or(Grant::Closed)
    }
}

impl<T, E> Drop for QueuedRequest<'_, T, E> {
    fn drop(&mut self) {
        self.receiver.close();
        if let Ok(grant) = self.receiver.try_recv() {
            trace!("Queued request abandoned, reclaiming its grant");
            self.pool.shared.state.lock().restore(grant);
        }
    }
}
