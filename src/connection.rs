//! Connection capability contract and the pooled connection handle

use async_trait::async_trait;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use crate::errors::PoolResult;
use crate::pool::ConnectionPool;

/// Capability contract every pooled resource must satisfy.
///
/// The pool only ever calls [`Connectable::close`]; `ping` is offered so
/// consumers can probe a connection before deciding to remove it.
///
/// # Examples
///
/// ```
/// use async_trait::async_trait;
/// use connections_pool::Connectable;
/// use std::sync::atomic::{AtomicBool, Ordering};
///
/// struct Session {
///     open: AtomicBool,
/// }
///
/// #[async_trait]
/// impl Connectable for Session {
///     async fn close(&self) {
///         self.open.store(false, Ordering::SeqCst);
///     }
///
///     async fn ping(&self) -> bool {
///         self.open.load(Ordering::SeqCst)
///     }
/// }
/// ```
#[async_trait]
pub trait Connectable: Send + Sync + 'static {
    /// Close the underlying resource.
    async fn close(&self);

    /// Liveness probe. Never invoked by the pool itself.
    async fn ping(&self) -> bool {
        true
    }
}

/// Identity of a connection inside one pool.
///
/// Ids are handed out in creation order and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ConnectionId(pub(crate) u64);

impl ConnectionId {
    /// The raw numeric value of the id
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Checkout number issued each time a connection is acquired.
pub(crate) type Lease = u64;

/// A connection checked out of a [`ConnectionPool`].
///
/// Dereferences to the pooled resource. Hand it back with
/// [`release`](Self::release), or evict it with [`remove`](Self::remove).
/// A handle dropped without either is released automatically, provided its
/// checkout is still the current one for that connection.
pub struct PoolConnection<T, E> {
    connection: Arc<T>,
    id: ConnectionId,
    lease: Lease,
    pool: ConnectionPool<T, E>,
    returned: bool,
}

impl<T, E> PoolConnection<T, E> {
    pub(crate) fn new(
        pool: ConnectionPool<T, E>,
        id: ConnectionId,
        lease: Lease,
        connection: Arc<T>,
    ) -> Self {
        Self {
            connection,
            id,
            lease,
            pool,
            returned: false,
        }
    }

    /// The pool-wide identity of this connection
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Return the connection to the pool.
    ///
    /// If consumers are queued, the oldest one receives this connection
    /// before the call returns.
    ///
    /// # Errors
    ///
    /// [`PoolError::NotAcquired`](crate::PoolError::NotAcquired) if this
    /// checkout was already ended through
    /// [`ConnectionPool::release_connection`] or a removal.
    pub fn release(mut self) -> PoolResult<(), E> {
        self.returned = true;
        self.pool.release_lease(self.id, Some(self.lease))
    }
}

impl<T: Connectable, E: Send + 'static> PoolConnection<T, E> {
    /// Evict the connection from the pool instead of recycling it.
    ///
    /// Returns `false` if the connection had already left the pool.
    pub async fn remove(mut self) -> bool {
        self.returned = true;
        self.pool.remove_connection(self.id).await
    }
}

impl<T, E> Deref for PoolConnection<T, E> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.connection
    }
}

impl<T, E> Drop for PoolConnection<T, E> {
    fn drop(&mut self) {
        if self.returned {
            return;
        }
        if self.pool.release_lease(self.id, Some(self.lease)).is_err() {
            tracing::trace!(connection_id = %self.id, "Dropped stale connection handle");
        }
    }
}

impl<T: fmt::Debug, E> fmt::Debug for PoolConnection<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolConnection")
            .field("id", &self.id)
            .field("lease", &self.lease)
            .field("connection", &self.connection)
            .finish()
    }
}
