//! Error types for the connection pool

use thiserror::Error;

use crate::connection::ConnectionId;

/// Errors surfaced by pool operations.
///
/// `E` is the error type of the connection factory. Factory failures are
/// passed through untouched in [`PoolError::Factory`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError<E> {
    #[error("Pool is closed")]
    PoolClosed,

    #[error("No available connections")]
    NoAvailableConnection,

    #[error("Connection {0} was not acquired")]
    NotAcquired(ConnectionId),

    #[error("Connection {0} has already been released")]
    AlreadyReleased(ConnectionId),

    #[error("Invalid pool configuration: {0}")]
    InvalidConfiguration(&'static str),

    #[error("Connection factory failed: {0}")]
    Factory(#[source] E),
}

impl<E> PoolError<E> {
    /// Returns the factory error, if this is one.
    pub fn into_factory_error(self) -> Option<E> {
        match self {
            PoolError::Factory(err) => Some(err),
            _ => None,
        }
    }
}

pub type PoolResult<T, E> = Result<T, PoolError<E>>;
