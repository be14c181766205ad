//! Point-in-time view of a pool's bookkeeping

/// Snapshot of a connection pool
///
/// # Examples
///
/// ```
/// use connections_pool::PoolStatus;
///
/// let status = PoolStatus {
///     connection_limit: 4,
///     total: 3,
///     free: 1,
///     acquired: 2,
///     pending: 1,
///     waiters: 0,
///     closed: false,
/// };
///
/// assert_eq!(status.available(), 1);
/// assert!(status.is_saturated());
/// assert_eq!(status.utilization(), 0.5);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct PoolStatus {
    /// Configured maximum of live plus pending connections
    pub connection_limit: usize,

    /// Live connections (free and acquired)
    pub total: usize,

    /// Idle connections ready for reuse
    pub free: usize,

    /// Connections checked out to consumers
    pub acquired: usize,

    /// Factory calls in flight
    pub pending: usize,

    /// Requests queued for a connection
    pub waiters: usize,

    /// Whether the pool has been closed
    pub closed: bool,
}

impl PoolStatus {
    /// Connections a request could get right now without waiting:
    /// idle ones plus room left for new creations.
    pub fn available(&self) -> usize {
        if self.closed {
            return 0;
        }
        self.free + self.connection_limit.saturating_sub(self.total + self.pending)
    }

    /// Whether no further connection may be created
    pub fn is_saturated(&self) -> bool {
        self.total + self.pending >= self.connection_limit
    }

    /// Share of the limit currently checked out (0.0 to 1.0)
    pub fn utilization(&self) -> f64 {
        if self.connection_limit > 0 {
            self.acquired as f64 / self.connection_limit as f64
        } else {
            0.0
        }
    }
}
