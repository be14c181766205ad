//! Pool configuration options

/// Configuration for connection pool behavior
///
/// # Examples
///
/// ```
/// use connections_pool::PoolConfiguration;
///
/// let config = PoolConfiguration::new()
///     .with_connection_limit(4)
///     .with_wait_for_connection(false);
///
/// assert_eq!(config.connection_limit, 4);
/// assert!(!config.wait_for_connection);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfiguration {
    /// Maximum number of live plus in-flight connections
    pub connection_limit: usize,

    /// Whether `get_connection` queues when nothing is available
    pub wait_for_connection: bool,

    /// Whether `remove_connection` closes the evicted connection
    pub close_removed_connections: bool,
}

impl Default for PoolConfiguration {
    fn default() -> Self {
        Self {
            connection_limit: 10,
            wait_for_connection: true,
            close_removed_connections: true,
        }
    }
}

impl PoolConfiguration {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the connection limit
    ///
    /// # Examples
    ///
    /// ```
    /// use connections_pool::PoolConfiguration;
    ///
    /// let config = PoolConfiguration::new().with_connection_limit(2);
    /// assert_eq!(config.connection_limit, 2);
    /// ```
    pub fn with_connection_limit(mut self, limit: usize) -> Self {
        self.connection_limit = limit;
        self
    }

    /// Set the default waiting behavior of `get_connection`
    pub fn with_wait_for_connection(mut self, wait: bool) -> Self {
        self.wait_for_connection = wait;
        self
    }

    /// Set whether removed connections are closed by the pool
    pub fn with_close_removed_connections(mut self, close: bool) -> Self {
        self.close_removed_connections = close;
        self
    }

    /// Check the configuration, returning a description of the first problem.
    ///
    /// ```
    /// use connections_pool::PoolConfiguration;
    ///
    /// let config = PoolConfiguration::new().with_connection_limit(0);
    /// assert!(config.validate().is_err());
    /// ```
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.connection_limit == 0 {
            return Err("connection_limit must be at least 1");
        }
        Ok(())
    }
}
