//! Pool configuration.

use std::time::Duration;

/// Connection pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of concurrent general-purpose connections.
    ///
    /// Connections created for requests that require a specific event loop
    /// do not count against this cap.
    pub max_concurrent_connections: usize,
    /// Deadline applied to each connection attempt.
    pub connect_timeout: Duration,
    /// How long an idle connection is kept parked before it is closed.
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_concurrent_connections: 8,
            connect_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(60),
        }
    }
}

impl PoolConfig {
    /// Create a new configuration builder.
    pub fn builder() -> PoolConfigBuilder {
        PoolConfigBuilder::default()
    }
}

/// Builder for pool configuration.
#[derive(Debug, Default)]
pub struct PoolConfigBuilder {
    config: PoolConfig,
}

impl PoolConfigBuilder {
    /// Set the maximum number of concurrent general-purpose connections.
    pub fn max_concurrent_connections(mut self, max: usize) -> Self {
        self.config.max_concurrent_connections = max;
        self
    }

    /// Set the connection attempt deadline.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Set the idle connection park duration.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    /// Build the configuration.
    ///
    /// # Panics
    ///
    /// Panics if `max_concurrent_connections` is zero.
    pub fn build(self) -> PoolConfig {
        assert!(
            self.config.max_concurrent_connections > 0,
            "max_concurrent_connections must be at least 1"
        );
        self.config
    }
}
