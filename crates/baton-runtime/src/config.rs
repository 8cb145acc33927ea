//! Runtime configuration

use std::time::Duration;

use baton_core::constants::{DEFAULT_POLL_CEILING_MS, DEFAULT_SIGNAL_QUEUE};
use baton_core::env::{env_get, env_get_duration_ms};
use baton_core::{SchedError, SchedResult};

/// Configuration for the runtime
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Longest single wait in poll(2), even with no timers pending (default: 10s)
    pub poll_ceiling: Duration,

    /// Capacity of the queue between the signal handler and the bridge task
    pub signal_queue_capacity: usize,

    /// Log every spawn and task completion at info level
    pub debug_logging: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            poll_ceiling: Duration::from_millis(DEFAULT_POLL_CEILING_MS),
            signal_queue_capacity: DEFAULT_SIGNAL_QUEUE,
            debug_logging: cfg!(feature = "debug-logging"),
        }
    }
}

impl RuntimeConfig {
    /// Create a new configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `BATON_POLL_CEILING_MS` and `BATON_SIGNAL_QUEUE`
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            poll_ceiling: env_get_duration_ms("BATON_POLL_CEILING_MS", d.poll_ceiling),
            signal_queue_capacity: env_get("BATON_SIGNAL_QUEUE", d.signal_queue_capacity),
            debug_logging: d.debug_logging,
        }
    }

    /// Set the poll ceiling
    pub fn poll_ceiling(mut self, d: Duration) -> Self {
        self.poll_ceiling = d;
        self
    }

    /// Set the signal queue capacity
    pub fn signal_queue_capacity(mut self, n: usize) -> Self {
        self.signal_queue_capacity = n;
        self
    }

    /// Enable debug logging
    pub fn debug_logging(mut self, enable: bool) -> Self {
        self.debug_logging = enable;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> SchedResult<()> {
        if self.poll_ceiling.is_zero() {
            return Err(SchedError::Config("poll_ceiling must be non-zero"));
        }
        if self.signal_queue_capacity == 0 {
            return Err(SchedError::Config("signal_queue_capacity must be at least 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = RuntimeConfig::new();
        assert_eq!(c.poll_ceiling, Duration::from_secs(10));
        assert_eq!(c.signal_queue_capacity, 64);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero() {
        let c = RuntimeConfig::new().poll_ceiling(Duration::ZERO);
        assert!(matches!(c.validate(), Err(SchedError::Config(_))));

        let c = RuntimeConfig::new().signal_queue_capacity(0);
        assert!(c.validate().is_err());
    }
}
