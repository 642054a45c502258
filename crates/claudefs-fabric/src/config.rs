//! Configuration for fabric domains and their endpoints.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FabricError, FabricResult};

/// Smallest legal buffer event queue: one pending slot plus the slot owned by the consumer.
pub const MIN_QUEUE_CAPACITY: usize = 2;

/// Configuration for a fabric domain and the endpoints it starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FabricConfig {
    /// Blessed event entries allocated when an endpoint starts.
    pub initial_queue_capacity: usize,
    /// Upper bound on event queue growth; exceeding it fails provisioning.
    pub max_queue_capacity: usize,
    /// Largest memory region that may be registered as a buffer.
    pub max_buffer_size: usize,
    /// Maximum number of segments a buffer may span.
    pub max_buffer_segments: u32,
    /// Maximum size of a single buffer segment.
    pub max_segment_size: usize,
    /// How long the delivery loop blocks before re-checking for shutdown.
    pub event_wait_timeout_ms: u64,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            initial_queue_capacity: MIN_QUEUE_CAPACITY,
            max_queue_capacity: 1 << 20,
            max_buffer_size: 64 * 1024 * 1024, // 64MB
            max_buffer_segments: 256,
            max_segment_size: 4 * 1024 * 1024, // 4MB
            event_wait_timeout_ms: 1000,
        }
    }
}

impl FabricConfig {
    /// Returns the delivery loop wait timeout as a [`Duration`].
    pub fn event_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.event_wait_timeout_ms)
    }

    /// Checks the configuration for internal consistency.
    pub fn validate(&self) -> FabricResult<()> {
        if self.initial_queue_capacity < MIN_QUEUE_CAPACITY {
            return Err(FabricError::InvalidConfig {
                reason: format!(
                    "initial_queue_capacity {} is below the minimum of {}",
                    self.initial_queue_capacity, MIN_QUEUE_CAPACITY
                ),
            });
        }
        if self.max_queue_capacity < self.initial_queue_capacity {
            return Err(FabricError::InvalidConfig {
                reason: format!(
                    "max_queue_capacity {} is below initial_queue_capacity {}",
                    self.max_queue_capacity, self.initial_queue_capacity
                ),
            });
        }
        if self.max_buffer_size == 0 || self.max_segment_size == 0 || self.max_buffer_segments == 0
        {
            return Err(FabricError::InvalidConfig {
                reason: "buffer size limits must be non-zero".to_string(),
            });
        }
        if self.event_wait_timeout_ms == 0 {
            return Err(FabricError::InvalidConfig {
                reason: "event_wait_timeout_ms must be non-zero".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = FabricConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.initial_queue_capacity, 2);
        assert_eq!(config.event_wait_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn test_initial_capacity_below_minimum() {
        let config = FabricConfig {
            initial_queue_capacity: 1,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(FabricError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_max_below_initial() {
        let config = FabricConfig {
            initial_queue_capacity: 64,
            max_queue_capacity: 8,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let config = FabricConfig {
            event_wait_timeout_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_json_roundtrip() {
        let config = FabricConfig {
            initial_queue_capacity: 16,
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let parsed: FabricConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }
}
