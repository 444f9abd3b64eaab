//! Protocol tunables and their validation.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Default virtual-neighbor set capacity.
pub const DEFAULT_VSET_SIZE: usize = 4;

/// Default number of silent ticks before a neighbor is marked failed.
pub const DEFAULT_FAIL_TIMEOUT: u32 = 4;

/// Default number of idle ticks before a node activates itself.
pub const DEFAULT_ACTIVE_TIMEOUT: u32 = 8;

/// Configuration error types.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("vset size must be a positive even number, got {0}")]
    VsetSize(usize),

    #[error("fail timeout must be at least one tick")]
    FailTimeout,

    #[error("active timeout must be at least one tick")]
    ActiveTimeout,

    #[error("hello jitter must be smaller than the hello period")]
    HelloJitter,

    #[error("inbox and update queue depths must be positive")]
    QueueDepth,
}

/// Per-node protocol configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Capacity of the virtual-neighbor set (must be even).
    pub vset_size: usize,

    /// Silent ticks before a physical neighbor is marked failed; the entry
    /// is purged after twice this many.
    pub fail_timeout: u32,

    /// Idle ticks before an inactive node activates itself.
    pub active_timeout: u32,

    /// Base period of the periodic driver (hello beacon, failure accounting).
    #[serde(with = "humantime_serde")]
    pub hello_period: Duration,

    /// Uniform jitter applied to each period, in both directions.
    #[serde(with = "humantime_serde")]
    pub hello_jitter: Duration,

    /// Bounded inbox depth; fabric enqueues beyond it are dropped.
    pub inbox_depth: usize,

    /// Bounded queue depth for hello-derived state updates.
    pub update_queue_depth: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            vset_size: DEFAULT_VSET_SIZE,
            fail_timeout: DEFAULT_FAIL_TIMEOUT,
            active_timeout: DEFAULT_ACTIVE_TIMEOUT,
            hello_period: Duration::from_millis(500),
            hello_jitter: Duration::from_millis(300),
            inbox_depth: 256,
            update_queue_depth: 100,
        }
    }
}

impl ProtocolConfig {
    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.vset_size == 0 || self.vset_size % 2 != 0 {
            return Err(ConfigError::VsetSize(self.vset_size));
        }
        if self.fail_timeout == 0 {
            return Err(ConfigError::FailTimeout);
        }
        if self.active_timeout == 0 {
            return Err(ConfigError::ActiveTimeout);
        }
        if self.hello_jitter >= self.hello_period {
            return Err(ConfigError::HelloJitter);
        }
        if self.inbox_depth == 0 || self.update_queue_depth == 0 {
            return Err(ConfigError::QueueDepth);
        }
        Ok(())
    }

    /// Half of the vset capacity: the per-side neighborhood radius.
    pub fn vset_radius(&self) -> usize {
        self.vset_size / 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ProtocolConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.vset_radius(), 2);
    }

    #[test]
    fn test_odd_vset_size_rejected() {
        let config = ProtocolConfig {
            vset_size: 3,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::VsetSize(3))));
    }

    #[test]
    fn test_jitter_must_stay_below_period() {
        let config = ProtocolConfig {
            hello_period: Duration::from_millis(200),
            hello_jitter: Duration::from_millis(200),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::HelloJitter)));
    }

    #[test]
    fn test_zero_queue_depth_rejected() {
        let config = ProtocolConfig {
            inbox_depth: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::QueueDepth)));
    }

    #[test]
    fn test_yaml_parsing_with_humantime() {
        let yaml = r#"
vset_size: 4
fail_timeout: 4
active_timeout: 8
hello_period: 500ms
hello_jitter: 300ms
"#;

        let config: ProtocolConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.hello_period, Duration::from_millis(500));
        assert_eq!(config.hello_jitter, Duration::from_millis(300));
        // Omitted fields fall back to defaults.
        assert_eq!(config.inbox_depth, 256);
    }
}
