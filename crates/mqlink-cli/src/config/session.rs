//! Session timing configuration.

use std::time::Duration;

use serde::Deserialize;

/// Default bound on waiting for an engine to stop, in milliseconds.
pub const DEFAULT_STOP_TIMEOUT_MS: u64 = 2_000;

/// Default bound on waiting for one operation's result, in milliseconds.
pub const DEFAULT_OPERATION_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How long disconnect and reconnect wait for the engine thread.
    pub stop_timeout_ms: u64,
    /// How long a step waits for its acknowledgment before it counts as
    /// failed.
    pub operation_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            stop_timeout_ms: DEFAULT_STOP_TIMEOUT_MS,
            operation_timeout_ms: DEFAULT_OPERATION_TIMEOUT_MS,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.stop_timeout_ms == 0 {
            return Err("session.stop_timeout_ms must be greater than 0".into());
        }
        if self.operation_timeout_ms == 0 {
            return Err("session.operation_timeout_ms must be greater than 0".into());
        }
        Ok(())
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SessionConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.operation_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_zero_timeouts_fail() {
        let config = SessionConfig {
            operation_timeout_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = SessionConfig {
            stop_timeout_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
