//! Scheduler configuration, loaded from RON.
//!
//! ```ron
//! (
//!     idle_poll_ms: 500,
//!     abort_grace_ms: 5000,
//!     ai_ping_timeout_ms: 5000,
//!     ai_concurrency: 4,
//!     flow_capacity: 1024,
//! )
//! ```
//!
//! Every field is optional; missing fields take their defaults.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use quire_types::AI_TASK_PING_TIMEOUT_MS;

use crate::error::ConfigError;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Fallback wake-up period for the dispatch loops when no change
    /// notification arrives.
    pub idle_poll_ms: u64,
    /// How long an executor waits for the backend to acknowledge an abort
    /// before dropping the call.
    pub abort_grace_ms: u64,
    /// AI task liveness window.
    pub ai_ping_timeout_ms: u64,
    /// AI tasks in flight per document.
    pub ai_concurrency: usize,
    /// FlowBus channel capacity per document.
    pub flow_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            idle_poll_ms: 500,
            abort_grace_ms: 5_000,
            ai_ping_timeout_ms: AI_TASK_PING_TIMEOUT_MS,
            ai_concurrency: 4,
            flow_capacity: 1024,
        }
    }
}

impl SchedulerConfig {
    pub fn from_ron(content: &str) -> Result<Self, ConfigError> {
        let config: Self = ron::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config = Self::from_ron(&content)?;
        tracing::debug!(path = %path.as_ref().display(), ?config, "loaded scheduler config");
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let zero = [
            ("idle_poll_ms", self.idle_poll_ms == 0),
            ("abort_grace_ms", self.abort_grace_ms == 0),
            ("ai_ping_timeout_ms", self.ai_ping_timeout_ms == 0),
            ("ai_concurrency", self.ai_concurrency == 0),
            ("flow_capacity", self.flow_capacity == 0),
        ];
        match zero.iter().find(|(_, is_zero)| *is_zero) {
            Some((field, _)) => Err(ConfigError::ValidationFailed(format!(
                "{field} must be greater than zero"
            ))),
            None => Ok(()),
        }
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    pub fn abort_grace(&self) -> Duration {
        Duration::from_millis(self.abort_grace_ms)
    }

    /// Running AI tasks are pinged five times per liveness window.
    pub fn ai_ping_interval(&self) -> Duration {
        Duration::from_millis((self.ai_ping_timeout_ms / 5).max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn partial_config_uses_defaults() {
        let config = SchedulerConfig::from_ron("(idle_poll_ms: 50)").unwrap();
        assert_eq!(config.idle_poll_ms, 50);
        assert_eq!(config.ai_concurrency, 4);
        assert_eq!(config.ai_ping_interval(), Duration::from_millis(1_000));
    }

    #[test]
    fn zero_values_are_rejected() {
        let err = SchedulerConfig::from_ron("(ai_concurrency: 0)").unwrap_err();
        assert!(matches!(err, ConfigError::ValidationFailed(_)));
        assert!(err.to_string().contains("ai_concurrency"));
    }

    #[test]
    fn malformed_ron_is_a_parse_error() {
        assert!(matches!(
            SchedulerConfig::from_ron("(idle_poll_ms: \"soon\")"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "(abort_grace_ms: 250, flow_capacity: 64)").unwrap();
        let config = SchedulerConfig::load(file.path()).unwrap();
        assert_eq!(config.abort_grace(), Duration::from_millis(250));
        assert_eq!(config.flow_capacity, 64);

        assert!(matches!(
            SchedulerConfig::load("/nonexistent/quire.ron"),
            Err(ConfigError::Io(_))
        ));
    }
}
