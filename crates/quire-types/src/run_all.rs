//! Document-wide run-all state.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum::EnumString;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default, EnumString)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum RunAllStatus {
    #[default]
    Idle,
    RunRequested,
    Running,
    AbortRequested,
    Aborting,
    ScheduleRunning,
}

impl RunAllStatus {
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        <Self as FromStr>::from_str(s).ok()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunAllStatus::Idle => "idle",
            RunAllStatus::RunRequested => "run-requested",
            RunAllStatus::Running => "running",
            RunAllStatus::AbortRequested => "abort-requested",
            RunAllStatus::Aborting => "aborting",
            RunAllStatus::ScheduleRunning => "schedule-running",
        }
    }

    /// A run-all batch is (or is about to be) on the queue.
    pub fn is_busy(&self) -> bool {
        !matches!(self, RunAllStatus::Idle)
    }
}

impl std::fmt::Display for RunAllStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Singleton per document.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunAll {
    pub status: RunAllStatus,
    pub remaining: usize,
    pub total: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings() {
        assert_eq!(
            RunAllStatus::from_str("abort-requested"),
            Some(RunAllStatus::AbortRequested)
        );
        assert_eq!(RunAllStatus::ScheduleRunning.to_string(), "schedule-running");
        assert!(!RunAll::default().status.is_busy());
    }
}
