//! AI-assist task status and metadata.

use serde::{Deserialize, Serialize};

use crate::block::BlockKind;
use crate::execution::CompletionStatus;

/// How long a running task may go without a ping before another worker may
/// take it over.
pub const AI_TASK_PING_TIMEOUT_MS: u64 = 5_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum AiTaskStatus {
    Enqueued,
    /// Owned by a worker that last proved liveness at `ping` (ms).
    Running { ping: u64 },
    Aborting,
    Completed { result: CompletionStatus },
    #[serde(other)]
    Unknown,
}

impl AiTaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AiTaskStatus::Enqueued => "enqueued",
            AiTaskStatus::Running { .. } => "running",
            AiTaskStatus::Aborting => "aborting",
            AiTaskStatus::Completed { .. } => "completed",
            AiTaskStatus::Unknown => "unknown",
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, AiTaskStatus::Completed { .. })
    }
}

impl std::fmt::Display for AiTaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum AiTaskMetadata {
    /// Rewrite the block source following its edit prompt.
    EditPython,
    /// Propose a fix for the error in the block's last result.
    FixPython,
    EditSql,
    FixSql,
}

impl AiTaskMetadata {
    pub fn block_kind(&self) -> BlockKind {
        match self {
            AiTaskMetadata::EditPython | AiTaskMetadata::FixPython => BlockKind::Python,
            AiTaskMetadata::EditSql | AiTaskMetadata::FixSql => BlockKind::Sql,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AiTaskMetadata::EditPython => "edit-python",
            AiTaskMetadata::FixPython => "fix-python",
            AiTaskMetadata::EditSql => "edit-sql",
            AiTaskMetadata::FixSql => "fix-sql",
        }
    }
}
