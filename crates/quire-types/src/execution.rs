//! Execution-queue status and metadata types.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum::EnumString;

use crate::block::BlockKind;

/// Status of one execution-queue item.
///
/// `enqueued → running → {success, error, aborted}`, with `aborting` as the
/// requester-side abort marker. `unknown` covers records written by a newer
/// peer that this build cannot interpret; the dispatcher treats it like an
/// abort.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum ExecutionStatus {
    #[default]
    Enqueued,
    Running,
    Aborting,
    Success,
    Error,
    Aborted,
    #[serde(other)]
    Unknown,
}

impl ExecutionStatus {
    /// Parse from string (case-insensitive).
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        <Self as FromStr>::from_str(s).ok()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Enqueued => "enqueued",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Aborting => "aborting",
            ExecutionStatus::Success => "success",
            ExecutionStatus::Error => "error",
            ExecutionStatus::Aborted => "aborted",
            ExecutionStatus::Unknown => "unknown",
        }
    }

    /// Success, Error or Aborted.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Success | ExecutionStatus::Error | ExecutionStatus::Aborted
        )
    }

    pub fn is_running(&self) -> bool {
        matches!(self, ExecutionStatus::Running)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The terminal outcome an executor reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionStatus {
    Success,
    Error,
    Aborted,
}

impl CompletionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompletionStatus::Success => "success",
            CompletionStatus::Error => "error",
            CompletionStatus::Aborted => "aborted",
        }
    }
}

impl From<CompletionStatus> for ExecutionStatus {
    fn from(status: CompletionStatus) -> Self {
        match status {
            CompletionStatus::Success => ExecutionStatus::Success,
            CompletionStatus::Error => ExecutionStatus::Error,
            CompletionStatus::Aborted => ExecutionStatus::Aborted,
        }
    }
}

impl std::fmt::Display for CompletionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate status of a batch, derived from its items.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Enqueued,
    Running,
    Aborting,
    Completed,
}

/// Type-specific instructions attached to a queue item.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ExecutionMetadata {
    /// Run the block source, or its pending AI suggestion.
    Python { is_suggestion: bool },
    Sql {
        is_suggestion: bool,
        /// Run only this fragment of the source.
        selected_code: Option<String>,
    },
    Visualization,
    /// Save the pending variable name and value of a text input.
    TextInput,
    DropdownInput,
    DateInput,
}

impl ExecutionMetadata {
    /// Default metadata for running a block of the given kind, or `None` for
    /// kinds that never execute.
    pub fn for_kind(kind: BlockKind) -> Option<Self> {
        match kind {
            BlockKind::Python => Some(ExecutionMetadata::Python {
                is_suggestion: false,
            }),
            BlockKind::Sql => Some(ExecutionMetadata::Sql {
                is_suggestion: false,
                selected_code: None,
            }),
            BlockKind::Visualization => Some(ExecutionMetadata::Visualization),
            BlockKind::Input => Some(ExecutionMetadata::TextInput),
            BlockKind::DropdownInput => Some(ExecutionMetadata::DropdownInput),
            BlockKind::DateInput => Some(ExecutionMetadata::DateInput),
            BlockKind::RichText | BlockKind::FileUpload | BlockKind::DashboardHeader => None,
        }
    }

    /// The block kind this metadata can run against.
    pub fn block_kind(&self) -> BlockKind {
        match self {
            ExecutionMetadata::Python { .. } => BlockKind::Python,
            ExecutionMetadata::Sql { .. } => BlockKind::Sql,
            ExecutionMetadata::Visualization => BlockKind::Visualization,
            ExecutionMetadata::TextInput => BlockKind::Input,
            ExecutionMetadata::DropdownInput => BlockKind::DropdownInput,
            ExecutionMetadata::DateInput => BlockKind::DateInput,
        }
    }

    /// Wire tag, used to filter per-block execution lookups.
    pub fn tag(&self) -> &'static str {
        match self {
            ExecutionMetadata::Python { .. } => "python",
            ExecutionMetadata::Sql { .. } => "sql",
            ExecutionMetadata::Visualization => "visualization",
            ExecutionMetadata::TextInput => "text-input",
            ExecutionMetadata::DropdownInput => "dropdown-input",
            ExecutionMetadata::DateInput => "date-input",
        }
    }
}
