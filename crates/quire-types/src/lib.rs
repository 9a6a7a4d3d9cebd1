//! Shared identity, block and execution types for quire notebooks.
//!
//! A pure leaf crate: plain serde data with no I/O and no async. The document
//! store (`quire-crdt`) and the scheduler runtime (`quire-kernel`) both build
//! on it.
//!
//! # Key Types
//!
//! |------------------------|---------------------------------------------|
//! | Type                   | Purpose                                     |
//! |------------------------|---------------------------------------------|
//! | [`Block`]              | One notebook block (sum type over variants) |
//! | [`BlockKind`]          | Variant tag + executable predicate          |
//! | [`Output`]             | Python output record                        |
//! | [`ExecutionStatus`]    | Queue item lifecycle                        |
//! | [`ExecutionMetadata`]  | Per-kind run instructions                   |
//! | [`AiTaskStatus`]       | AI task lifecycle with liveness ping        |
//! | [`RunAll`]             | Document-wide run-all state                 |
//! | [`DataFrame`]          | Dataframe registry entry                    |
//! |------------------------|---------------------------------------------|

pub mod ai;
pub mod block;
pub mod dataframe;
pub mod execution;
pub mod ids;
pub mod output;
pub mod run_all;

pub use ai::{AI_TASK_PING_TIMEOUT_MS, AiTaskMetadata, AiTaskStatus};
pub use block::{
    Block, BlockBody, BlockKind, DateInputBlock, DateType, DateValue, DropdownInputBlock,
    EditableField, FieldError, FileUploadBlock, InputBlock, PythonBlock, RichTextBlock, SqlBlock,
    VisualizationBlock,
};
pub use dataframe::{DataFrame, DataFrameColumn, DataFrameInfo};
pub use execution::{BatchStatus, CompletionStatus, ExecutionMetadata, ExecutionStatus};
pub use ids::{BatchId, BlockId, DocumentId, GroupId, ItemId, ReplicaId, TaskId, UserId, WorkspaceId};
pub use output::{Output, SqlResult, StreamName};
pub use run_all::{RunAll, RunAllStatus};

/// Current time in milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
