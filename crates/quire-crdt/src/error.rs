//! Error types for document operations.

use thiserror::Error;

use quire_types::{BatchId, BlockId, ExecutionStatus, GroupId, ItemId, TaskId};

/// Errors that can occur while mutating a notebook document.
#[derive(Error, Debug)]
pub enum DocError {
    /// Block not found in document.
    #[error("block not found: {0:?}")]
    BlockNotFound(BlockId),

    /// Duplicate block ID.
    #[error("block already exists: {0:?}")]
    DuplicateBlock(BlockId),

    /// Block already has a tab somewhere in the layout.
    #[error("block {0:?} is already placed in the layout")]
    AlreadyPlaced(BlockId),

    #[error("block group not found: {0:?}")]
    GroupNotFound(GroupId),

    /// Tried to enqueue a block type that never executes.
    #[error("block {0:?} is not executable")]
    NotExecutable(BlockId),

    #[error("batch not found: {0:?}")]
    BatchNotFound(BatchId),

    #[error("queue item not found: {0:?}")]
    ItemNotFound(ItemId),

    #[error("AI task not found: {0:?}")]
    TaskNotFound(TaskId),

    /// Another item is already running; at most one may run per document.
    #[error("item {running:?} is already running")]
    AlreadyRunning { running: ItemId },

    /// Only the current item of the head batch may start running.
    #[error("item {0:?} is not the current item of the head batch")]
    NotCurrent(ItemId),

    /// Item was asked to stop (or carries an unknown status) before it started.
    #[error("item {item:?} cannot start from status {status}")]
    NotStartable { item: ItemId, status: ExecutionStatus },

    /// Terminal statuses are final.
    #[error("item {item:?} already finished with status {status}")]
    AlreadyFinished { item: ItemId, status: ExecutionStatus },

    /// `advance()` while the head batch still has work.
    #[error("batch {0:?} still has unfinished items")]
    BatchNotFinished(BatchId),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, DocError>;
