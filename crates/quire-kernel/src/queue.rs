//! Execution queue handle.
//!
//! Thin, cloneable front over the queue stored in the notebook document.
//! Every mutation goes through [`Notebook::update`] so change notifications
//! reach the dispatcher, the run-all orchestrator and any observers.

use std::sync::Arc;
use std::time::Duration;

use quire_crdt::{Batch, DocError, QueueItem};
use quire_types::{
    BatchId, BlockId, ExecutionMetadata, ExecutionStatus, GroupId, ItemId, RunAll, RunAllStatus,
    UserId,
};

use crate::error::KernelResult;
use crate::flows::NotebookFlow;
use crate::notebook::SharedNotebook;
use crate::observe::{AbortWatch, ObserverGuard, ObserverHub};

/// Subject pattern covering every queue change.
pub const QUEUE_SUBJECTS: &str = "queue.>";

#[derive(Clone)]
pub struct ExecutionQueue {
    notebook: SharedNotebook,
    observers: Arc<ObserverHub>,
    idle_poll: Duration,
}

impl ExecutionQueue {
    pub fn new(notebook: SharedNotebook, idle_poll: Duration) -> Self {
        let observers = ObserverHub::new(notebook.clone(), QUEUE_SUBJECTS);
        Self {
            notebook,
            observers,
            idle_poll,
        }
    }

    pub fn notebook(&self) -> &SharedNotebook {
        &self.notebook
    }

    // ------------------------------------------------------------------------
    // Producers
    // ------------------------------------------------------------------------

    /// Run one block as its own batch.
    pub fn enqueue_block(
        &self,
        block_id: &BlockId,
        user_id: Option<UserId>,
        metadata: ExecutionMetadata,
    ) -> KernelResult<BatchId> {
        Ok(self
            .notebook
            .update(|doc| doc.enqueue_block(block_id, user_id, metadata))?)
    }

    /// Run an ordered chain of blocks as one batch.
    pub fn enqueue_dependency_run(
        &self,
        blocks: &[BlockId],
        user_id: Option<UserId>,
        is_run_all: bool,
    ) -> KernelResult<Option<BatchId>> {
        Ok(self
            .notebook
            .update(|doc| doc.enqueue_dependency_run(blocks, user_id, is_run_all))?)
    }

    /// Compute the upstream blocks `target` needs and enqueue them, followed
    /// by `target` itself with `metadata`, as a single batch.
    pub fn enqueue_with_dependencies(
        &self,
        target: &BlockId,
        user_id: Option<UserId>,
        metadata: ExecutionMetadata,
        environment_started_at: Option<u64>,
        force_all: bool,
    ) -> KernelResult<BatchId> {
        let batch_id = self.notebook.update(|doc| -> Result<BatchId, DocError> {
            let mut items = Vec::new();
            for id in doc.dependency_queue(target, force_all, environment_started_at) {
                let kind = doc
                    .block(&id)
                    .map(|b| b.kind())
                    .ok_or_else(|| DocError::BlockNotFound(id.clone()))?;
                let upstream = ExecutionMetadata::for_kind(kind)
                    .ok_or_else(|| DocError::NotExecutable(id.clone()))?;
                items.push((id, upstream));
            }
            items.push((target.clone(), metadata));
            doc.enqueue_items(items, user_id, false, false)?
                .ok_or_else(|| DocError::BlockNotFound(target.clone()))
        })?;
        tracing::debug!(block_id = %target, batch_id = %batch_id, "enqueued with dependencies");
        Ok(batch_id)
    }

    pub fn enqueue_block_group(
        &self,
        group_id: GroupId,
        user_id: Option<UserId>,
    ) -> KernelResult<Option<BatchId>> {
        Ok(self
            .notebook
            .update(|doc| doc.enqueue_block_group(group_id, user_id))?)
    }

    pub fn enqueue_run_all(
        &self,
        user_id: Option<UserId>,
        is_schedule: bool,
    ) -> KernelResult<Option<BatchId>> {
        Ok(self
            .notebook
            .update(|doc| doc.enqueue_run_all(user_id, is_schedule))?)
    }

    // ------------------------------------------------------------------------
    // Consumer side
    // ------------------------------------------------------------------------

    pub fn current_batch(&self) -> Option<Batch> {
        self.notebook.read(|doc| doc.current_batch().cloned())
    }

    /// Drop the head batch. Fails while it still has unfinished items.
    pub fn advance(&self) -> KernelResult<Option<BatchId>> {
        Ok(self.notebook.update(|doc| doc.advance())?)
    }

    /// Items for `block_id`, optionally filtered by metadata tag.
    pub fn block_executions(&self, block_id: &BlockId, tag: Option<&str>) -> Vec<QueueItem> {
        self.notebook.read(|doc| {
            doc.block_executions(block_id, tag)
                .into_iter()
                .cloned()
                .collect()
        })
    }

    pub fn item_status(&self, item_id: ItemId) -> Option<ExecutionStatus> {
        self.notebook
            .read(|doc| doc.queue_item(item_id).map(|i| i.status()))
    }

    pub fn is_empty(&self) -> bool {
        self.notebook.read(|doc| doc.queue().is_empty())
    }

    /// Upstream blocks that would run before `target`.
    pub fn dependency_queue(
        &self,
        target: &BlockId,
        force_all: bool,
        environment_started_at: Option<u64>,
    ) -> Vec<BlockId> {
        self.notebook
            .read(|doc| doc.dependency_queue(target, force_all, environment_started_at))
    }

    // ------------------------------------------------------------------------
    // Abort
    // ------------------------------------------------------------------------

    /// Ask the executor of `item_id` to stop. The item's eventual status is
    /// authoritative, not this return value.
    pub fn request_abort(&self, item_id: ItemId) -> KernelResult<bool> {
        Ok(self.notebook.update(|doc| doc.request_abort(item_id))?)
    }

    pub fn abort_batch(&self, batch_id: BatchId) -> KernelResult<usize> {
        Ok(self.notebook.update(|doc| doc.abort_batch(batch_id))?)
    }

    /// Token cancelled once `item_id` is aborting or gone from the queue.
    pub fn watch_abort(&self, item_id: ItemId) -> AbortWatch {
        AbortWatch::spawn(
            self.notebook.clone(),
            "queue.>",
            self.idle_poll,
            move |doc| {
                doc.queue_item(item_id)
                    .is_none_or(|item| item.status() == ExecutionStatus::Aborting)
            },
        )
    }

    // ------------------------------------------------------------------------
    // Run-all requests
    // ------------------------------------------------------------------------

    /// Ask the orchestrator to run every block. No-op unless idle.
    pub fn request_run_all(&self) -> bool {
        self.notebook.update(|doc| {
            if doc.run_all().status != RunAllStatus::Idle {
                return false;
            }
            doc.set_run_all_status(RunAllStatus::RunRequested);
            true
        })
    }

    /// Ask the orchestrator to stop a run-all in progress.
    pub fn request_run_all_abort(&self) -> bool {
        self.notebook.update(|doc| {
            match doc.run_all().status {
                RunAllStatus::RunRequested | RunAllStatus::Running | RunAllStatus::ScheduleRunning => {
                    doc.set_run_all_status(RunAllStatus::AbortRequested);
                    true
                }
                _ => false,
            }
        })
    }

    /// Start a scheduled run: enqueue everything now and hand tracking to
    /// the orchestrator.
    pub fn run_scheduled(&self, user_id: Option<UserId>) -> KernelResult<Option<BatchId>> {
        Ok(self.notebook.update(|doc| -> Result<Option<BatchId>, DocError> {
            if doc.run_all().status.is_busy() {
                return Ok(None);
            }
            let Some(batch_id) = doc.enqueue_run_all(user_id, true)? else {
                return Ok(None);
            };
            let total = doc.queue().batch(batch_id).map_or(0, |b| b.len());
            doc.set_run_all(RunAll {
                status: RunAllStatus::ScheduleRunning,
                remaining: total,
                total,
            });
            Ok(Some(batch_id))
        })?)
    }

    // ------------------------------------------------------------------------
    // Observation
    // ------------------------------------------------------------------------

    /// Call `callback` on every queue change until the guard is dropped.
    pub fn observe(&self, callback: impl Fn(&NotebookFlow) + Send + Sync + 'static) -> ObserverGuard {
        self.observers.observe(callback)
    }

    pub fn observer_count(&self) -> usize {
        self.observers.observer_count()
    }
}

impl std::fmt::Debug for ExecutionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionQueue")
            .field("document_id", &self.notebook.document_id())
            .finish_non_exhaustive()
    }
}
