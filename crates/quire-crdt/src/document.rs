//! NotebookDocument: the shared per-document store.
//!
//! Holds blocks, layout, dataframe registry, run-all state, execution queue
//! and AI task queue. Every public mutation:
//!
//! 1. ticks the Lamport clock and stamps what it writes,
//! 2. marks the document dirty (unsaved),
//! 3. records a [`Change`] for the runtime to drain and publish.
//!
//! Fields are private; callers only get the typed operations below, which
//! keep the layout and queue invariants intact.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use quire_types::{
    AiTaskMetadata, AiTaskStatus, BatchId, Block, BlockId, CompletionStatus, DataFrame,
    DataFrameInfo, ExecutionMetadata, ExecutionStatus, GroupId, ItemId, ReplicaId, RunAll,
    RunAllStatus, TaskId, UserId,
};

use crate::ai_tasks::{AiTask, AiTaskQueueState};
use crate::clock::{Lww, Stamp};
use crate::dataframes::DataframeRegistry;
use crate::dependency::compute_dependency_queue;
use crate::error::{DocError, Result};
use crate::layout::Layout;
use crate::queue::{Batch, ExecutionQueueState, QueueItem};

/// One observable mutation of the document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Change {
    BlockInserted {
        block_id: BlockId,
    },
    BlockUpdated {
        block_id: BlockId,
    },
    BlockRemoved {
        block_id: BlockId,
    },
    LayoutChanged,
    BatchEnqueued {
        batch_id: BatchId,
        is_run_all: bool,
    },
    BatchAdvanced {
        batch_id: BatchId,
    },
    /// Items were taken out of a batch.
    BatchUpdated {
        batch_id: BatchId,
    },
    ItemStatus {
        item_id: ItemId,
        block_id: BlockId,
        status: ExecutionStatus,
    },
    AiTaskEnqueued {
        task_id: TaskId,
        block_id: BlockId,
    },
    AiTaskStatus {
        task_id: TaskId,
        block_id: BlockId,
        status: AiTaskStatus,
    },
    AiTasksEvicted {
        task_ids: Vec<TaskId>,
    },
    DataframesChanged,
    RunAllChanged {
        run_all: RunAll,
    },
}

/// A field-level write from another replica.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RemoteUpdate {
    Block {
        block: Block,
        stamp: Stamp,
    },
    ItemStatus {
        item_id: ItemId,
        status: ExecutionStatus,
        stamp: Stamp,
    },
    AiTaskStatus {
        task_id: TaskId,
        status: AiTaskStatus,
        stamp: Stamp,
    },
    RunAll {
        run_all: RunAll,
        stamp: Stamp,
    },
}

/// Serializable image of a document, for persistence.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DocumentSnapshot {
    pub lamport: u64,
    pub blocks: Vec<Lww<Block>>,
    pub layout: Layout,
    pub dataframes: DataframeRegistry,
    pub run_all: Lww<RunAll>,
    pub queue: ExecutionQueueState,
    pub ai_tasks: AiTaskQueueState,
}

#[derive(Debug)]
pub struct NotebookDocument {
    replica: ReplicaId,
    lamport: u64,
    blocks: BTreeMap<BlockId, Lww<Block>>,
    layout: Layout,
    dataframes: DataframeRegistry,
    run_all: Lww<RunAll>,
    queue: ExecutionQueueState,
    ai_tasks: AiTaskQueueState,
    dirty: bool,
    changes: Vec<Change>,
}

impl Default for NotebookDocument {
    fn default() -> Self {
        Self::new(ReplicaId::new())
    }
}

impl NotebookDocument {
    pub fn new(replica: ReplicaId) -> Self {
        Self {
            replica,
            lamport: 0,
            blocks: BTreeMap::new(),
            layout: Layout::new(),
            dataframes: DataframeRegistry::default(),
            run_all: Lww::new(RunAll::default(), Stamp::new(0, replica)),
            queue: ExecutionQueueState::default(),
            ai_tasks: AiTaskQueueState::default(),
            dirty: false,
            changes: Vec::new(),
        }
    }

    pub fn replica(&self) -> ReplicaId {
        self.replica
    }

    pub fn lamport(&self) -> u64 {
        self.lamport
    }

    // =========================================================================
    // Lamport clock
    // =========================================================================

    fn tick(&mut self) -> Stamp {
        self.lamport += 1;
        Stamp::new(self.lamport, self.replica)
    }

    fn merge_clock(&mut self, remote_ts: u64) {
        self.lamport = self.lamport.max(remote_ts) + 1;
    }

    fn record(&mut self, change: Change) {
        self.dirty = true;
        self.changes.push(change);
    }

    /// Drain the changes recorded since the last call.
    pub fn take_changes(&mut self) -> Vec<Change> {
        std::mem::take(&mut self.changes)
    }

    /// Unsaved changes since the last [`mark_pristine`](Self::mark_pristine).
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_pristine(&mut self) {
        self.dirty = false;
    }

    // =========================================================================
    // Blocks and layout
    // =========================================================================

    pub fn block(&self, id: &BlockId) -> Option<&Block> {
        self.blocks.get(id).map(|b| &b.value)
    }

    pub fn contains_block(&self, id: &BlockId) -> bool {
        self.blocks.contains_key(id)
    }

    /// All blocks, in id order.
    pub fn blocks(&self) -> impl Iterator<Item = &Block> {
        self.blocks.values().map(|b| &b.value)
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Add a block without placing it in the layout.
    pub fn insert_block(&mut self, block: Block) -> Result<()> {
        if self.blocks.contains_key(&block.id) {
            return Err(DocError::DuplicateBlock(block.id));
        }
        let stamp = self.tick();
        let block_id = block.id.clone();
        self.blocks.insert(block_id.clone(), Lww::new(block, stamp));
        self.record(Change::BlockInserted { block_id });
        Ok(())
    }

    /// Add a block in a new group at the end of the layout.
    pub fn append_block(&mut self, block: Block) -> Result<GroupId> {
        let position = self.layout.groups().len();
        self.insert_block_at(position, block)
    }

    /// Add a block in a new group at `position` in the layout.
    pub fn insert_block_at(&mut self, position: usize, block: Block) -> Result<GroupId> {
        if self.layout.contains(&block.id) {
            return Err(DocError::AlreadyPlaced(block.id));
        }
        let block_id = block.id.clone();
        self.insert_block(block)?;
        let group = self.layout.insert_group(position, block_id)?;
        self.record(Change::LayoutChanged);
        Ok(group)
    }

    /// Place an existing block as a new tab of `group_id`.
    pub fn add_tab(&mut self, group_id: GroupId, block_id: &BlockId) -> Result<()> {
        if !self.blocks.contains_key(block_id) {
            return Err(DocError::BlockNotFound(block_id.clone()));
        }
        self.layout.add_tab(group_id, block_id.clone())?;
        self.tick();
        self.record(Change::LayoutChanged);
        Ok(())
    }

    /// Remove a block and its tab.
    pub fn remove_block(&mut self, id: &BlockId) -> Result<Block> {
        let removed = self
            .blocks
            .remove(id)
            .ok_or_else(|| DocError::BlockNotFound(id.clone()))?;
        self.tick();
        if self.layout.remove_block(id) {
            self.record(Change::LayoutChanged);
        }
        self.record(Change::BlockRemoved {
            block_id: id.clone(),
        });
        Ok(removed.value)
    }

    /// Mutate one block's fields. The block id cannot be changed.
    pub fn update_block<R>(&mut self, id: &BlockId, f: impl FnOnce(&mut Block) -> R) -> Result<R> {
        if !self.blocks.contains_key(id) {
            return Err(DocError::BlockNotFound(id.clone()));
        }
        let stamp = self.tick();
        let entry = self
            .blocks
            .get_mut(id)
            .ok_or_else(|| DocError::BlockNotFound(id.clone()))?;
        let out = f(&mut entry.value);
        entry.value.id = id.clone();
        entry.stamp = stamp;
        self.record(Change::BlockUpdated {
            block_id: id.clone(),
        });
        Ok(out)
    }

    /// Executable blocks in document order.
    pub fn executable_blocks(&self) -> Vec<&Block> {
        self.layout
            .block_ids()
            .filter_map(|id| self.block(id))
            .filter(|b| b.is_executable())
            .collect()
    }

    /// Upstream blocks that must run before `target`, in document order.
    pub fn dependency_queue(
        &self,
        target: &BlockId,
        force_all: bool,
        environment_started_at: Option<u64>,
    ) -> Vec<BlockId> {
        compute_dependency_queue(
            target,
            &self.layout,
            |id| self.block(id),
            force_all,
            environment_started_at,
        )
        .into_iter()
        .map(|b| b.id.clone())
        .collect()
    }

    // =========================================================================
    // Execution queue
    // =========================================================================

    pub fn queue(&self) -> &ExecutionQueueState {
        &self.queue
    }

    pub fn current_batch(&self) -> Option<&Batch> {
        self.queue.current_batch()
    }

    pub fn queue_item(&self, id: ItemId) -> Option<&QueueItem> {
        self.queue.item(id)
    }

    pub fn block_executions(&self, block_id: &BlockId, tag: Option<&str>) -> Vec<&QueueItem> {
        self.queue.block_executions(block_id, tag)
    }

    fn executable(&self, block_id: &BlockId) -> Result<&Block> {
        let block = self
            .block(block_id)
            .ok_or_else(|| DocError::BlockNotFound(block_id.clone()))?;
        if !block.is_executable() {
            return Err(DocError::NotExecutable(block_id.clone()));
        }
        Ok(block)
    }

    /// Enqueue one block as its own single-item batch.
    pub fn enqueue_block(
        &mut self,
        block_id: &BlockId,
        user_id: Option<UserId>,
        metadata: ExecutionMetadata,
    ) -> Result<BatchId> {
        self.executable(block_id)?;
        let stamp = self.tick();
        let item = QueueItem::new(block_id.clone(), user_id, metadata, stamp);
        Ok(self.push_batch(Batch::new(vec![item], false, false)))
    }

    /// Enqueue an already-ordered chain of blocks as one batch, each with its
    /// kind's default metadata. Returns `None` for an empty chain.
    pub fn enqueue_dependency_run(
        &mut self,
        blocks: &[BlockId],
        user_id: Option<UserId>,
        is_run_all: bool,
    ) -> Result<Option<BatchId>> {
        let items = self.default_items(blocks.iter())?;
        self.enqueue_items(items, user_id, is_run_all, false)
    }

    /// Enqueue `(block, metadata)` pairs as one batch.
    pub fn enqueue_items(
        &mut self,
        items: Vec<(BlockId, ExecutionMetadata)>,
        user_id: Option<UserId>,
        is_run_all: bool,
        is_schedule: bool,
    ) -> Result<Option<BatchId>> {
        if items.is_empty() {
            return Ok(None);
        }
        for (block_id, _) in &items {
            self.executable(block_id)?;
        }
        let stamp = self.tick();
        let items = items
            .into_iter()
            .map(|(block_id, metadata)| QueueItem::new(block_id, user_id, metadata, stamp))
            .collect();
        Ok(Some(self.push_batch(Batch::new(
            items,
            is_run_all,
            is_schedule,
        ))))
    }

    /// Enqueue every executable tab of a block group, in tab order.
    pub fn enqueue_block_group(
        &mut self,
        group_id: GroupId,
        user_id: Option<UserId>,
    ) -> Result<Option<BatchId>> {
        let group = self
            .layout
            .group(group_id)
            .ok_or(DocError::GroupNotFound(group_id))?;
        let ids: Vec<BlockId> = group
            .tabs
            .iter()
            .filter(|id| self.block(id).is_some_and(|b| b.is_executable()))
            .cloned()
            .collect();
        let items = self.default_items(ids.iter())?;
        self.enqueue_items(items, user_id, false, false)
    }

    /// Enqueue every executable block in document order as one run-all batch.
    pub fn enqueue_run_all(
        &mut self,
        user_id: Option<UserId>,
        is_schedule: bool,
    ) -> Result<Option<BatchId>> {
        let ids: Vec<BlockId> = self
            .executable_blocks()
            .into_iter()
            .map(|b| b.id.clone())
            .collect();
        let items = self.default_items(ids.iter())?;
        self.enqueue_items(items, user_id, true, is_schedule)
    }

    fn default_items<'a>(
        &self,
        ids: impl Iterator<Item = &'a BlockId>,
    ) -> Result<Vec<(BlockId, ExecutionMetadata)>> {
        ids.map(|id| {
            let block = self.executable(id)?;
            let metadata = ExecutionMetadata::for_kind(block.kind())
                .ok_or_else(|| DocError::NotExecutable(id.clone()))?;
            Ok((id.clone(), metadata))
        })
        .collect()
    }

    fn push_batch(&mut self, batch: Batch) -> BatchId {
        let batch_id = batch.id;
        let is_run_all = batch.is_run_all;
        debug!(batch_id = %batch_id, items = batch.len(), is_run_all, "batch enqueued");
        self.queue.push(batch);
        self.record(Change::BatchEnqueued {
            batch_id,
            is_run_all,
        });
        batch_id
    }

    /// Drop the head batch once it has no unfinished items.
    pub fn advance(&mut self) -> Result<Option<BatchId>> {
        let Some(batch) = self.queue.advance()? else {
            return Ok(None);
        };
        self.tick();
        self.record(Change::BatchAdvanced { batch_id: batch.id });
        Ok(Some(batch.id))
    }

    /// Mark the head batch's current item as running.
    pub fn start_item(&mut self, id: ItemId) -> Result<()> {
        let stamp = self.tick();
        let item = self.queue.start_item(id, stamp)?;
        let change = Change::ItemStatus {
            item_id: id,
            block_id: item.block_id.clone(),
            status: item.status(),
        };
        self.record(change);
        Ok(())
    }

    pub fn complete_item(&mut self, id: ItemId, status: CompletionStatus) -> Result<()> {
        let stamp = self.tick();
        let item = self.queue.complete_item(id, status, stamp)?;
        let change = Change::ItemStatus {
            item_id: id,
            block_id: item.block_id.clone(),
            status: item.status(),
        };
        self.record(change);

        // Nothing after a failed item in the same batch runs on top of it.
        if status == CompletionStatus::Error {
            let stamp = self.tick();
            let changes: Vec<Change> = self
                .queue
                .abandon_rest(id, stamp)
                .into_iter()
                .map(|i| Change::ItemStatus {
                    item_id: i.id,
                    block_id: i.block_id.clone(),
                    status: i.status(),
                })
                .collect();
            for change in changes {
                self.record(change);
            }
        }
        Ok(())
    }

    /// Ask for an item to stop. The running executor makes the final call.
    pub fn request_abort(&mut self, id: ItemId) -> Result<bool> {
        let stamp = self.tick();
        if !self.queue.request_abort(id, stamp)? {
            return Ok(false);
        }
        let block_id = self
            .queue
            .item(id)
            .map(|i| i.block_id.clone())
            .ok_or(DocError::ItemNotFound(id))?;
        self.record(Change::ItemStatus {
            item_id: id,
            block_id,
            status: ExecutionStatus::Aborting,
        });
        Ok(true)
    }

    /// Mark every unfinished item of a batch as aborting.
    pub fn abort_batch(&mut self, id: BatchId) -> Result<usize> {
        let stamp = self.tick();
        let batch = self.queue.batch_mut(id)?;
        let changed = batch.abort(stamp);
        let changes: Vec<Change> = batch
            .items
            .iter()
            .filter(|i| i.status() == ExecutionStatus::Aborting)
            .map(|i| Change::ItemStatus {
                item_id: i.id,
                block_id: i.block_id.clone(),
                status: ExecutionStatus::Aborting,
            })
            .collect();
        if changed > 0 {
            for change in changes {
                self.record(change);
            }
        }
        Ok(changed)
    }

    /// Abort every run-all batch on the queue. Returns the items touched.
    pub fn abort_run_all(&mut self) -> usize {
        let ids: Vec<BatchId> = self
            .queue
            .run_all_batches()
            .into_iter()
            .map(|b| b.id)
            .collect();
        ids.into_iter()
            .filter_map(|id| self.abort_batch(id).ok())
            .sum()
    }

    /// Take a not-yet-started block out of a batch.
    pub fn remove_queued_block(&mut self, batch_id: BatchId, block_id: &BlockId) -> Result<usize> {
        let removed = self.queue.batch_mut(batch_id)?.remove_item(block_id);
        if removed > 0 {
            self.tick();
            self.record(Change::BatchUpdated { batch_id });
        }
        Ok(removed)
    }

    // =========================================================================
    // AI tasks
    // =========================================================================

    pub fn ai_tasks(&self) -> &AiTaskQueueState {
        &self.ai_tasks
    }

    pub fn enqueue_ai_task(
        &mut self,
        block_id: &BlockId,
        user_id: Option<UserId>,
        metadata: AiTaskMetadata,
    ) -> Result<TaskId> {
        if !self.blocks.contains_key(block_id) {
            return Err(DocError::BlockNotFound(block_id.clone()));
        }
        let stamp = self.tick();
        let task = AiTask::new(block_id.clone(), user_id, metadata, stamp);
        let task_id = task.id;
        self.ai_tasks.push(task);
        self.record(Change::AiTaskEnqueued {
            task_id,
            block_id: block_id.clone(),
        });
        Ok(task_id)
    }

    /// Claim the next AI task (see [`AiTaskQueueState`] for the scan rules).
    pub fn next_ai_task(&mut self, now: u64, ping_timeout: u64) -> Option<AiTask> {
        let stamp = self.tick();
        let next = self.ai_tasks.next(now, ping_timeout, stamp);
        if !next.evicted.is_empty() {
            self.record(Change::AiTasksEvicted {
                task_ids: next.evicted.iter().map(|t| t.id).collect(),
            });
        }
        if let Some(task) = &next.task {
            if next.resumed {
                debug!(task_id = %task.id, block_id = %task.block_id, "resuming stale AI task");
            }
            self.record(Change::AiTaskStatus {
                task_id: task.id,
                block_id: task.block_id.clone(),
                status: task.status(),
            });
        }
        next.task
    }

    /// Prove liveness for a running task. Returns `false` once the task is
    /// no longer running here.
    pub fn ping_ai_task(&mut self, id: TaskId, now: u64) -> bool {
        let stamp = self.tick();
        self.ai_tasks.ping(id, now, stamp)
    }

    pub fn complete_ai_task(&mut self, id: TaskId, result: CompletionStatus) -> Result<()> {
        let stamp = self.tick();
        let task = self.ai_tasks.complete(id, result, stamp)?;
        let change = Change::AiTaskStatus {
            task_id: id,
            block_id: task.block_id.clone(),
            status: task.status(),
        };
        self.record(change);
        Ok(())
    }

    pub fn request_ai_abort(&mut self, id: TaskId) -> Result<bool> {
        let stamp = self.tick();
        if !self.ai_tasks.request_abort(id, stamp)? {
            return Ok(false);
        }
        let block_id = self
            .ai_tasks
            .task(id)
            .map(|t| t.block_id.clone())
            .ok_or(DocError::TaskNotFound(id))?;
        self.record(Change::AiTaskStatus {
            task_id: id,
            block_id,
            status: AiTaskStatus::Aborting,
        });
        Ok(true)
    }

    // =========================================================================
    // Dataframes
    // =========================================================================

    pub fn dataframes(&self) -> &DataframeRegistry {
        &self.dataframes
    }

    /// Fold a Python run's reported dataframes into the registry.
    pub fn reconcile_dataframes(
        &mut self,
        block_id: &BlockId,
        produced: Vec<DataFrameInfo>,
        now: u64,
    ) -> bool {
        let blocks = &self.blocks;
        let changed =
            self.dataframes
                .reconcile(block_id, produced, |id| blocks.contains_key(id), now);
        if changed {
            self.tick();
            self.record(Change::DataframesChanged);
        }
        changed
    }

    pub fn put_dataframe(&mut self, df: DataFrame) {
        self.dataframes.insert(df);
        self.tick();
        self.record(Change::DataframesChanged);
    }

    pub fn remove_dataframe(&mut self, name: &str) -> Option<DataFrame> {
        let removed = self.dataframes.remove(name)?;
        self.tick();
        self.record(Change::DataframesChanged);
        Some(removed)
    }

    // =========================================================================
    // Run-all
    // =========================================================================

    pub fn run_all(&self) -> RunAll {
        self.run_all.value
    }

    pub fn set_run_all(&mut self, run_all: RunAll) {
        if self.run_all.value == run_all {
            return;
        }
        let stamp = self.tick();
        self.run_all.set(run_all, stamp);
        self.record(Change::RunAllChanged { run_all });
    }

    pub fn set_run_all_status(&mut self, status: RunAllStatus) {
        let run_all = RunAll {
            status,
            ..self.run_all.value
        };
        self.set_run_all(run_all);
    }

    // =========================================================================
    // Replication
    // =========================================================================

    /// Apply a write from another replica. Returns whether it won.
    pub fn apply_remote(&mut self, update: RemoteUpdate) -> Result<bool> {
        match update {
            RemoteUpdate::Block { block, stamp } => {
                self.merge_clock(stamp.lamport);
                let block_id = block.id.clone();
                match self.blocks.get_mut(&block_id) {
                    Some(entry) => {
                        if !entry.merge(block, stamp) {
                            return Ok(false);
                        }
                        self.record(Change::BlockUpdated { block_id });
                    }
                    None => {
                        self.blocks.insert(block_id.clone(), Lww::new(block, stamp));
                        self.record(Change::BlockInserted { block_id });
                    }
                }
                Ok(true)
            }
            RemoteUpdate::ItemStatus {
                item_id,
                status,
                stamp,
            } => {
                self.merge_clock(stamp.lamport);
                let item = self.queue.item_mut(item_id)?;
                if !item.merge_status(status, stamp) {
                    return Ok(false);
                }
                let block_id = item.block_id.clone();
                self.record(Change::ItemStatus {
                    item_id,
                    block_id,
                    status,
                });
                Ok(true)
            }
            RemoteUpdate::AiTaskStatus {
                task_id,
                status,
                stamp,
            } => {
                self.merge_clock(stamp.lamport);
                let task = self.ai_tasks.task_mut(task_id)?;
                if !task.merge_status(status, stamp) {
                    return Ok(false);
                }
                let block_id = task.block_id.clone();
                self.record(Change::AiTaskStatus {
                    task_id,
                    block_id,
                    status,
                });
                Ok(true)
            }
            RemoteUpdate::RunAll { run_all, stamp } => {
                self.merge_clock(stamp.lamport);
                if !self.run_all.merge(run_all, stamp) {
                    return Ok(false);
                }
                self.record(Change::RunAllChanged { run_all });
                Ok(true)
            }
        }
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    pub fn snapshot(&self) -> DocumentSnapshot {
        DocumentSnapshot {
            lamport: self.lamport,
            blocks: self.blocks.values().cloned().collect(),
            layout: self.layout.clone(),
            dataframes: self.dataframes.clone(),
            run_all: self.run_all.clone(),
            queue: self.queue.clone(),
            ai_tasks: self.ai_tasks.clone(),
        }
    }

    /// Rebuild a document from a snapshot. The result is pristine and writes
    /// as `replica`.
    pub fn from_snapshot(snapshot: DocumentSnapshot, replica: ReplicaId) -> Self {
        let blocks = snapshot
            .blocks
            .into_iter()
            .map(|b| (b.value.id.clone(), b))
            .collect();
        Self {
            replica,
            lamport: snapshot.lamport,
            blocks,
            layout: snapshot.layout,
            dataframes: snapshot.dataframes,
            run_all: snapshot.run_all,
            queue: snapshot.queue,
            ai_tasks: snapshot.ai_tasks,
            dirty: false,
            changes: Vec::new(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(&self.snapshot()).map_err(|e| DocError::Serialization(e.to_string()))
    }

    pub fn from_json(json: &str, replica: ReplicaId) -> Result<Self> {
        let snapshot: DocumentSnapshot =
            serde_json::from_str(json).map_err(|e| DocError::Serialization(e.to_string()))?;
        Ok(Self::from_snapshot(snapshot, replica))
    }
}
