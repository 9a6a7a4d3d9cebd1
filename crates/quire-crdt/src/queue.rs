//! Execution queue state: an ordered list of batches of items.
//!
//! Batches run FIFO; within a batch items run in enqueue order. The head
//! batch's *current* item (first non-terminal one) is the only item allowed to
//! be `running`, which caps execution at one item per document.

use serde::{Deserialize, Serialize};

use quire_types::{
    BatchId, BatchStatus, BlockId, CompletionStatus, ExecutionMetadata, ExecutionStatus, ItemId,
    UserId,
};

use crate::clock::{Lww, Stamp};
use crate::error::{DocError, Result};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: ItemId,
    pub block_id: BlockId,
    pub user_id: Option<UserId>,
    pub metadata: ExecutionMetadata,
    status: Lww<ExecutionStatus>,
}

impl QueueItem {
    pub(crate) fn new(
        block_id: BlockId,
        user_id: Option<UserId>,
        metadata: ExecutionMetadata,
        stamp: Stamp,
    ) -> Self {
        Self {
            id: ItemId::new(),
            block_id,
            user_id,
            metadata,
            status: Lww::new(ExecutionStatus::Enqueued, stamp),
        }
    }

    pub fn status(&self) -> ExecutionStatus {
        self.status.value
    }

    pub fn status_stamp(&self) -> Stamp {
        self.status.stamp
    }

    pub(crate) fn set_status(&mut self, status: ExecutionStatus, stamp: Stamp) {
        self.status.set(status, stamp);
    }

    pub(crate) fn merge_status(&mut self, status: ExecutionStatus, stamp: Stamp) -> bool {
        self.status.merge(status, stamp)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub id: BatchId,
    pub version: u32,
    pub items: Vec<QueueItem>,
    pub is_run_all: bool,
    /// Run-all started by a schedule rather than a user.
    pub is_schedule: bool,
}

/// Current on-the-wire batch layout version.
pub const BATCH_VERSION: u32 = 1;

impl Batch {
    pub(crate) fn new(items: Vec<QueueItem>, is_run_all: bool, is_schedule: bool) -> Self {
        Self {
            id: BatchId::new(),
            version: BATCH_VERSION,
            items,
            is_run_all,
            is_schedule,
        }
    }

    /// First item that has not reached a terminal status.
    pub fn current(&self) -> Option<&QueueItem> {
        self.items.iter().find(|i| !i.status().is_terminal())
    }

    /// Number of items still to finish, including the current one.
    pub fn remaining(&self) -> usize {
        self.items
            .iter()
            .filter(|i| !i.status().is_terminal())
            .count()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_finished(&self) -> bool {
        self.current().is_none()
    }

    pub fn status(&self) -> BatchStatus {
        let statuses = self.items.iter().map(|i| i.status());
        let mut saw_aborting = false;
        let mut saw_open = false;
        for status in statuses {
            match status {
                ExecutionStatus::Running => return BatchStatus::Running,
                ExecutionStatus::Aborting => saw_aborting = true,
                s if !s.is_terminal() => saw_open = true,
                _ => {}
            }
        }
        if saw_aborting {
            BatchStatus::Aborting
        } else if saw_open {
            BatchStatus::Enqueued
        } else {
            BatchStatus::Completed
        }
    }

    pub fn item(&self, id: ItemId) -> Option<&QueueItem> {
        self.items.iter().find(|i| i.id == id)
    }

    /// Mark every unfinished item as aborting. Returns how many changed.
    pub(crate) fn abort(&mut self, stamp: Stamp) -> usize {
        let mut changed = 0;
        for item in &mut self.items {
            let status = item.status();
            if !status.is_terminal() && status != ExecutionStatus::Aborting {
                item.set_status(ExecutionStatus::Aborting, stamp);
                changed += 1;
            }
        }
        changed
    }

    /// Finish every unfinished item as aborted without running it.
    pub(crate) fn abandon(&mut self, stamp: Stamp) -> Vec<&QueueItem> {
        let mut abandoned = Vec::new();
        for item in &mut self.items {
            if !item.status().is_terminal() {
                item.set_status(ExecutionStatus::Aborted, stamp);
                abandoned.push(&*item);
            }
        }
        abandoned
    }

    /// Drop a block's items that have not started yet.
    pub(crate) fn remove_item(&mut self, block_id: &BlockId) -> usize {
        let before = self.items.len();
        self.items.retain(|i| {
            &i.block_id != block_id || !matches!(i.status(), ExecutionStatus::Enqueued)
        });
        before - self.items.len()
    }
}

/// The ordered list of batches.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionQueueState {
    batches: Vec<Batch>,
}

impl ExecutionQueueState {
    pub fn batches(&self) -> &[Batch] {
        &self.batches
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// Batch at the head of the queue.
    pub fn current_batch(&self) -> Option<&Batch> {
        self.batches.first()
    }

    pub fn batch(&self, id: BatchId) -> Option<&Batch> {
        self.batches.iter().find(|b| b.id == id)
    }

    pub fn item(&self, id: ItemId) -> Option<&QueueItem> {
        self.batches.iter().find_map(|b| b.item(id))
    }

    /// Items for a block, optionally filtered by metadata tag, across all
    /// batches in queue order.
    pub fn block_executions(&self, block_id: &BlockId, tag: Option<&str>) -> Vec<&QueueItem> {
        self.batches
            .iter()
            .flat_map(|b| b.items.iter())
            .filter(|i| &i.block_id == block_id)
            .filter(|i| tag.is_none_or(|t| i.metadata.tag() == t))
            .collect()
    }

    pub fn run_all_batches(&self) -> Vec<&Batch> {
        self.batches.iter().filter(|b| b.is_run_all).collect()
    }

    pub fn running_item(&self) -> Option<&QueueItem> {
        self.batches
            .iter()
            .flat_map(|b| b.items.iter())
            .find(|i| i.status().is_running())
    }

    pub(crate) fn push(&mut self, batch: Batch) {
        self.batches.push(batch);
    }

    /// Remove the head batch once it has no unfinished items.
    pub(crate) fn advance(&mut self) -> Result<Option<Batch>> {
        match self.batches.first() {
            None => Ok(None),
            Some(head) if !head.is_finished() => Err(DocError::BatchNotFinished(head.id)),
            Some(_) => Ok(Some(self.batches.remove(0))),
        }
    }

    pub(crate) fn start_item(&mut self, id: ItemId, stamp: Stamp) -> Result<&QueueItem> {
        if let Some(running) = self.running_item()
            && running.id != id
        {
            return Err(DocError::AlreadyRunning {
                running: running.id,
            });
        }
        let head = self.batches.first().ok_or(DocError::ItemNotFound(id))?;
        if !head.current().is_some_and(|i| i.id == id) {
            return if self.item(id).is_some() {
                Err(DocError::NotCurrent(id))
            } else {
                Err(DocError::ItemNotFound(id))
            };
        }
        let item = self.batches[0]
            .items
            .iter_mut()
            .find(|i| i.id == id)
            .ok_or(DocError::ItemNotFound(id))?;
        match item.status() {
            ExecutionStatus::Enqueued | ExecutionStatus::Running => {}
            status => return Err(DocError::NotStartable { item: id, status }),
        }
        item.set_status(ExecutionStatus::Running, stamp);
        Ok(item)
    }

    /// Finish every unfinished item in the batch holding `id` as aborted.
    pub(crate) fn abandon_rest(&mut self, id: ItemId, stamp: Stamp) -> Vec<&QueueItem> {
        match self.batches.iter_mut().find(|b| b.item(id).is_some()) {
            Some(batch) => batch.abandon(stamp),
            None => Vec::new(),
        }
    }

    pub(crate) fn complete_item(
        &mut self,
        id: ItemId,
        status: CompletionStatus,
        stamp: Stamp,
    ) -> Result<&QueueItem> {
        let item = self.item_mut(id)?;
        let current = item.status();
        if current.is_terminal() {
            return Err(DocError::AlreadyFinished {
                item: id,
                status: current,
            });
        }
        item.set_status(status.into(), stamp);
        Ok(item)
    }

    /// Requester-side abort. Returns `false` when the item already finished.
    pub(crate) fn request_abort(&mut self, id: ItemId, stamp: Stamp) -> Result<bool> {
        let item = self.item_mut(id)?;
        let status = item.status();
        if status.is_terminal() || status == ExecutionStatus::Aborting {
            return Ok(false);
        }
        item.set_status(ExecutionStatus::Aborting, stamp);
        Ok(true)
    }

    pub(crate) fn batch_mut(&mut self, id: BatchId) -> Result<&mut Batch> {
        self.batches
            .iter_mut()
            .find(|b| b.id == id)
            .ok_or(DocError::BatchNotFound(id))
    }

    pub(crate) fn batches_mut(&mut self) -> impl Iterator<Item = &mut Batch> {
        self.batches.iter_mut()
    }

    pub(crate) fn item_mut(&mut self, id: ItemId) -> Result<&mut QueueItem> {
        self.batches
            .iter_mut()
            .flat_map(|b| b.items.iter_mut())
            .find(|i| i.id == id)
            .ok_or(DocError::ItemNotFound(id))
    }
}
