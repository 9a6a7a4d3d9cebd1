//! AI-assist task queue.
//!
//! A FIFO of tasks with a liveness protocol: a worker that owns a running
//! task pings it periodically; a task whose ping is older than the timeout
//! is handed to whichever worker asks next. [`AiTaskQueueState::next`] is
//! the only dequeue path and also sweeps finished tasks out of the list.

use serde::{Deserialize, Serialize};

use quire_types::{AiTaskMetadata, AiTaskStatus, BlockId, CompletionStatus, TaskId, UserId};

use crate::clock::{Lww, Stamp};
use crate::error::{DocError, Result};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AiTask {
    pub id: TaskId,
    pub block_id: BlockId,
    pub user_id: Option<UserId>,
    pub metadata: AiTaskMetadata,
    status: Lww<AiTaskStatus>,
}

impl AiTask {
    pub(crate) fn new(
        block_id: BlockId,
        user_id: Option<UserId>,
        metadata: AiTaskMetadata,
        stamp: Stamp,
    ) -> Self {
        Self {
            id: TaskId::new(),
            block_id,
            user_id,
            metadata,
            status: Lww::new(AiTaskStatus::Enqueued, stamp),
        }
    }

    pub fn status(&self) -> AiTaskStatus {
        self.status.value
    }

    pub(crate) fn merge_status(&mut self, status: AiTaskStatus, stamp: Stamp) -> bool {
        self.status.merge(status, stamp)
    }
}

/// What one call to [`AiTaskQueueState::next`] did.
#[derive(Debug, Default)]
pub struct NextTask {
    /// The task the caller now owns, if any.
    pub task: Option<AiTask>,
    /// True when `task` was a stale running task taken over from a silent worker.
    pub resumed: bool,
    /// Finished or aborting tasks swept out on the way.
    pub evicted: Vec<AiTask>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AiTaskQueueState {
    tasks: Vec<AiTask>,
}

impl AiTaskQueueState {
    pub fn tasks(&self) -> &[AiTask] {
        &self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn task(&self, id: TaskId) -> Option<&AiTask> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// Tasks for a block, optionally filtered by metadata tag.
    pub fn block_tasks(&self, block_id: &BlockId, tag: Option<&str>) -> Vec<&AiTask> {
        self.tasks
            .iter()
            .filter(|t| &t.block_id == block_id)
            .filter(|t| tag.is_none_or(|tag| t.metadata.as_str() == tag))
            .collect()
    }

    pub(crate) fn push(&mut self, task: AiTask) {
        self.tasks.push(task);
    }

    /// Claim the next task to work on.
    ///
    /// Scans from the head: enqueued (or unrecognised) tasks are promoted to
    /// running and returned; running tasks with a ping older than
    /// `ping_timeout` are re-pinged and returned; running tasks with a fresh
    /// ping belong to a live worker and are skipped; aborting and completed
    /// tasks are evicted.
    pub(crate) fn next(&mut self, now: u64, ping_timeout: u64, stamp: Stamp) -> NextTask {
        let mut out = NextTask::default();
        let mut pos = 0;
        while pos < self.tasks.len() {
            match self.tasks[pos].status() {
                AiTaskStatus::Enqueued | AiTaskStatus::Unknown => {
                    let task = &mut self.tasks[pos];
                    task.status.set(AiTaskStatus::Running { ping: now }, stamp);
                    out.task = Some(task.clone());
                    return out;
                }
                AiTaskStatus::Running { ping } if now.saturating_sub(ping) > ping_timeout => {
                    let task = &mut self.tasks[pos];
                    task.status.set(AiTaskStatus::Running { ping: now }, stamp);
                    out.task = Some(task.clone());
                    out.resumed = true;
                    return out;
                }
                AiTaskStatus::Running { .. } => pos += 1,
                AiTaskStatus::Aborting | AiTaskStatus::Completed { .. } => {
                    out.evicted.push(self.tasks.remove(pos));
                }
            }
        }
        out
    }

    /// Refresh a running task's ping. Returns `false` if the task is no
    /// longer running (aborting, completed, or swept).
    pub(crate) fn ping(&mut self, id: TaskId, now: u64, stamp: Stamp) -> bool {
        match self.tasks.iter_mut().find(|t| t.id == id) {
            Some(task) if matches!(task.status(), AiTaskStatus::Running { .. }) => {
                task.status.set(AiTaskStatus::Running { ping: now }, stamp);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn complete(
        &mut self,
        id: TaskId,
        result: CompletionStatus,
        stamp: Stamp,
    ) -> Result<&AiTask> {
        let task = self.task_mut(id)?;
        task.status.set(AiTaskStatus::Completed { result }, stamp);
        Ok(task)
    }

    pub(crate) fn request_abort(&mut self, id: TaskId, stamp: Stamp) -> Result<bool> {
        let task = self.task_mut(id)?;
        if matches!(
            task.status(),
            AiTaskStatus::Completed { .. } | AiTaskStatus::Aborting
        ) {
            return Ok(false);
        }
        task.status.set(AiTaskStatus::Aborting, stamp);
        Ok(true)
    }

    pub(crate) fn task_mut(&mut self, id: TaskId) -> Result<&mut AiTask> {
        self.tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or(DocError::TaskNotFound(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quire_types::{AI_TASK_PING_TIMEOUT_MS, ReplicaId};

    fn stamp(n: u64) -> Stamp {
        Stamp::new(n, ReplicaId::nil())
    }

    fn queue_with(blocks: &[&str]) -> AiTaskQueueState {
        let mut queue = AiTaskQueueState::default();
        for block in blocks {
            queue.push(AiTask::new(
                (*block).into(),
                None,
                AiTaskMetadata::EditPython,
                stamp(1),
            ));
        }
        queue
    }

    #[test]
    fn next_on_empty_queue() {
        let mut queue = AiTaskQueueState::default();
        let next = queue.next(1_000, AI_TASK_PING_TIMEOUT_MS, stamp(2));
        assert!(next.task.is_none());
        assert!(next.evicted.is_empty());
    }

    #[test]
    fn next_promotes_in_fifo_order() {
        let mut queue = queue_with(&["a", "b"]);
        let first = queue.next(1_000, AI_TASK_PING_TIMEOUT_MS, stamp(2)).task.unwrap();
        assert_eq!(first.block_id.as_str(), "a");
        assert_eq!(first.status(), AiTaskStatus::Running { ping: 1_000 });

        let second = queue.next(1_001, AI_TASK_PING_TIMEOUT_MS, stamp(3)).task.unwrap();
        assert_eq!(second.block_id.as_str(), "b");

        // Both are owned by live workers now.
        assert!(queue.next(1_002, AI_TASK_PING_TIMEOUT_MS, stamp(4)).task.is_none());
        assert!(queue.next(1_003, AI_TASK_PING_TIMEOUT_MS, stamp(5)).task.is_none());
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn stale_running_task_is_resumed_not_duplicated() {
        let mut queue = queue_with(&["a"]);
        let claimed = queue.next(1_000, AI_TASK_PING_TIMEOUT_MS, stamp(2)).task.unwrap();

        // Within the window, nobody else gets it.
        let later = 1_000 + AI_TASK_PING_TIMEOUT_MS;
        assert!(queue.next(later, AI_TASK_PING_TIMEOUT_MS, stamp(3)).task.is_none());

        let stale = later + 1;
        let next = queue.next(stale, AI_TASK_PING_TIMEOUT_MS, stamp(4));
        let resumed = next.task.unwrap();
        assert!(next.resumed);
        assert_eq!(resumed.id, claimed.id);
        assert_eq!(resumed.status(), AiTaskStatus::Running { ping: stale });
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn pings_keep_a_task_owned() {
        let mut queue = queue_with(&["a"]);
        let task = queue.next(0, 100, stamp(2)).task.unwrap();
        assert!(queue.ping(task.id, 90, stamp(3)));
        assert!(queue.next(150, 100, stamp(4)).task.is_none());
        assert!(queue.next(191, 100, stamp(5)).task.is_some());
    }

    #[test]
    fn finished_and_aborting_tasks_are_swept() {
        let mut queue = queue_with(&["a", "b", "c"]);
        let a = queue.next(0, 100, stamp(2)).task.unwrap();
        let b = queue.next(0, 100, stamp(3)).task.unwrap();
        queue
            .complete(a.id, CompletionStatus::Success, stamp(4))
            .unwrap();
        assert!(queue.request_abort(b.id, stamp(5)).unwrap());
        assert!(!queue.ping(b.id, 10, stamp(6)));

        let next = queue.next(10, 100, stamp(7));
        assert_eq!(next.task.unwrap().block_id.as_str(), "c");
        assert_eq!(next.evicted.len(), 2);
        assert_eq!(queue.len(), 1);
        assert!(queue.task(a.id).is_none());
    }

    #[test]
    fn block_tasks_lookup() {
        let mut queue = queue_with(&["a", "b", "a"]);
        queue.push(AiTask::new(
            "a".into(),
            None,
            AiTaskMetadata::FixPython,
            stamp(1),
        ));
        assert_eq!(queue.block_tasks(&"a".into(), None).len(), 3);
        assert_eq!(queue.block_tasks(&"a".into(), Some("edit-python")).len(), 2);
        assert_eq!(queue.block_tasks(&"a".into(), Some("fix-python")).len(), 1);
        assert!(queue.block_tasks(&"b".into(), Some("fix-sql")).is_empty());
        assert!(queue.block_tasks(&"z".into(), None).is_empty());
    }
}
