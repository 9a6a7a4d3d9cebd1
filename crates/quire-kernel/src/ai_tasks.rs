//! AI task queue handle.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use quire_crdt::AiTask;
use quire_types::{AiTaskMetadata, AiTaskStatus, BlockId, CompletionStatus, TaskId, UserId, now_millis};

use crate::error::KernelResult;
use crate::flows::NotebookFlow;
use crate::notebook::SharedNotebook;
use crate::observe::{AbortWatch, ObserverGuard, ObserverHub};

pub const AI_SUBJECTS: &str = "ai.>";

#[derive(Clone)]
pub struct AiTasks {
    notebook: SharedNotebook,
    observers: Arc<ObserverHub>,
    ping_timeout_ms: u64,
    idle_poll: Duration,
}

impl AiTasks {
    pub fn new(notebook: SharedNotebook, ping_timeout_ms: u64, idle_poll: Duration) -> Self {
        let observers = ObserverHub::new(notebook.clone(), AI_SUBJECTS);
        Self {
            notebook,
            observers,
            ping_timeout_ms,
            idle_poll,
        }
    }

    pub fn enqueue(
        &self,
        block_id: &BlockId,
        user_id: Option<UserId>,
        metadata: AiTaskMetadata,
    ) -> KernelResult<TaskId> {
        Ok(self
            .notebook
            .update(|doc| doc.enqueue_ai_task(block_id, user_id, metadata))?)
    }

    /// Claim the next task: a fresh one, or a running one whose worker has
    /// gone quiet for longer than the liveness window.
    pub fn next(&self) -> Option<AiTask> {
        self.next_at(now_millis())
    }

    pub fn next_at(&self, now: u64) -> Option<AiTask> {
        let timeout = self.ping_timeout_ms;
        self.notebook.update(|doc| doc.next_ai_task(now, timeout))
    }

    pub fn ping(&self, task_id: TaskId) -> bool {
        let now = now_millis();
        self.notebook.update(|doc| doc.ping_ai_task(task_id, now))
    }

    pub fn complete(&self, task_id: TaskId, result: CompletionStatus) -> KernelResult<()> {
        Ok(self
            .notebook
            .update(|doc| doc.complete_ai_task(task_id, result))?)
    }

    pub fn request_abort(&self, task_id: TaskId) -> KernelResult<bool> {
        Ok(self.notebook.update(|doc| doc.request_ai_abort(task_id))?)
    }

    pub fn block_tasks(&self, block_id: &BlockId, tag: Option<&str>) -> Vec<AiTask> {
        self.notebook.read(|doc| {
            doc.ai_tasks()
                .block_tasks(block_id, tag)
                .into_iter()
                .cloned()
                .collect()
        })
    }

    pub fn status(&self, task_id: TaskId) -> Option<AiTaskStatus> {
        self.notebook
            .read(|doc| doc.ai_tasks().task(task_id).map(|t| t.status()))
    }

    pub fn size(&self) -> usize {
        self.notebook.read(|doc| doc.ai_tasks().len())
    }

    /// Token cancelled once the task stops being running here.
    pub fn watch_abort(&self, task_id: TaskId) -> AbortWatch {
        self.watch_abort_under(&CancellationToken::new(), task_id)
    }

    pub fn watch_abort_under(&self, parent: &CancellationToken, task_id: TaskId) -> AbortWatch {
        AbortWatch::spawn_under(
            parent,
            self.notebook.clone(),
            AI_SUBJECTS,
            self.idle_poll,
            move |doc| {
                !matches!(
                    doc.ai_tasks().task(task_id).map(|t| t.status()),
                    Some(AiTaskStatus::Running { .. })
                )
            },
        )
    }

    pub fn notebook(&self) -> &SharedNotebook {
        &self.notebook
    }

    pub fn observe(&self, callback: impl Fn(&NotebookFlow) + Send + Sync + 'static) -> ObserverGuard {
        self.observers.observe(callback)
    }
}

impl std::fmt::Debug for AiTasks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AiTasks")
            .field("document_id", &self.notebook.document_id())
            .field("ping_timeout_ms", &self.ping_timeout_ms)
            .finish_non_exhaustive()
    }
}
