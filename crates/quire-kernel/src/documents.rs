//! Per-process registry of open documents.
//!
//! Opening a document starts its three background loops (execution
//! dispatcher, AI dispatcher, run-all orchestrator). Documents are fully
//! independent: each has its own lock, flow bus, loops and cancellation.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use quire_crdt::NotebookDocument;
use quire_types::{DocumentId, WorkspaceId};

use crate::ai_dispatch::AiDispatcher;
use crate::ai_tasks::AiTasks;
use crate::backend::Backends;
use crate::config::SchedulerConfig;
use crate::dispatch::Dispatcher;
use crate::error::{KernelError, KernelResult};
use crate::executors::{ExecutorContext, ExecutorRegistry};
use crate::notebook::{Notebook, SharedNotebook};
use crate::queue::ExecutionQueue;
use crate::run_all::RunAllOrchestrator;

/// An open document and the loops serving it.
pub struct DocumentRuntime {
    pub notebook: SharedNotebook,
    pub queue: ExecutionQueue,
    pub ai_tasks: AiTasks,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DocumentRuntime {
    pub fn document_id(&self) -> DocumentId {
        self.notebook.document_id()
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Stop the loops and wait for them. In-flight work is cancelled.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result
                && e.is_panic()
            {
                tracing::error!(document_id = %self.document_id(), error = %e, "document loop panicked");
            }
        }
    }
}

impl std::fmt::Debug for DocumentRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentRuntime")
            .field("document_id", &self.document_id())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

pub struct Documents {
    config: SchedulerConfig,
    backends: Backends,
    executors: Arc<ExecutorRegistry>,
    open: DashMap<DocumentId, Arc<DocumentRuntime>>,
}

impl Documents {
    pub fn new(config: SchedulerConfig, backends: Backends) -> Self {
        Self::with_executors(config, backends, ExecutorRegistry::standard())
    }

    pub fn with_executors(
        config: SchedulerConfig,
        backends: Backends,
        executors: ExecutorRegistry,
    ) -> Self {
        Self {
            config,
            backends,
            executors: Arc::new(executors),
            open: DashMap::new(),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Open `doc` and start serving it. Opening an already-open document
    /// returns the existing runtime and ignores `doc`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(
        &self,
        workspace_id: WorkspaceId,
        document_id: DocumentId,
        doc: NotebookDocument,
    ) -> Arc<DocumentRuntime> {
        self.open
            .entry(document_id)
            .or_insert_with(|| Arc::new(self.start(workspace_id, document_id, doc)))
            .clone()
    }

    fn start(
        &self,
        workspace_id: WorkspaceId,
        document_id: DocumentId,
        doc: NotebookDocument,
    ) -> DocumentRuntime {
        let config = self.config.clone();
        let notebook = Notebook::new(workspace_id, document_id, doc, config.flow_capacity);
        let queue = ExecutionQueue::new(notebook.clone(), config.idle_poll());
        let ai_tasks = AiTasks::new(notebook.clone(), config.ai_ping_timeout_ms, config.idle_poll());
        let cancel = CancellationToken::new();

        let dispatcher = Dispatcher::new(
            ExecutorContext {
                notebook: notebook.clone(),
                backends: self.backends.clone(),
                config: config.clone(),
                shutdown: cancel.clone(),
            },
            self.executors.clone(),
        );
        let ai = AiDispatcher::new(ai_tasks.clone(), self.backends.clone(), config.clone());
        let run_all = RunAllOrchestrator::new(notebook.clone(), config.idle_poll());

        let tasks = vec![
            tokio::spawn(dispatcher.run(cancel.clone())),
            tokio::spawn(ai.run(cancel.clone())),
            tokio::spawn(run_all.run(cancel.clone())),
        ];
        info!(workspace_id = %workspace_id, document_id = %document_id, "document opened");

        DocumentRuntime {
            notebook,
            queue,
            ai_tasks,
            cancel,
            tasks: Mutex::new(tasks),
        }
    }

    pub fn get(&self, document_id: DocumentId) -> KernelResult<Arc<DocumentRuntime>> {
        self.open
            .get(&document_id)
            .map(|r| r.clone())
            .ok_or(KernelError::DocumentNotOpen(document_id))
    }

    /// Stop serving a document. Returns its runtime so the caller can take
    /// a final snapshot.
    pub async fn close(&self, document_id: DocumentId) -> KernelResult<Arc<DocumentRuntime>> {
        let (_, runtime) = self
            .open
            .remove(&document_id)
            .ok_or(KernelError::DocumentNotOpen(document_id))?;
        runtime.shutdown().await;
        info!(document_id = %document_id, "document closed");
        Ok(runtime)
    }

    pub async fn shutdown(&self) {
        let ids: Vec<DocumentId> = self.open.iter().map(|e| *e.key()).collect();
        let closing = ids.into_iter().map(|id| self.close(id));
        futures::future::join_all(closing).await;
    }

    pub fn len(&self) -> usize {
        self.open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }
}

impl std::fmt::Debug for Documents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Documents")
            .field("open", &self.open.len())
            .field("executors", &self.executors)
            .finish_non_exhaustive()
    }
}
