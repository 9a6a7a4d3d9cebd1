//! AI task dispatch.
//!
//! Claims tasks from the document's AI queue and runs up to
//! `ai_concurrency` of them at once. While a task runs, its owner pings it
//! every `ai_ping_timeout / 5` so other workers leave it alone; a task
//! whose owner stops pinging is picked up again by the next claim.

use std::sync::Arc;

use dashmap::DashSet;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use quire_crdt::AiTask;
use quire_types::{
    AiTaskMetadata, Block, CompletionStatus, DataFrameInfo, Output, SqlResult, TaskId,
};

use crate::ai_tasks::{AI_SUBJECTS, AiTasks};
use crate::backend::{AiRequest, Backends, SuggestionSink};
use crate::config::SchedulerConfig;
use crate::error::BackendError;
use crate::executors::{Settled, settle};

struct Inner {
    tasks: AiTasks,
    backends: Backends,
    config: SchedulerConfig,
    in_flight: DashSet<TaskId>,
}

#[derive(Clone)]
pub struct AiDispatcher {
    inner: Arc<Inner>,
}

impl AiDispatcher {
    pub fn new(tasks: AiTasks, backends: Backends, config: SchedulerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                tasks,
                backends,
                config,
                in_flight: DashSet::new(),
            }),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.len()
    }

    /// Claim and run tasks until `cancel` fires, then cancel whatever is
    /// still running and wait for it to wind down.
    pub async fn run(self, cancel: CancellationToken) {
        let document_id = self.inner.tasks.notebook().document_id();
        info!(document_id = %document_id, concurrency = self.inner.config.ai_concurrency, "AI dispatcher started");
        let permits = Arc::new(Semaphore::new(self.inner.config.ai_concurrency));
        let mut running = JoinSet::new();
        let mut changes = self.inner.tasks.notebook().subscribe(AI_SUBJECTS);

        loop {
            while changes.try_recv().is_some() {}
            while running.try_join_next().is_some() {}

            let claimed = match permits.clone().try_acquire_owned() {
                Ok(permit) => match self.claim() {
                    Some(task) => {
                        let this = self.clone();
                        let cancel = cancel.child_token();
                        running.spawn(async move {
                            let _permit = permit;
                            this.run_task(task, cancel).await;
                        });
                        true
                    }
                    None => false,
                },
                Err(_) => false,
            };
            if claimed {
                continue;
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = changes.recv() => {}
                Some(_) = running.join_next(), if !running.is_empty() => {}
                _ = tokio::time::sleep(self.inner.config.idle_poll()) => {}
            }
        }

        while running.join_next().await.is_some() {}
        info!(document_id = %document_id, "AI dispatcher stopped");
    }

    /// Next task not already being worked on by this dispatcher.
    fn claim(&self) -> Option<AiTask> {
        let task = self.inner.tasks.next()?;
        if !self.inner.in_flight.insert(task.id) {
            // Our own task went stale between pings; the claim refreshed it.
            debug!(task_id = %task.id, "task already in flight here");
            return None;
        }
        Some(task)
    }

    async fn run_task(&self, task: AiTask, shutdown: CancellationToken) {
        let tasks = &self.inner.tasks;
        debug!(task_id = %task.id, block_id = %task.block_id, kind = task.metadata.as_str(), queued = tasks.size(), "executing AI task");
        let watch = tasks.watch_abort_under(&shutdown, task.id);

        let mut ping = tokio::time::interval(self.inner.config.ai_ping_interval());
        ping.tick().await;
        let mut work = std::pin::pin!(self.work(&task, watch.token()));
        let status = loop {
            tokio::select! {
                status = &mut work => break status,
                _ = ping.tick() => {
                    if !tasks.ping(task.id) {
                        debug!(task_id = %task.id, "task no longer running, stopped pinging");
                    }
                }
            }
        };

        if let Err(e) = tasks.complete(task.id, status) {
            debug!(task_id = %task.id, error = %e, "AI task gone before completion");
        }
        self.inner.in_flight.remove(&task.id);
    }

    async fn work(&self, task: &AiTask, cancel: &CancellationToken) -> CompletionStatus {
        let notebook = self.inner.tasks.notebook();
        let (block, dataframes) = notebook.read(|doc| {
            let dataframes: Vec<DataFrameInfo> = doc
                .dataframes()
                .iter()
                .map(|df| DataFrameInfo {
                    name: df.name.clone(),
                    columns: df.columns.clone(),
                })
                .collect();
            (doc.block(&task.block_id).cloned(), dataframes)
        });
        let Some(block) = block else {
            error!(task_id = %task.id, block_id = %task.block_id, "AI task block not found");
            return CompletionStatus::Error;
        };
        if block.kind() != task.metadata.block_kind() {
            error!(
                task_id = %task.id,
                expected = task.metadata.block_kind().as_str(),
                actual = block.kind().as_str(),
                "AI task block has unexpected type"
            );
            return CompletionStatus::Error;
        }
        let Some(prompt) = prompt_for(task.metadata, &block) else {
            debug!(task_id = %task.id, kind = task.metadata.as_str(), "nothing to ask the assistant");
            return CompletionStatus::Error;
        };

        let sink = {
            let notebook = notebook.clone();
            let block_id = task.block_id.clone();
            SuggestionSink::new(move |partial| {
                let written = notebook.update(|doc| {
                    doc.update_block(&block_id, |b| set_suggestion(b, partial, false))
                });
                if let Err(e) = written {
                    debug!(block_id = %block_id, error = %e, "dropping partial AI suggestion");
                }
            })
        };
        let request = AiRequest {
            workspace_id: notebook.workspace_id(),
            document_id: notebook.document_id(),
            kind: task.metadata,
            source: block.source().unwrap_or_default().to_string(),
            instructions: prompt.instructions,
            error: prompt.error,
            dataframes,
        };
        let call = self
            .inner
            .backends
            .assistant
            .suggest(request, sink, cancel.clone());
        match settle(call, cancel, self.inner.config.abort_grace()).await {
            Settled::Aborted { .. } | Settled::Done(Err(BackendError::Cancelled)) => {
                CompletionStatus::Aborted
            }
            Settled::Done(Err(e)) => {
                error!(task_id = %task.id, block_id = %task.block_id, error = %e, "AI assistant failed");
                CompletionStatus::Error
            }
            Settled::Done(Ok(suggestion)) => {
                let is_edit = matches!(
                    task.metadata,
                    AiTaskMetadata::EditPython | AiTaskMetadata::EditSql
                );
                let written = notebook.update(|doc| {
                    doc.update_block(&task.block_id, |b| set_suggestion(b, &suggestion, is_edit))
                });
                if let Err(e) = written {
                    warn!(task_id = %task.id, error = %e, "dropping AI suggestion");
                }
                CompletionStatus::Success
            }
        }
    }
}

struct Prompt {
    instructions: Option<String>,
    error: Option<String>,
}

/// What to send the assistant, or `None` if the block gives it nothing to
/// work with (no edit prompt, or no error to fix).
fn prompt_for(kind: AiTaskMetadata, block: &Block) -> Option<Prompt> {
    match kind {
        AiTaskMetadata::EditPython => {
            let prompt = block.python()?.edit_with_ai_prompt.clone()?;
            edit(prompt)
        }
        AiTaskMetadata::EditSql => {
            let prompt = block.sql()?.edit_with_ai_prompt.clone()?;
            edit(prompt)
        }
        AiTaskMetadata::FixPython => match block.python()?.error_output()? {
            Output::Error {
                ename,
                evalue,
                traceback,
            } => {
                let error = serde_json::json!({
                    "ename": ename,
                    "evalue": evalue,
                    "traceback": traceback.iter().take(2).collect::<Vec<_>>(),
                })
                .to_string();
                Some(Prompt {
                    instructions: Some(format!("Fix the Python code, this is the error: {error}")),
                    error: Some(error),
                })
            }
            _ => None,
        },
        AiTaskMetadata::FixSql => {
            let error = match block.sql()?.result.as_ref()? {
                SqlResult::SyntaxError { message } => message.clone(),
                SqlResult::PythonError { ename, evalue } => format!("{ename}: {evalue}"),
                _ => return None,
            };
            Some(Prompt {
                instructions: Some(format!("Fix the SQL query, this is the error: {error}")),
                error: Some(error),
            })
        }
    }
}

fn edit(prompt: String) -> Option<Prompt> {
    if prompt.trim().is_empty() {
        return None;
    }
    Some(Prompt {
        instructions: Some(prompt),
        error: None,
    })
}

fn set_suggestion(block: &mut Block, suggestion: &str, close_prompt: bool) {
    if let Some(p) = block.python_mut() {
        p.ai_suggestions = Some(suggestion.to_string());
        if close_prompt {
            p.edit_with_ai_prompt = None;
        }
    } else if let Some(s) = block.sql_mut() {
        s.ai_suggestions = Some(suggestion.to_string());
        if close_prompt {
            s.edit_with_ai_prompt = None;
        }
    }
}

impl std::fmt::Debug for AiDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AiDispatcher")
            .field("tasks", &self.inner.tasks)
            .field("in_flight", &self.inner.in_flight.len())
            .finish()
    }
}
