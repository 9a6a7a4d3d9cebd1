use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use quire_types::{Block, BlockKind, CompletionStatus, ExecutionMetadata, Output, now_millis};

use super::{BlockExecutor, ExecutionJob, ExecutorContext, Settled, settle};
use crate::backend::{ExecutionRequest, OutputSink};
use crate::error::BackendError;

/// Runs Python blocks on the execution backend.
///
/// Outputs are appended to the block's `result` as they arrive. An abort
/// keeps whatever was appended and leaves `last_query` untouched.
#[derive(Debug, Default)]
pub struct PythonExecutor;

#[derive(Default)]
struct Progress {
    outputs: AtomicUsize,
    errored: AtomicBool,
}

#[async_trait]
impl BlockExecutor for PythonExecutor {
    fn kind(&self) -> BlockKind {
        BlockKind::Python
    }

    async fn execute(&self, ctx: &ExecutorContext, job: &ExecutionJob, block: Block) -> CompletionStatus {
        let Some(python) = block.python() else {
            return CompletionStatus::Error;
        };
        let is_suggestion = matches!(
            job.metadata,
            ExecutionMetadata::Python {
                is_suggestion: true
            }
        );
        let source = if is_suggestion {
            python.ai_suggestions.clone().unwrap_or_default()
        } else {
            python.source.clone()
        };

        let watch = ctx.watch_abort(job);
        if watch.is_aborted() {
            debug!(block_id = %job.block_id, "python run aborted before dispatch");
            return CompletionStatus::Aborted;
        }

        let started = now_millis();
        ctx.update_block(&job.block_id, |b| {
            if let Some(p) = b.python_mut() {
                p.result.clear();
                p.start_query_time = Some(started);
            }
        });

        let progress = Arc::new(Progress::default());
        let sink = {
            let notebook = ctx.notebook.clone();
            let block_id = job.block_id.clone();
            let progress = progress.clone();
            OutputSink::new(move |outputs: Vec<Output>| {
                progress.outputs.fetch_add(outputs.len(), Ordering::Relaxed);
                if outputs.iter().any(Output::is_error) {
                    progress.errored.store(true, Ordering::Relaxed);
                }
                let appended = notebook.update(|doc| {
                    doc.update_block(&block_id, |b| {
                        if let Some(p) = b.python_mut() {
                            p.result.extend(outputs);
                        }
                    })
                });
                if let Err(e) = appended {
                    warn!(block_id = %block_id, error = %e, "dropping python output");
                }
            })
        };

        let request = ExecutionRequest {
            workspace_id: ctx.notebook.workspace_id(),
            document_id: ctx.notebook.document_id(),
            source: source.clone(),
            store_history: true,
        };
        let call = ctx
            .backends
            .execution
            .execute(request, sink, watch.token().clone());

        match settle(call, watch.token(), ctx.config.abort_grace()).await {
            Settled::Aborted { acknowledged } => {
                log_abort(job, &progress, acknowledged);
                return CompletionStatus::Aborted;
            }
            Settled::Done(Err(BackendError::Cancelled)) => {
                log_abort(job, &progress, true);
                return CompletionStatus::Aborted;
            }
            Settled::Done(Err(e)) => {
                error!(block_id = %job.block_id, error = %e, "python execution failed");
                ctx.update_block(&job.block_id, |b| {
                    if let Some(p) = b.python_mut() {
                        p.result.push(Output::error("ExecutionBackendError", e.to_string()));
                    }
                });
                return CompletionStatus::Error;
            }
            Settled::Done(Ok(())) => {}
        }

        match ctx
            .backends
            .dataframes
            .list_dataframes(ctx.notebook.workspace_id(), ctx.notebook.document_id())
            .await
        {
            Ok(produced) => {
                let block_id = job.block_id.clone();
                let now = now_millis();
                ctx.notebook
                    .update(|doc| doc.reconcile_dataframes(&block_id, produced, now));
            }
            Err(e) => warn!(block_id = %job.block_id, error = %e, "could not list dataframes"),
        }

        let finished = now_millis();
        ctx.update_block(&job.block_id, |b| {
            if let Some(p) = b.python_mut() {
                p.last_query = Some(source);
                p.last_query_time = Some(finished);
            }
        });

        if progress.errored.load(Ordering::Relaxed) {
            CompletionStatus::Error
        } else {
            debug!(block_id = %job.block_id, elapsed_ms = finished.saturating_sub(started), "python block executed");
            CompletionStatus::Success
        }
    }
}

fn log_abort(job: &ExecutionJob, progress: &Progress, acknowledged: bool) {
    let outputs = progress.outputs.load(Ordering::Relaxed);
    if outputs == 0 {
        info!(block_id = %job.block_id, acknowledged, "python run aborted before any output");
    } else {
        info!(block_id = %job.block_id, acknowledged, outputs, "python run aborted after partial output");
    }
}
