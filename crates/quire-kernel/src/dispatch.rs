//! Execution dispatch loop.
//!
//! One [`Dispatcher`] per open document. It is the only consumer of the
//! execution queue: it takes the head batch's current item, marks it
//! running, awaits its executor and writes the terminal status, then moves
//! on. Items therefore run strictly one at a time per document.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use quire_types::{Block, CompletionStatus, ExecutionStatus, ItemId};

use crate::executors::{BlockExecutor, ExecutionJob, ExecutorContext, ExecutorRegistry};
use crate::queue::QUEUE_SUBJECTS;

enum Next {
    Idle,
    Advance,
    Run(ExecutionJob),
    /// Aborted (or unrecognised) before it ever started.
    Finish(ItemId),
}

pub struct Dispatcher {
    ctx: ExecutorContext,
    executors: Arc<ExecutorRegistry>,
}

impl Dispatcher {
    pub fn new(ctx: ExecutorContext, executors: Arc<ExecutorRegistry>) -> Self {
        Self { ctx, executors }
    }

    /// Drain the queue, then sleep until it changes. Returns once `cancel`
    /// fires; an item already executing is finished first.
    pub async fn run(self, cancel: CancellationToken) {
        let document_id = self.ctx.notebook.document_id();
        info!(document_id = %document_id, "execution dispatcher started");
        let mut changes = self.ctx.notebook.subscribe(QUEUE_SUBJECTS);
        loop {
            // Drained before stepping, so a change landing after the last
            // step still wakes the select below.
            while changes.try_recv().is_some() {}
            while !cancel.is_cancelled() && self.step().await {}
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = changes.recv() => {}
                _ = tokio::time::sleep(self.ctx.config.idle_poll()) => {}
            }
        }
        info!(document_id = %document_id, "execution dispatcher stopped");
    }

    /// Make one unit of progress. Returns `false` when the queue is idle.
    pub async fn step(&self) -> bool {
        let next = self.ctx.notebook.read(|doc| {
            let Some(batch) = doc.current_batch() else {
                return Next::Idle;
            };
            let Some(item) = batch.current() else {
                return Next::Advance;
            };
            match item.status() {
                ExecutionStatus::Enqueued | ExecutionStatus::Running => Next::Run(ExecutionJob {
                    item_id: item.id,
                    batch_id: batch.id,
                    block_id: item.block_id.clone(),
                    user_id: item.user_id,
                    metadata: item.metadata.clone(),
                }),
                ExecutionStatus::Aborting | ExecutionStatus::Unknown => Next::Finish(item.id),
                ExecutionStatus::Success | ExecutionStatus::Error | ExecutionStatus::Aborted => {
                    Next::Advance
                }
            }
        });

        match next {
            Next::Idle => false,
            Next::Advance => match self.ctx.notebook.update(|doc| doc.advance()) {
                Ok(batch_id) => {
                    debug!(batch_id = ?batch_id, "batch advanced");
                    true
                }
                Err(e) => {
                    warn!(error = %e, "could not advance queue");
                    false
                }
            },
            Next::Finish(item_id) => {
                self.complete(item_id, CompletionStatus::Aborted);
                true
            }
            Next::Run(job) => self.execute(job).await,
        }
    }

    /// Returns `false` if the item could not be started.
    async fn execute(&self, job: ExecutionJob) -> bool {
        let started = self.ctx.notebook.update(|doc| {
            doc.start_item(job.item_id)?;
            Ok::<_, quire_crdt::DocError>(doc.block(&job.block_id).cloned())
        });
        let block = match started {
            Ok(block) => block,
            Err(quire_crdt::DocError::NotStartable { status, .. }) => {
                debug!(item_id = %job.item_id, status = %status, "item stopped before it started");
                self.complete(job.item_id, CompletionStatus::Aborted);
                return true;
            }
            Err(e) => {
                warn!(item_id = %job.item_id, error = %e, "could not start item");
                return false;
            }
        };
        debug!(item_id = %job.item_id, block_id = %job.block_id, tag = job.metadata.tag(), "executing item");

        let status = match self.resolve(&job, block) {
            Ok((executor, block)) => {
                let run = executor.execute(&self.ctx, &job, block);
                match AssertUnwindSafe(run).catch_unwind().await {
                    Ok(status) => status,
                    Err(_) => {
                        error!(item_id = %job.item_id, block_id = %job.block_id, "executor panicked");
                        CompletionStatus::Error
                    }
                }
            }
            Err(reason) => {
                warn!(item_id = %job.item_id, block_id = %job.block_id, reason, "item cannot run");
                CompletionStatus::Error
            }
        };
        self.complete(job.item_id, status);
        true
    }

    fn resolve(
        &self,
        job: &ExecutionJob,
        block: Option<Block>,
    ) -> Result<(Arc<dyn BlockExecutor>, Block), &'static str> {
        let block = block.ok_or("block no longer exists")?;
        if block.kind() != job.metadata.block_kind() {
            return Err("block kind does not match item metadata");
        }
        let executor = self
            .executors
            .get(block.kind())
            .ok_or("no executor for block kind")?;
        Ok((executor, block))
    }

    fn complete(&self, item_id: ItemId, status: CompletionStatus) {
        match self
            .ctx
            .notebook
            .update(|doc| doc.complete_item(item_id, status))
        {
            Ok(()) => debug!(item_id = %item_id, status = status.as_str(), "item finished"),
            Err(e) => warn!(item_id = %item_id, error = %e, "could not complete item"),
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("document_id", &self.ctx.notebook.document_id())
            .field("executors", &self.executors)
            .finish()
    }
}
