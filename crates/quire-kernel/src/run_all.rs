//! Run-all orchestration.
//!
//! Drives the document's singleton [`RunAll`] record through
//! `run-requested → running → idle` and `abort-requested → aborting → idle`,
//! enqueuing and aborting run-all batches on the execution queue and keeping
//! `remaining` in step with the dispatcher's progress.

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use quire_crdt::NotebookDocument;
use quire_types::{RunAll, RunAllStatus};

use crate::notebook::SharedNotebook;
use crate::queue::QUEUE_SUBJECTS;

pub const RUN_ALL_SUBJECTS: &str = "run_all.>";

pub struct RunAllOrchestrator {
    notebook: SharedNotebook,
    idle_poll: std::time::Duration,
}

impl RunAllOrchestrator {
    pub fn new(notebook: SharedNotebook, idle_poll: std::time::Duration) -> Self {
        Self {
            notebook,
            idle_poll,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let document_id = self.notebook.document_id();
        info!(document_id = %document_id, "run-all orchestrator started");
        let mut run_all = self.notebook.subscribe(RUN_ALL_SUBJECTS);
        let mut queue = self.notebook.subscribe(QUEUE_SUBJECTS);

        self.notebook.update(recover);
        loop {
            while run_all.try_recv().is_some() {}
            while queue.try_recv().is_some() {}
            while self.step() {}
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = run_all.recv() => {}
                _ = queue.recv() => {}
                _ = tokio::time::sleep(self.idle_poll) => {}
            }
        }
        info!(document_id = %document_id, "run-all orchestrator stopped");
    }

    /// Apply one transition. Returns `true` if the state moved.
    pub fn step(&self) -> bool {
        self.notebook.update(transition)
    }
}

/// A restarted orchestrator has lost track of any run it was driving unless
/// its batches are still queued.
fn recover(doc: &mut NotebookDocument) {
    let state = doc.run_all();
    let tracked = matches!(
        state.status,
        RunAllStatus::RunRequested | RunAllStatus::Running | RunAllStatus::ScheduleRunning
    ) && !doc.queue().run_all_batches().is_empty();
    if state.status.is_busy() && state.status != RunAllStatus::RunRequested && !tracked {
        warn!(status = %state.status, "resetting stale run-all state");
        doc.set_run_all(RunAll {
            status: RunAllStatus::Idle,
            remaining: state.total,
            total: state.total,
        });
    }
}

fn transition(doc: &mut NotebookDocument) -> bool {
    let state = doc.run_all();
    let remaining: usize = doc
        .queue()
        .run_all_batches()
        .iter()
        .map(|b| b.remaining())
        .sum();
    let queued = !doc.queue().run_all_batches().is_empty();

    let next = match state.status {
        RunAllStatus::Idle => return false,
        RunAllStatus::RunRequested => match doc.enqueue_run_all(None, false) {
            Ok(Some(batch_id)) => {
                let total = doc.queue().batch(batch_id).map_or(0, |b| b.len());
                info!(batch_id = %batch_id, total, "run-all started");
                RunAll {
                    status: RunAllStatus::Running,
                    remaining: total,
                    total,
                }
            }
            Ok(None) => RunAll::default(),
            Err(e) => {
                warn!(error = %e, "could not enqueue run-all");
                RunAll::default()
            }
        },
        RunAllStatus::Running | RunAllStatus::ScheduleRunning if !queued => {
            info!(total = state.total, "run-all finished");
            RunAll {
                status: RunAllStatus::Idle,
                remaining: state.total,
                total: state.total,
            }
        }
        RunAllStatus::Running | RunAllStatus::ScheduleRunning => RunAll {
            remaining,
            ..state
        },
        RunAllStatus::AbortRequested => {
            let aborted = doc.abort_run_all();
            debug!(items = aborted, "run-all abort requested");
            RunAll {
                status: RunAllStatus::Aborting,
                ..state
            }
        }
        RunAllStatus::Aborting if !queued => {
            info!("run-all aborted");
            RunAll {
                status: RunAllStatus::Idle,
                remaining: state.total,
                total: state.total,
            }
        }
        RunAllStatus::Aborting => return false,
    };

    if next == state {
        return false;
    }
    doc.set_run_all(next);
    true
}

impl std::fmt::Debug for RunAllOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunAllOrchestrator")
            .field("document_id", &self.notebook.document_id())
            .finish_non_exhaustive()
    }
}
