//! Block executors.
//!
//! One executor per executable block kind. The dispatcher resolves the
//! executor from the block kind, hands it the job and a snapshot of the
//! block, and writes the returned [`CompletionStatus`] onto the queue item.
//! Executors never return errors: validation failures, backend failures and
//! aborts all end in a status.

mod date_input;
mod input;
mod python;
mod sql;
mod visualization;

pub use date_input::DateInputExecutor;
pub use input::{DropdownInputExecutor, TextInputExecutor};
pub use python::PythonExecutor;
pub use sql::SqlExecutor;
pub use visualization::VisualizationExecutor;

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio_util::sync::CancellationToken;

use quire_types::{
    BatchId, Block, BlockId, BlockKind, CompletionStatus, ExecutionMetadata, ExecutionStatus,
    ItemId, UserId,
};

use crate::backend::{Backends, ExecutionRequest, OutputSink};
use crate::config::SchedulerConfig;
use crate::error::BackendError;
use crate::notebook::SharedNotebook;
use crate::observe::AbortWatch;

// ============================================================================
// Job and context
// ============================================================================

/// The queue item being executed.
#[derive(Clone, Debug, PartialEq)]
pub struct ExecutionJob {
    pub item_id: ItemId,
    pub batch_id: BatchId,
    pub block_id: BlockId,
    pub user_id: Option<UserId>,
    pub metadata: ExecutionMetadata,
}

#[derive(Clone)]
pub struct ExecutorContext {
    pub notebook: SharedNotebook,
    pub backends: Backends,
    pub config: SchedulerConfig,
    /// Cancelled when the document runtime shuts down.
    pub shutdown: CancellationToken,
}

impl ExecutorContext {
    /// Token cancelled when the job's item is aborted, removed, or the
    /// runtime shuts down.
    pub fn watch_abort(&self, job: &ExecutionJob) -> AbortWatch {
        let item_id = job.item_id;
        AbortWatch::spawn_under(
            &self.shutdown,
            self.notebook.clone(),
            "queue.>",
            self.config.idle_poll(),
            move |doc| {
                doc.queue_item(item_id)
                    .is_none_or(|item| item.status() == ExecutionStatus::Aborting)
            },
        )
    }

    /// Write to the block being executed. A block deleted mid-run is logged
    /// and skipped.
    pub fn update_block<R>(&self, block_id: &BlockId, f: impl FnOnce(&mut Block) -> R) -> Option<R> {
        match self.notebook.update(|doc| doc.update_block(block_id, f)) {
            Ok(out) => Some(out),
            Err(e) => {
                tracing::warn!(block_id = %block_id, error = %e, "block update dropped");
                None
            }
        }
    }
}

impl std::fmt::Debug for ExecutorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorContext")
            .field("document_id", &self.notebook.document_id())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Executor trait and registry
// ============================================================================

#[async_trait]
pub trait BlockExecutor: Send + Sync {
    fn kind(&self) -> BlockKind;

    /// Run `block` (a snapshot taken when the item started) to a terminal
    /// status.
    async fn execute(&self, ctx: &ExecutorContext, job: &ExecutionJob, block: Block) -> CompletionStatus;
}

#[derive(Default)]
pub struct ExecutorRegistry {
    executors: HashMap<BlockKind, Arc<dyn BlockExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with an executor for every executable block kind.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(PythonExecutor));
        registry.register(Arc::new(SqlExecutor));
        registry.register(Arc::new(VisualizationExecutor));
        registry.register(Arc::new(TextInputExecutor));
        registry.register(Arc::new(DropdownInputExecutor));
        registry.register(Arc::new(DateInputExecutor));
        registry
    }

    /// Register an executor, replacing any previous one for its kind.
    pub fn register(&mut self, executor: Arc<dyn BlockExecutor>) {
        self.executors.insert(executor.kind(), executor);
    }

    pub fn get(&self, kind: BlockKind) -> Option<Arc<dyn BlockExecutor>> {
        self.executors.get(&kind).cloned()
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("kinds", &self.executors.keys().collect::<Vec<_>>())
            .finish()
    }
}

// ============================================================================
// Shared helpers
// ============================================================================

/// How a backend call ended.
#[derive(Debug)]
pub(crate) enum Settled<T> {
    Done(T),
    /// Cancellation fired first. `acknowledged` is true when the backend
    /// returned within the grace period.
    Aborted { acknowledged: bool },
}

/// Await `call`, racing it against `cancel`.
///
/// Once cancelled, the call (which holds the same token) gets `grace` to
/// wind down before it is dropped.
pub(crate) async fn settle<T>(
    call: impl Future<Output = T>,
    cancel: &CancellationToken,
    grace: Duration,
) -> Settled<T> {
    let mut call = std::pin::pin!(call);
    tokio::select! {
        biased;
        out = &mut call => Settled::Done(out),
        _ = cancel.cancelled() => {
            let acknowledged = tokio::time::timeout(grace, &mut call).await.is_ok();
            Settled::Aborted { acknowledged }
        }
    }
}

static VARIABLE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*$").expect("variable name pattern"));

const PYTHON_KEYWORDS: &[&str] = &[
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class",
    "continue", "def", "del", "elif", "else", "except", "finally", "for", "from", "global",
    "if", "import", "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise", "return",
    "try", "while", "with", "yield",
];

pub(crate) fn is_valid_variable_name(name: &str) -> bool {
    VARIABLE_NAME.is_match(name) && !PYTHON_KEYWORDS.contains(&name)
}

/// Run a short assignment snippet on the execution backend.
///
/// Succeeds only if the backend ran it without producing an error record.
pub(crate) async fn run_assignment(
    ctx: &ExecutorContext,
    source: String,
    cancel: &CancellationToken,
) -> Result<(), AssignmentFailure> {
    let errors = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = {
        let errors = errors.clone();
        OutputSink::new(move |outputs| {
            errors
                .lock()
                .extend(outputs.into_iter().filter(|o| o.is_error()));
        })
    };
    let request = ExecutionRequest {
        workspace_id: ctx.notebook.workspace_id(),
        document_id: ctx.notebook.document_id(),
        source,
        store_history: false,
    };
    let call = ctx
        .backends
        .execution
        .execute(request, sink, cancel.clone());
    match settle(call, cancel, ctx.config.abort_grace()).await {
        Settled::Aborted { .. } | Settled::Done(Err(BackendError::Cancelled)) => {
            Err(AssignmentFailure::Aborted)
        }
        Settled::Done(Err(e)) => Err(AssignmentFailure::Backend(e)),
        Settled::Done(Ok(())) => match errors.lock().first() {
            Some(quire_types::Output::Error { ename, evalue, .. }) => {
                Err(AssignmentFailure::Raised(format!("{ename}: {evalue}")))
            }
            _ => Ok(()),
        },
    }
}

#[derive(Debug)]
pub(crate) enum AssignmentFailure {
    Aborted,
    Backend(BackendError),
    Raised(String),
}

impl AssignmentFailure {
    pub(crate) fn status(&self) -> CompletionStatus {
        match self {
            AssignmentFailure::Aborted => CompletionStatus::Aborted,
            AssignmentFailure::Backend(_) | AssignmentFailure::Raised(_) => CompletionStatus::Error,
        }
    }
}

/// Quote a string as a Python literal.
pub(crate) fn python_string(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}
