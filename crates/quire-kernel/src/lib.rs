//! # quire-kernel
//!
//! Execution scheduler for quire notebooks.
//!
//! Every open document gets:
//! - a [`Notebook`]: the shared document behind a lock, plus a [`FlowBus`]
//!   on which every change is published once the lock is released
//! - an [`ExecutionQueue`] and an [`AiTasks`] handle for producers
//! - a [`Dispatcher`] that runs queued blocks one at a time through the
//!   [`BlockExecutor`] registered for their kind
//! - an [`AiDispatcher`] running AI-assist tasks with bounded concurrency
//!   and ping-based liveness
//! - a [`RunAllOrchestrator`] driving the document's run-all state
//!
//! [`Documents`] owns all of that per document and starts/stops it.
//! External services (Python kernel, SQL engine, chart renderer, AI
//! assistant) are reached only through the traits in [`backend`].

pub mod ai_dispatch;
pub mod ai_tasks;
pub mod backend;
pub mod config;
pub mod dispatch;
pub mod documents;
pub mod error;
pub mod executors;
pub mod flows;
pub mod notebook;
pub mod observe;
pub mod queue;
pub mod run_all;

pub use ai_dispatch::AiDispatcher;
pub use ai_tasks::AiTasks;
pub use backend::{
    AiAssistant, AiRequest, Backends, ChartBackend, ChartOutcome, ChartRequest, DataframeLister,
    ExecutionBackend, ExecutionRequest, OutputSink, QueryBackend, QueryRequest, SuggestionSink,
};
pub use config::SchedulerConfig;
pub use dispatch::Dispatcher;
pub use documents::{DocumentRuntime, Documents};
pub use error::{BackendError, ConfigError, KernelError, KernelResult};
pub use executors::{BlockExecutor, ExecutionJob, ExecutorContext, ExecutorRegistry};
pub use flows::{
    FlowBus, FlowMessage, HasSubject, NotebookFlow, OpSource, SharedNotebookFlowBus, Subscription,
    matches_pattern,
};
pub use notebook::{Notebook, SharedNotebook};
pub use observe::{AbortWatch, ObserverGuard, ObserverHub};
pub use queue::ExecutionQueue;
pub use run_all::RunAllOrchestrator;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install a stderr fmt subscriber filtered by `RUST_LOG` (default `info`).
///
/// Safe to call more than once; only the first call installs anything.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init();
}
