//! Interfaces to the services that actually run code.
//!
//! The scheduler never talks to a Python kernel, a database or a model
//! directly. Each executor calls one of these traits, passing a
//! [`CancellationToken`] that is cancelled when the work is aborted.
//! Implementations should stop promptly once it fires and return
//! [`BackendError::Cancelled`].

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use quire_types::{AiTaskMetadata, DataFrameInfo, DocumentId, Output, SqlResult, WorkspaceId};

use crate::error::BackendError;

pub type BackendResult<T> = Result<T, BackendError>;

// ============================================================================
// Python execution
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub workspace_id: WorkspaceId,
    pub document_id: DocumentId,
    pub source: String,
    /// Whether the run should appear in the kernel's input history.
    pub store_history: bool,
}

/// Receives output records as the backend produces them.
#[derive(Clone)]
pub struct OutputSink(Arc<dyn Fn(Vec<Output>) + Send + Sync>);

impl OutputSink {
    pub fn new(f: impl Fn(Vec<Output>) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    /// Sink that drops everything.
    pub fn discard() -> Self {
        Self::new(|_| {})
    }

    pub fn emit(&self, outputs: Vec<Output>) {
        if !outputs.is_empty() {
            (self.0)(outputs);
        }
    }
}

impl std::fmt::Debug for OutputSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("OutputSink")
    }
}

#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Run `request.source`, streaming outputs into `sink`.
    ///
    /// Error records produced by user code are outputs, not `Err`. `Err` is
    /// reserved for the backend itself failing.
    async fn execute(
        &self,
        request: ExecutionRequest,
        sink: OutputSink,
        cancel: CancellationToken,
    ) -> BackendResult<()>;
}

#[async_trait]
pub trait DataframeLister: Send + Sync {
    /// Dataframes currently defined in the document's Python environment.
    async fn list_dataframes(
        &self,
        workspace_id: WorkspaceId,
        document_id: DocumentId,
    ) -> BackendResult<Vec<DataFrameInfo>>;
}

// ============================================================================
// SQL
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub workspace_id: WorkspaceId,
    pub document_id: DocumentId,
    pub data_source_id: String,
    pub is_file_data_source: bool,
    pub query: String,
    /// Python variable the result is bound to.
    pub dataframe_name: String,
}

#[async_trait]
pub trait QueryBackend: Send + Sync {
    /// Run a query. Query-level failures come back as non-success
    /// [`SqlResult`] variants.
    async fn run_query(
        &self,
        request: QueryRequest,
        cancel: CancellationToken,
    ) -> BackendResult<SqlResult>;
}

// ============================================================================
// Charts
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartRequest {
    pub workspace_id: WorkspaceId,
    pub document_id: DocumentId,
    pub dataframe: String,
    pub chart_type: Option<String>,
    pub x_axis: Option<String>,
    pub y_axes: Vec<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ChartOutcome {
    Spec(serde_json::Value),
    /// The chart could not be built from the given columns.
    Invalid(String),
}

#[async_trait]
pub trait ChartBackend: Send + Sync {
    async fn render(
        &self,
        request: ChartRequest,
        cancel: CancellationToken,
    ) -> BackendResult<ChartOutcome>;
}

// ============================================================================
// AI assistant
// ============================================================================

#[derive(Clone, Debug, PartialEq)]
pub struct AiRequest {
    pub workspace_id: WorkspaceId,
    pub document_id: DocumentId,
    pub kind: AiTaskMetadata,
    pub source: String,
    /// User prompt for edit tasks.
    pub instructions: Option<String>,
    /// Failure being fixed, for fix tasks.
    pub error: Option<String>,
    pub dataframes: Vec<DataFrameInfo>,
}

/// Receives the suggestion text accumulated so far.
#[derive(Clone)]
pub struct SuggestionSink(Arc<dyn Fn(&str) + Send + Sync>);

impl SuggestionSink {
    pub fn new(f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn emit(&self, partial: &str) {
        (self.0)(partial)
    }
}

impl std::fmt::Debug for SuggestionSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SuggestionSink")
    }
}

#[async_trait]
pub trait AiAssistant: Send + Sync {
    /// Produce replacement source for the block. Returns the final text.
    async fn suggest(
        &self,
        request: AiRequest,
        sink: SuggestionSink,
        cancel: CancellationToken,
    ) -> BackendResult<String>;
}

// ============================================================================
// Bundle
// ============================================================================

/// Every backend a document runtime needs.
#[derive(Clone)]
pub struct Backends {
    pub execution: Arc<dyn ExecutionBackend>,
    pub dataframes: Arc<dyn DataframeLister>,
    pub queries: Arc<dyn QueryBackend>,
    pub charts: Arc<dyn ChartBackend>,
    pub assistant: Arc<dyn AiAssistant>,
}

impl std::fmt::Debug for Backends {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backends").finish_non_exhaustive()
    }
}
