//! In-process backends and a document harness for the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use quire_crdt::{Change, NotebookDocument};
use quire_kernel::backend::BackendResult;
use quire_kernel::{
    AiAssistant, AiRequest, BackendError, Backends, ChartBackend, ChartOutcome, ChartRequest,
    DataframeLister, DocumentRuntime, Documents, ExecutionBackend, ExecutionRequest, OutputSink,
    NotebookFlow, QueryBackend, QueryRequest, SchedulerConfig, Subscription, SuggestionSink,
};
use quire_types::{
    BlockId, DataFrameColumn, DataFrameInfo, DocumentId, ExecutionStatus, ItemId, Output, SqlResult,
    WorkspaceId,
};

// ============================================================================
// Gate
// ============================================================================

/// Holds backend calls until the test releases them.
#[derive(Clone)]
pub struct Gate(Arc<Semaphore>);

impl Gate {
    pub fn new() -> Self {
        Self(Arc::new(Semaphore::new(0)))
    }

    pub fn release(&self, calls: usize) {
        self.0.add_permits(calls);
    }

    /// Wait for a release. Returns `false` if cancelled first.
    pub async fn pass(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            permit = self.0.acquire() => {
                if let Ok(permit) = permit {
                    permit.forget();
                }
                true
            }
            _ = cancel.cancelled() => false,
        }
    }
}

// ============================================================================
// Python
// ============================================================================

#[derive(Clone, Default)]
pub struct Script {
    pub before: Vec<Output>,
    pub gate: Option<Gate>,
    pub after: Vec<Output>,
    pub fail: Option<BackendError>,
}

impl Script {
    pub fn outputs(outputs: Vec<Output>) -> Self {
        Self {
            before: outputs,
            ..Default::default()
        }
    }

    pub fn gated(before: Vec<Output>, gate: &Gate) -> Self {
        Self {
            before,
            gate: Some(gate.clone()),
            ..Default::default()
        }
    }

    pub fn failing(error: BackendError) -> Self {
        Self {
            fail: Some(error),
            ..Default::default()
        }
    }
}

#[derive(Default)]
pub struct MockExecution {
    scripts: Mutex<HashMap<String, Script>>,
    calls: Mutex<Vec<ExecutionRequest>>,
}

impl MockExecution {
    pub fn script(&self, source: &str, script: Script) {
        self.scripts.lock().insert(source.to_string(), script);
    }

    pub fn calls(&self) -> Vec<ExecutionRequest> {
        self.calls.lock().clone()
    }

    pub fn sources(&self) -> Vec<String> {
        self.calls.lock().iter().map(|c| c.source.clone()).collect()
    }
}

#[async_trait]
impl ExecutionBackend for MockExecution {
    async fn execute(
        &self,
        request: ExecutionRequest,
        sink: OutputSink,
        cancel: CancellationToken,
    ) -> BackendResult<()> {
        let script = self
            .scripts
            .lock()
            .get(&request.source)
            .cloned()
            .unwrap_or_default();
        self.calls.lock().push(request);

        sink.emit(script.before);
        if let Some(gate) = &script.gate
            && !gate.pass(&cancel).await
        {
            return Err(BackendError::Cancelled);
        }
        sink.emit(script.after);
        match script.fail {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[derive(Default)]
pub struct MockLister {
    pub frames: Mutex<Vec<DataFrameInfo>>,
}

impl MockLister {
    pub fn set(&self, frames: Vec<DataFrameInfo>) {
        *self.frames.lock() = frames;
    }
}

#[async_trait]
impl DataframeLister for MockLister {
    async fn list_dataframes(
        &self,
        _workspace_id: WorkspaceId,
        _document_id: DocumentId,
    ) -> BackendResult<Vec<DataFrameInfo>> {
        Ok(self.frames.lock().clone())
    }
}

pub fn frame(name: &str, columns: &[&str]) -> DataFrameInfo {
    DataFrameInfo {
        name: name.to_string(),
        columns: columns
            .iter()
            .map(|c| DataFrameColumn::new(*c, "int64"))
            .collect(),
    }
}

// ============================================================================
// SQL and charts
// ============================================================================

#[derive(Default)]
pub struct MockQueries {
    pub result: Mutex<Option<SqlResult>>,
    pub calls: Mutex<Vec<QueryRequest>>,
}

#[async_trait]
impl QueryBackend for MockQueries {
    async fn run_query(
        &self,
        request: QueryRequest,
        _cancel: CancellationToken,
    ) -> BackendResult<SqlResult> {
        self.calls.lock().push(request);
        Ok(self.result.lock().clone().unwrap_or(SqlResult::Success {
            columns: vec![DataFrameColumn::new("n", "int64")],
            rows: vec![vec![serde_json::json!(1)]],
            count: 1,
            query_duration_ms: 3,
        }))
    }
}

#[derive(Default)]
pub struct MockCharts {
    pub calls: AtomicUsize,
}

#[async_trait]
impl ChartBackend for MockCharts {
    async fn render(
        &self,
        request: ChartRequest,
        _cancel: CancellationToken,
    ) -> BackendResult<ChartOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ChartOutcome::Spec(
            serde_json::json!({ "mark": "bar", "data": request.dataframe }),
        ))
    }
}

// ============================================================================
// AI assistant
// ============================================================================

#[derive(Default)]
pub struct MockAssistant {
    pub gate: Mutex<Option<Gate>>,
    pub requests: Mutex<Vec<AiRequest>>,
    active: AtomicUsize,
    pub max_active: AtomicUsize,
}

impl MockAssistant {
    pub fn hold(&self, gate: &Gate) {
        *self.gate.lock() = Some(gate.clone());
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AiAssistant for MockAssistant {
    async fn suggest(
        &self,
        request: AiRequest,
        sink: SuggestionSink,
        cancel: CancellationToken,
    ) -> BackendResult<String> {
        let gate = self.gate.lock().clone();
        let suggestion = format!("# suggested\n{}", request.source);
        self.requests.lock().push(request);

        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);

        sink.emit("# suggested");
        let released = match gate {
            Some(gate) => gate.pass(&cancel).await,
            None => true,
        };
        self.active.fetch_sub(1, Ordering::SeqCst);
        if released {
            Ok(suggestion)
        } else {
            Err(BackendError::Cancelled)
        }
    }
}

// ============================================================================
// Harness
// ============================================================================

pub fn fast_config() -> SchedulerConfig {
    SchedulerConfig {
        idle_poll_ms: 10,
        abort_grace_ms: 200,
        ai_ping_timeout_ms: 5_000,
        ai_concurrency: 2,
        flow_capacity: 256,
    }
}

pub struct Harness {
    pub documents: Documents,
    pub runtime: Arc<DocumentRuntime>,
    pub execution: Arc<MockExecution>,
    pub lister: Arc<MockLister>,
    pub queries: Arc<MockQueries>,
    pub charts: Arc<MockCharts>,
    pub assistant: Arc<MockAssistant>,
}

impl Harness {
    /// Backends are scripted through the returned handles; call
    /// [`HarnessBuilder::open`] once scripts are in place.
    pub fn builder() -> HarnessBuilder {
        HarnessBuilder {
            execution: Arc::new(MockExecution::default()),
            lister: Arc::new(MockLister::default()),
            queries: Arc::new(MockQueries::default()),
            charts: Arc::new(MockCharts::default()),
            assistant: Arc::new(MockAssistant::default()),
            config: fast_config(),
        }
    }

    pub fn item_status(&self, item_id: ItemId) -> Option<ExecutionStatus> {
        self.runtime.queue.item_status(item_id)
    }

    /// Start recording item status changes. Create it before enqueuing:
    /// finished batches leave the queue, so statuses can only be observed
    /// as they happen.
    pub fn watch_items(&self) -> ItemWatch {
        ItemWatch {
            sub: self.runtime.notebook.subscribe("queue.item"),
            seen: HashMap::new(),
        }
    }

    /// Id of the most recently enqueued item for `block`.
    pub fn last_item(&self, block: &str) -> ItemId {
        let items = self.runtime.queue.block_executions(&BlockId::from(block), None);
        items.last().map(|i| i.id).expect("block has no queued item")
    }

    pub async fn wait_for_idle(&self) {
        eventually(|| self.runtime.queue.is_empty()).await;
    }
}

pub struct ItemWatch {
    sub: Subscription<NotebookFlow>,
    seen: HashMap<ItemId, ExecutionStatus>,
}

impl ItemWatch {
    pub async fn wait_for(&mut self, item_id: ItemId, status: ExecutionStatus) {
        let wait = async {
            while self.seen.get(&item_id) != Some(&status) {
                let msg = self.sub.recv().await.expect("flow bus closed");
                if let Change::ItemStatus { item_id, status, .. } = msg.payload.change {
                    self.seen.insert(item_id, status);
                }
            }
        };
        if tokio::time::timeout(Duration::from_secs(5), wait).await.is_err() {
            panic!(
                "item {item_id} never reached {status}, last seen {:?}",
                self.seen.get(&item_id)
            );
        }
    }

    /// Latest status seen for `item_id`.
    pub fn last(&self, item_id: ItemId) -> Option<ExecutionStatus> {
        self.seen.get(&item_id).copied()
    }
}

pub struct HarnessBuilder {
    pub execution: Arc<MockExecution>,
    pub lister: Arc<MockLister>,
    pub queries: Arc<MockQueries>,
    pub charts: Arc<MockCharts>,
    pub assistant: Arc<MockAssistant>,
    pub config: SchedulerConfig,
}

impl HarnessBuilder {
    pub fn open(self, doc: NotebookDocument) -> Harness {
        let backends = Backends {
            execution: self.execution.clone(),
            dataframes: self.lister.clone(),
            queries: self.queries.clone(),
            charts: self.charts.clone(),
            assistant: self.assistant.clone(),
        };
        let documents = Documents::new(self.config, backends);
        let runtime = documents.open(WorkspaceId::new(), DocumentId::new(), doc);
        Harness {
            documents,
            runtime,
            execution: self.execution,
            lister: self.lister,
            queries: self.queries,
            charts: self.charts,
            assistant: self.assistant,
        }
    }
}

/// Poll `check` until it holds, failing the test after five seconds.
pub async fn eventually(check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
