//! End-to-end execution through the dispatcher with in-process backends.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use common::{Gate, Harness, Script, eventually, frame};
use quire_crdt::NotebookDocument;
use quire_kernel::BackendError;
use quire_types::{
    Block, BlockBody, BlockId, DataFrameColumn, ExecutionMetadata, ExecutionStatus, FieldError,
    Output, SqlResult, VisualizationBlock,
};

fn python() -> ExecutionMetadata {
    ExecutionMetadata::Python {
        is_suggestion: false,
    }
}

fn doc(blocks: Vec<Block>) -> NotebookDocument {
    let mut doc = NotebookDocument::default();
    for block in blocks {
        doc.append_block(block).unwrap();
    }
    doc
}

fn block(h: &Harness, id: &str) -> Block {
    h.runtime
        .notebook
        .read(|doc| doc.block(&BlockId::from(id)).cloned())
        .unwrap()
}

#[tokio::test]
async fn python_run_stamps_and_registers_dataframes() {
    let builder = Harness::builder();
    builder
        .execution
        .script("df1 = load()", Script::outputs(vec![Output::stdout("loaded\n")]));
    builder.lister.set(vec![frame("df1", &["a", "b"])]);
    let h = builder.open(doc(vec![Block::new_python("a", "df1 = load()")]));
    let mut items = h.watch_items();

    h.runtime.queue.enqueue_block(&"a".into(), None, python()).unwrap();
    let item = h.last_item("a");
    items.wait_for(item, ExecutionStatus::Success).await;

    let python = block(&h, "a").python().cloned().unwrap();
    assert_eq!(python.result, vec![Output::stdout("loaded\n")]);
    assert_eq!(python.last_query.as_deref(), Some("df1 = load()"));
    assert!(python.last_query_time.is_some());
    assert!(python.start_query_time.is_some());

    let df = h
        .runtime
        .notebook
        .read(|doc| doc.dataframes().get("df1").cloned())
        .unwrap();
    assert_eq!(df.block_id, Some(BlockId::from("a")));
    assert_eq!(df.columns.len(), 2);

    let calls = h.execution.calls();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].store_history);
    h.wait_for_idle().await;
}

#[tokio::test]
async fn rerun_replaces_dataframe_entry() {
    let builder = Harness::builder();
    builder.lister.set(vec![frame("df1", &["a"])]);
    let h = builder.open(doc(vec![Block::new_python("a", "df1 = v1()")]));
    let mut items = h.watch_items();

    h.runtime.queue.enqueue_block(&"a".into(), None, python()).unwrap();
    items.wait_for(h.last_item("a"), ExecutionStatus::Success).await;
    let first = h
        .runtime
        .notebook
        .read(|doc| doc.dataframes().get("df1").cloned())
        .unwrap();

    h.lister.set(vec![frame("df1", &["a", "b", "c"])]);
    tokio::time::sleep(std::time::Duration::from_millis(2)).await;
    h.runtime.queue.enqueue_block(&"a".into(), None, python()).unwrap();
    items.wait_for(h.last_item("a"), ExecutionStatus::Success).await;

    let (count, df) = h.runtime.notebook.read(|doc| {
        (doc.dataframes().len(), doc.dataframes().get("df1").cloned())
    });
    let df = df.unwrap();
    assert_eq!(count, 1);
    assert_eq!(df.columns.len(), 3);
    assert!(df.updated_at > first.updated_at);
}

#[tokio::test]
async fn error_output_fails_item_and_is_kept() {
    let builder = Harness::builder();
    builder.execution.script(
        "1/0",
        Script::outputs(vec![Output::error("ZeroDivisionError", "division by zero")]),
    );
    let h = builder.open(doc(vec![Block::new_python("a", "1/0")]));
    let mut items = h.watch_items();

    h.runtime.queue.enqueue_block(&"a".into(), None, python()).unwrap();
    items.wait_for(h.last_item("a"), ExecutionStatus::Error).await;

    let python = block(&h, "a").python().cloned().unwrap();
    assert!(python.error_output().is_some());
    assert_eq!(python.last_query.as_deref(), Some("1/0"));
}

#[tokio::test]
async fn abort_keeps_partial_output_without_stamping() {
    let gate = Gate::new();
    let builder = Harness::builder();
    builder.execution.script(
        "slow()",
        Script::gated(vec![Output::stdout("step 1\n")], &gate),
    );
    let h = builder.open(doc(vec![Block::new_python("a", "slow()")]));
    let mut items = h.watch_items();

    h.runtime.queue.enqueue_block(&"a".into(), None, python()).unwrap();
    let item = h.last_item("a");
    items.wait_for(item, ExecutionStatus::Running).await;
    eventually(|| block(&h, "a").python().is_some_and(|p| p.result.len() == 1)).await;

    assert!(h.runtime.queue.request_abort(item).unwrap());
    items.wait_for(item, ExecutionStatus::Aborted).await;

    let python = block(&h, "a").python().cloned().unwrap();
    assert_eq!(python.result, vec![Output::stdout("step 1\n")]);
    assert!(python.last_query.is_none());
    assert!(python.last_query_time.is_none());
    h.wait_for_idle().await;
}

#[tokio::test]
async fn aborted_before_start_never_reaches_backend() {
    let gate = Gate::new();
    let builder = Harness::builder();
    builder
        .execution
        .script("first()", Script::gated(Vec::new(), &gate));
    let h = builder.open(doc(vec![
        Block::new_python("a", "first()"),
        Block::new_python("b", "second()"),
    ]));
    let mut items = h.watch_items();

    h.runtime.queue.enqueue_block(&"a".into(), None, python()).unwrap();
    h.runtime.queue.enqueue_block(&"b".into(), None, python()).unwrap();
    let (a, b) = (h.last_item("a"), h.last_item("b"));
    items.wait_for(a, ExecutionStatus::Running).await;

    assert!(h.runtime.queue.request_abort(b).unwrap());
    gate.release(1);
    items.wait_for(a, ExecutionStatus::Success).await;
    items.wait_for(b, ExecutionStatus::Aborted).await;

    assert_eq!(h.execution.sources(), ["first()"]);
    h.wait_for_idle().await;
}

#[tokio::test]
async fn at_most_one_item_runs_at_a_time() {
    let h = Harness::builder().open(doc(vec![
        Block::new_python("a", "a()"),
        Block::new_python("b", "b()"),
        Block::new_python("c", "c()"),
    ]));
    let max_running = Arc::new(AtomicUsize::new(0));
    let guard = {
        let notebook = h.runtime.notebook.clone();
        let max_running = max_running.clone();
        h.runtime.queue.observe(move |_| {
            let running = notebook.read(|doc| {
                doc.queue()
                    .batches()
                    .iter()
                    .flat_map(|b| b.items.iter())
                    .filter(|i| i.status() == ExecutionStatus::Running)
                    .count()
            });
            max_running.fetch_max(running, Ordering::SeqCst);
        })
    };

    for id in ["c", "a", "b"] {
        h.runtime.queue.enqueue_block(&id.into(), None, python()).unwrap();
    }
    h.wait_for_idle().await;
    eventually(|| h.execution.calls().len() == 3).await;

    assert_eq!(h.execution.sources(), ["c()", "a()", "b()"]);
    assert!(max_running.load(Ordering::SeqCst) <= 1);
    guard.unobserve();
    assert_eq!(h.runtime.queue.observer_count(), 0);
}

#[tokio::test]
async fn dependency_run_then_recompute_is_empty() {
    let h = Harness::builder().open(doc(vec![
        Block::new_python("a", "x = 1"),
        Block::new_python("b", "y = x + 1"),
    ]));
    let env_started_at = Some(1);
    let target = BlockId::from("b");
    assert_eq!(
        h.runtime.queue.dependency_queue(&target, false, env_started_at),
        [BlockId::from("a")]
    );

    let mut items = h.watch_items();
    h.runtime
        .queue
        .enqueue_with_dependencies(&target, None, python(), env_started_at, false)
        .unwrap();
    let b = h.last_item("b");
    items.wait_for(b, ExecutionStatus::Success).await;

    assert_eq!(h.execution.sources(), ["x = 1", "y = x + 1"]);
    assert!(
        h.runtime
            .queue
            .dependency_queue(&target, false, env_started_at)
            .is_empty()
    );

    // A kernel restart after the run makes every upstream block stale.
    let restarted = Some(quire_types::now_millis() + 60_000);
    assert_eq!(
        h.runtime.queue.dependency_queue(&target, false, restarted),
        [BlockId::from("a")]
    );
}

#[tokio::test]
async fn backend_failure_errors_item_and_queue_moves_on() {
    let builder = Harness::builder();
    builder.execution.script(
        "boom()",
        Script::failing(BackendError::Unavailable("kernel died".into())),
    );
    let h = builder.open(doc(vec![
        Block::new_python("a", "boom()"),
        Block::new_python("b", "fine()"),
    ]));
    let mut items = h.watch_items();

    h.runtime.queue.enqueue_block(&"a".into(), None, python()).unwrap();
    h.runtime.queue.enqueue_block(&"b".into(), None, python()).unwrap();
    let (a, b) = (h.last_item("a"), h.last_item("b"));
    items.wait_for(a, ExecutionStatus::Error).await;
    items.wait_for(b, ExecutionStatus::Success).await;
    h.wait_for_idle().await;

    let python = block(&h, "a").python().cloned().unwrap();
    assert!(python.error_output().is_some());
    assert!(python.last_query.is_none());
}

#[tokio::test]
async fn deleted_block_errors_its_item() {
    let gate = Gate::new();
    let builder = Harness::builder();
    builder
        .execution
        .script("hold()", Script::gated(Vec::new(), &gate));
    let h = builder.open(doc(vec![
        Block::new_python("a", "hold()"),
        Block::new_python("b", "gone()"),
    ]));
    let mut items = h.watch_items();

    h.runtime.queue.enqueue_block(&"a".into(), None, python()).unwrap();
    h.runtime.queue.enqueue_block(&"b".into(), None, python()).unwrap();
    let b = h.last_item("b");
    h.runtime
        .notebook
        .update(|doc| doc.remove_block(&"b".into()))
        .unwrap();
    gate.release(1);

    items.wait_for(b, ExecutionStatus::Error).await;
    assert_eq!(h.execution.sources(), ["hold()"]);
}

// ============================================================================
// Inputs
// ============================================================================

#[tokio::test]
async fn invalid_variable_name_short_circuits() {
    let mut input = Block::new_input("in", "x", "hello");
    input.input_mut().unwrap().variable.edit("2fast");
    let h = Harness::builder().open(doc(vec![input]));
    let mut items = h.watch_items();

    h.runtime
        .queue
        .enqueue_block(&"in".into(), None, ExecutionMetadata::TextInput)
        .unwrap();
    items.wait_for(h.last_item("in"), ExecutionStatus::Error).await;

    let input = block(&h, "in").input().cloned().unwrap();
    assert_eq!(input.variable.error, Some(FieldError::InvalidVariableName));
    assert_eq!(input.variable.value, "x");
    assert!(h.execution.calls().is_empty());
}

#[tokio::test]
async fn text_input_assigns_and_commits() {
    let mut input = Block::new_input("in", "x", "hello");
    input.input_mut().unwrap().value.edit("it's new");
    let h = Harness::builder().open(doc(vec![input]));
    let mut items = h.watch_items();

    h.runtime
        .queue
        .enqueue_block(&"in".into(), None, ExecutionMetadata::TextInput)
        .unwrap();
    items.wait_for(h.last_item("in"), ExecutionStatus::Success).await;

    let calls = h.execution.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].source, r#"x = "it's new""#);
    assert!(!calls[0].store_history);

    let block = block(&h, "in");
    let input = block.input().unwrap();
    assert_eq!(input.value.value, "it's new");
    assert!(input.executed_at.is_some());
    assert!(!block.is_dirty());
}

#[tokio::test]
async fn input_edit_during_run_stays_pending() {
    let gate = Gate::new();
    let builder = Harness::builder();
    builder
        .execution
        .script(r#"x = "one""#, Script::gated(Vec::new(), &gate));
    let mut input = Block::new_input("in", "x", "");
    input.input_mut().unwrap().value.edit("one");
    let h = builder.open(doc(vec![input]));
    let mut items = h.watch_items();

    h.runtime
        .queue
        .enqueue_block(&"in".into(), None, ExecutionMetadata::TextInput)
        .unwrap();
    let item = h.last_item("in");
    items.wait_for(item, ExecutionStatus::Running).await;

    h.runtime
        .notebook
        .update(|doc| {
            doc.update_block(&"in".into(), |b| {
                let input = b.input_mut().unwrap();
                input.variable.edit("y");
                input.value.edit("two");
            })
        })
        .unwrap();
    gate.release(1);
    items.wait_for(item, ExecutionStatus::Success).await;

    let block = block(&h, "in");
    let input = block.input().unwrap();
    assert_eq!(input.variable.value, "x");
    assert_eq!(input.value.value, "one");
    assert_eq!(input.variable.new_value, "y");
    assert_eq!(input.value.new_value, "two");
    assert!(block.is_dirty());
}

// ============================================================================
// SQL and visualization
// ============================================================================

#[tokio::test]
async fn sql_success_registers_dataframe() {
    let h = Harness::builder().open(doc(vec![Block::new_sql(
        "q",
        "  select 1 as n  ",
        "warehouse",
        "result_df",
    )]));
    let mut items = h.watch_items();

    h.runtime
        .queue
        .enqueue_block(
            &"q".into(),
            None,
            ExecutionMetadata::Sql {
                is_suggestion: false,
                selected_code: None,
            },
        )
        .unwrap();
    items.wait_for(h.last_item("q"), ExecutionStatus::Success).await;

    let calls = h.queries.calls.lock().clone();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].query, "select 1 as n");
    assert_eq!(calls[0].dataframe_name, "result_df");

    let sql = block(&h, "q").sql().cloned().unwrap();
    assert!(sql.result.as_ref().is_some_and(SqlResult::is_success));
    assert_eq!(sql.last_query.as_deref(), Some("select 1 as n"));

    let df = h
        .runtime
        .notebook
        .read(|doc| doc.dataframes().get("result_df").cloned())
        .unwrap();
    assert_eq!(df.block_id, Some(BlockId::from("q")));
    assert_eq!(df.columns, vec![DataFrameColumn::new("n", "int64")]);
}

#[tokio::test]
async fn empty_sql_query_is_an_error_without_backend_call() {
    let h = Harness::builder().open(doc(vec![Block::new_sql("q", "   ", "warehouse", "df")]));
    let mut items = h.watch_items();

    h.runtime
        .queue
        .enqueue_block(
            &"q".into(),
            None,
            ExecutionMetadata::Sql {
                is_suggestion: false,
                selected_code: None,
            },
        )
        .unwrap();
    items.wait_for(h.last_item("q"), ExecutionStatus::Error).await;

    assert!(h.queries.calls.lock().is_empty());
    let sql = block(&h, "q").sql().cloned().unwrap();
    assert_eq!(sql.result, Some(SqlResult::EmptyQuery));
    assert!(sql.last_query.is_none());
}

#[tokio::test]
async fn visualization_needs_its_dataframe() {
    let vis = Block::new(
        "v",
        BlockBody::Visualization(VisualizationBlock {
            dataframe_name: Some("sales".into()),
            chart_type: Some("bar".into()),
            x_axis: Some("month".into()),
            y_axes: vec!["total".into()],
            ..Default::default()
        }),
    );
    let h = Harness::builder().open(doc(vec![vis]));
    let mut items = h.watch_items();

    h.runtime
        .queue
        .enqueue_block(&"v".into(), None, ExecutionMetadata::Visualization)
        .unwrap();
    items.wait_for(h.last_item("v"), ExecutionStatus::Error).await;
    assert_eq!(h.charts.calls.load(Ordering::SeqCst), 0);

    h.runtime.notebook.update(|doc| {
        doc.put_dataframe(quire_types::DataFrame {
            name: "sales".into(),
            columns: vec![DataFrameColumn::new("total", "float64")],
            updated_at: 1,
            block_id: None,
        })
    });
    h.runtime
        .queue
        .enqueue_block(&"v".into(), None, ExecutionMetadata::Visualization)
        .unwrap();
    items.wait_for(h.last_item("v"), ExecutionStatus::Success).await;

    let vis = block(&h, "v").visualization().cloned().unwrap();
    assert_eq!(vis.spec.unwrap()["data"], "sales");
    assert!(vis.updated_at.is_some());
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn closed_document_stops_serving() {
    let h = Harness::builder().open(doc(vec![Block::new_python("a", "x = 1")]));
    let document_id = h.runtime.document_id();
    assert_eq!(h.documents.len(), 1);

    let runtime = h.documents.close(document_id).await.unwrap();
    assert!(!runtime.is_running());
    assert!(h.documents.get(document_id).is_err());
    assert!(h.documents.is_empty());

    // Still a valid document for a final checkpoint.
    let json = runtime.notebook.checkpoint().unwrap();
    let restored = NotebookDocument::from_json(&json, quire_types::ReplicaId::new()).unwrap();
    assert!(restored.contains_block(&"a".into()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn new_work_wakes_an_idle_dispatcher() {
    let mut builder = Harness::builder();
    // Polling alone would never pick these up within the test's timeouts.
    builder.config.idle_poll_ms = 60_000;
    let h = builder.open(doc(vec![Block::new_python("a", "a = 1")]));

    for run in 1..=20 {
        h.runtime.queue.enqueue_block(&"a".into(), None, python()).unwrap();
        eventually(|| h.execution.calls().len() == run).await;
        h.wait_for_idle().await;
    }
    assert!(block(&h, "a").python().unwrap().last_query_time.is_some());
}
