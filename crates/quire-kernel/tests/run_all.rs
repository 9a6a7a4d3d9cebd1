//! Run-all orchestration end to end.

mod common;

use common::{Gate, Harness, Script, eventually};
use quire_crdt::NotebookDocument;
use quire_kernel::BackendError;
use quire_types::{Block, RunAll, RunAllStatus};

fn notebook() -> NotebookDocument {
    let mut doc = NotebookDocument::default();
    doc.append_block(Block::new_python("a", "a()")).unwrap();
    doc.append_block(Block::new_rich_text("notes", "# Notes")).unwrap();
    doc.append_block(Block::new_python("b", "b()")).unwrap();
    doc.append_block(Block::new_python("c", "c()")).unwrap();
    doc
}

fn run_all(h: &Harness) -> RunAll {
    h.runtime.notebook.read(|doc| doc.run_all())
}

#[tokio::test]
async fn requested_run_executes_every_block_in_order() {
    let h = Harness::builder().open(notebook());

    assert!(h.runtime.queue.request_run_all());
    assert!(!h.runtime.queue.request_run_all());
    eventually(|| run_all(&h).status == RunAllStatus::Idle).await;

    assert_eq!(h.execution.sources(), ["a()", "b()", "c()"]);
    assert_eq!(
        run_all(&h),
        RunAll {
            status: RunAllStatus::Idle,
            remaining: 3,
            total: 3,
        }
    );
    h.wait_for_idle().await;
}

#[tokio::test]
async fn remaining_counts_down_while_running() {
    let gate = Gate::new();
    let builder = Harness::builder();
    builder.execution.script("b()", Script::gated(Vec::new(), &gate));
    let h = builder.open(notebook());

    assert!(h.runtime.queue.request_run_all());
    eventually(|| {
        let state = run_all(&h);
        state.status == RunAllStatus::Running && state.remaining == 2
    })
    .await;
    assert_eq!(run_all(&h).total, 3);

    gate.release(1);
    eventually(|| run_all(&h).status == RunAllStatus::Idle).await;
}

#[tokio::test]
async fn failing_block_ends_the_run() {
    let builder = Harness::builder();
    builder.execution.script(
        "a()",
        Script::failing(BackendError::Failed("NameError".into())),
    );
    let h = builder.open(notebook());

    assert!(h.runtime.queue.request_run_all());
    eventually(|| h.execution.calls().len() == 1).await;
    eventually(|| run_all(&h).status == RunAllStatus::Idle).await;
    h.wait_for_idle().await;

    assert_eq!(h.execution.sources(), ["a()"]);
}

#[tokio::test]
async fn abort_stops_the_rest_of_the_run() {
    let gate = Gate::new();
    let builder = Harness::builder();
    builder.execution.script("a()", Script::gated(Vec::new(), &gate));
    let h = builder.open(notebook());

    assert!(h.runtime.queue.request_run_all());
    eventually(|| h.execution.calls().len() == 1).await;

    assert!(h.runtime.queue.request_run_all_abort());
    eventually(|| run_all(&h).status == RunAllStatus::Idle).await;
    h.wait_for_idle().await;

    assert_eq!(h.execution.sources(), ["a()"]);
    let a = h
        .runtime
        .notebook
        .read(|doc| doc.block(&"a".into()).and_then(|b| b.python()).cloned())
        .unwrap();
    assert!(a.last_query.is_none());
    assert!(!h.runtime.queue.request_run_all_abort());
}

#[tokio::test]
async fn scheduled_run_is_tracked_to_completion() {
    let h = Harness::builder().open(notebook());

    let batch = h.runtime.queue.run_scheduled(None).unwrap();
    assert!(batch.is_some());
    assert!(!h.runtime.queue.request_run_all());
    assert!(h.runtime.queue.run_scheduled(None).unwrap().is_none());

    eventually(|| run_all(&h).status == RunAllStatus::Idle).await;
    assert_eq!(h.execution.sources(), ["a()", "b()", "c()"]);
}

#[tokio::test]
async fn empty_notebook_run_returns_to_idle() {
    let mut doc = NotebookDocument::default();
    doc.append_block(Block::new_rich_text("notes", "nothing to run"))
        .unwrap();
    let h = Harness::builder().open(doc);

    assert!(h.runtime.queue.request_run_all());
    eventually(|| run_all(&h).status == RunAllStatus::Idle).await;
    assert!(h.execution.calls().is_empty());
    assert_eq!(run_all(&h).total, 0);
}
