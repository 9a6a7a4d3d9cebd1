//! Replicated notebook document store for quire.
//!
//! [`NotebookDocument`] is the single shared structure per notebook: blocks,
//! layout, dataframe registry, run-all state, execution queue and AI task
//! queue. It is pure synchronous data; scheduling and I/O live in
//! `quire-kernel`.
//!
//! # Merge semantics
//!
//! Fields that several writers race on (block contents, queue item status,
//! AI task status, run-all state) are last-writer-wins registers stamped with
//! a Lamport clock. A late abort request from another replica therefore
//! cannot resurrect an item that already finished here.

mod ai_tasks;
mod clock;
mod dataframes;
mod dependency;
mod document;
mod error;
mod layout;
mod queue;

pub use ai_tasks::{AiTask, AiTaskQueueState, NextTask};
pub use clock::{Lww, Stamp};
pub use dataframes::DataframeRegistry;
pub use dependency::compute_dependency_queue;
pub use document::{Change, DocumentSnapshot, NotebookDocument, RemoteUpdate};
pub use error::{DocError, Result};
pub use layout::{BlockGroup, Layout};
pub use queue::{BATCH_VERSION, Batch, ExecutionQueueState, QueueItem};
