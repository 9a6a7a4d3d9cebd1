//! FlowBus pub/sub for notebook change events.
//!
//! Every document mutation is published on the document's bus once the
//! document lock is released. Dispatch loops, the run-all orchestrator,
//! abort watchers and the outer broadcast/persistence layers all subscribe
//! here with NATS-style subject patterns.
//!
//! # Pattern Matching
//!
//! Patterns use dot-separated tokens with wildcards:
//! - `*` matches exactly one token: `queue.*` matches `queue.item` but not `queue.item.extra`
//! - `>` matches one or more tokens (only at end): `ai.>` matches `ai.status`
//! - Exact match: `queue.item` only matches `queue.item`
//!
//! # Subjects
//!
//! | Subject             | Change                                      |
//! |---------------------|---------------------------------------------|
//! | `block.inserted`    | block added                                 |
//! | `block.updated`     | block fields written                        |
//! | `block.removed`     | block deleted                               |
//! | `layout.changed`    | groups or tabs changed                      |
//! | `queue.enqueued`    | batch appended                              |
//! | `queue.advanced`    | head batch removed                          |
//! | `queue.updated`     | items removed from a batch                  |
//! | `queue.item`        | item status changed                         |
//! | `ai.enqueued`       | AI task appended                            |
//! | `ai.status`         | AI task status changed                      |
//! | `ai.evicted`        | finished AI tasks swept                     |
//! | `dataframes.changed`| dataframe registry changed                  |
//! | `run_all.changed`   | run-all state changed                       |

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use quire_crdt::Change;
use quire_types::DocumentId;

// ============================================================================
// Origin Tracking
// ============================================================================

/// Origin of a document change.
///
/// The broadcast layer forwards `Local` changes to other replicas and must
/// not echo `Remote` ones back.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OpSource {
    /// Made by this process (scheduler, executor, local user action).
    #[default]
    Local,
    /// Applied from another replica.
    Remote,
}

// ============================================================================
// Pattern Matching
// ============================================================================

/// Check if a subject matches a pattern.
///
/// Patterns use NATS-style wildcards:
/// - `*` matches exactly one token
/// - `>` matches one or more tokens (only at end)
pub fn matches_pattern(pattern: &str, subject: &str) -> bool {
    let pattern_tokens: Vec<&str> = pattern.split('.').collect();
    let subject_tokens: Vec<&str> = subject.split('.').collect();

    let mut pi = 0;
    let mut si = 0;

    while pi < pattern_tokens.len() && si < subject_tokens.len() {
        match pattern_tokens[pi] {
            ">" => {
                return pi == pattern_tokens.len() - 1;
            }
            "*" => {
                pi += 1;
                si += 1;
            }
            token => {
                if token != subject_tokens[si] {
                    return false;
                }
                pi += 1;
                si += 1;
            }
        }
    }

    pi == pattern_tokens.len() && si == subject_tokens.len()
}

// ============================================================================
// Flow Message Types
// ============================================================================

/// Trait for payloads that know their subject.
pub trait HasSubject {
    fn subject(&self) -> &str;
}

/// A message published to the flow bus.
#[derive(Clone, Debug)]
pub struct FlowMessage<T> {
    pub subject: String,
    pub payload: T,
    pub timestamp: Instant,
}

impl<T: HasSubject> FlowMessage<T> {
    pub fn new(payload: T) -> Self {
        let subject = payload.subject().to_string();
        Self {
            subject,
            payload,
            timestamp: Instant::now(),
        }
    }
}

// ============================================================================
// Notebook Flow Events
// ============================================================================

/// A document change, tagged with where it happened and where it came from.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NotebookFlow {
    pub document_id: DocumentId,
    pub change: Change,
    #[serde(default)]
    pub source: OpSource,
}

impl NotebookFlow {
    pub fn subject(&self) -> &'static str {
        match &self.change {
            Change::BlockInserted { .. } => "block.inserted",
            Change::BlockUpdated { .. } => "block.updated",
            Change::BlockRemoved { .. } => "block.removed",
            Change::LayoutChanged => "layout.changed",
            Change::BatchEnqueued { .. } => "queue.enqueued",
            Change::BatchAdvanced { .. } => "queue.advanced",
            Change::BatchUpdated { .. } => "queue.updated",
            Change::ItemStatus { .. } => "queue.item",
            Change::AiTaskEnqueued { .. } => "ai.enqueued",
            Change::AiTaskStatus { .. } => "ai.status",
            Change::AiTasksEvicted { .. } => "ai.evicted",
            Change::DataframesChanged => "dataframes.changed",
            Change::RunAllChanged { .. } => "run_all.changed",
        }
    }

    pub fn is_local(&self) -> bool {
        self.source == OpSource::Local
    }
}

impl HasSubject for NotebookFlow {
    fn subject(&self) -> &str {
        NotebookFlow::subject(self)
    }
}

// ============================================================================
// FlowBus
// ============================================================================

/// Type-parameterized pub/sub bus.
///
/// Uses a broadcast channel internally for multi-subscriber delivery.
/// Subscribers receive only messages matching their pattern.
#[derive(Debug)]
pub struct FlowBus<T: Clone + Send + 'static> {
    tx: broadcast::Sender<FlowMessage<T>>,
    capacity: usize,
}

impl<T: Clone + Send + 'static> FlowBus<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl<T: Clone + Send + HasSubject + 'static> FlowBus<T> {
    /// Publish a payload. Returns the number of subscribers that received it.
    pub fn publish(&self, payload: T) -> usize {
        let msg = FlowMessage::new(payload);
        self.tx.send(msg).unwrap_or(0)
    }

    /// Subscribe to messages matching a pattern.
    pub fn subscribe(&self, pattern: &str) -> Subscription<T> {
        Subscription {
            pattern: pattern.to_string(),
            rx: self.tx.subscribe(),
        }
    }
}

impl<T: Clone + Send + 'static> Clone for FlowBus<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            capacity: self.capacity,
        }
    }
}

pub type SharedNotebookFlowBus = Arc<FlowBus<NotebookFlow>>;

// ============================================================================
// Subscription
// ============================================================================

/// A subscription to a FlowBus with pattern filtering.
pub struct Subscription<T: Clone> {
    pattern: String,
    rx: broadcast::Receiver<FlowMessage<T>>,
}

impl<T: Clone> Subscription<T> {
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Receive the next matching message, waiting if necessary.
    ///
    /// Returns None if the channel is closed.
    pub async fn recv(&mut self) -> Option<FlowMessage<T>> {
        loop {
            match self.rx.recv().await {
                Ok(msg) => {
                    if matches_pattern(&self.pattern, &msg.subject) {
                        return Some(msg);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return None,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    // Consumers re-read document state on every wake-up, so
                    // dropped messages only cost latency.
                    tracing::warn!(
                        pattern = %self.pattern,
                        lagged = n,
                        "Flow subscription lagged behind"
                    );
                }
            }
        }
    }

    /// Try to receive the next matching message without blocking.
    pub fn try_recv(&mut self) -> Option<FlowMessage<T>> {
        loop {
            match self.rx.try_recv() {
                Ok(msg) => {
                    if matches_pattern(&self.pattern, &msg.subject) {
                        return Some(msg);
                    }
                }
                Err(broadcast::error::TryRecvError::Empty) => return None,
                Err(broadcast::error::TryRecvError::Closed) => return None,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    tracing::warn!(
                        pattern = %self.pattern,
                        lagged = n,
                        "Flow subscription lagged behind"
                    );
                }
            }
        }
    }
}

impl<T: Clone> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("pattern", &self.pattern)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quire_types::{BlockId, ExecutionStatus, ItemId};

    fn flow(change: Change) -> NotebookFlow {
        NotebookFlow {
            document_id: DocumentId::nil(),
            change,
            source: OpSource::Local,
        }
    }

    #[test]
    fn test_pattern_matching_exact() {
        assert!(matches_pattern("queue.item", "queue.item"));
        assert!(!matches_pattern("queue.item", "queue.advanced"));
        assert!(!matches_pattern("queue.item", "queue.item.extra"));
    }

    #[test]
    fn test_pattern_matching_single_wildcard() {
        assert!(matches_pattern("queue.*", "queue.item"));
        assert!(matches_pattern("queue.*", "queue.enqueued"));
        assert!(!matches_pattern("queue.*", "queue.item.extra"));
        assert!(!matches_pattern("queue.*", "ai.status"));
    }

    #[test]
    fn test_pattern_matching_multi_wildcard() {
        assert!(matches_pattern("ai.>", "ai.status"));
        assert!(matches_pattern("ai.>", "ai.a.b.c"));
        assert!(!matches_pattern("ai.>", "ai"));
        assert!(!matches_pattern("ai.>", "queue.item"));
    }

    #[test]
    fn test_subjects() {
        assert_eq!(
            flow(Change::ItemStatus {
                item_id: ItemId::nil(),
                block_id: BlockId::from("a"),
                status: ExecutionStatus::Running,
            })
            .subject(),
            "queue.item"
        );
        assert_eq!(flow(Change::DataframesChanged).subject(), "dataframes.changed");
        assert_eq!(flow(Change::LayoutChanged).subject(), "layout.changed");
    }

    #[tokio::test]
    async fn test_subscription_filters_by_pattern() {
        let bus = FlowBus::<NotebookFlow>::new(16);
        let mut queue_sub = bus.subscribe("queue.>");
        let mut all_sub = bus.subscribe(">");

        bus.publish(flow(Change::DataframesChanged));
        bus.publish(flow(Change::BatchAdvanced {
            batch_id: quire_types::BatchId::nil(),
        }));

        let msg = queue_sub.recv().await.unwrap();
        assert_eq!(msg.subject, "queue.advanced");
        assert!(queue_sub.try_recv().is_none());

        assert_eq!(all_sub.try_recv().unwrap().subject, "dataframes.changed");
        assert_eq!(all_sub.try_recv().unwrap().subject, "queue.advanced");
        assert_eq!(bus.subscriber_count(), 2);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = FlowBus::<NotebookFlow>::new(4);
        assert_eq!(bus.publish(flow(Change::LayoutChanged)), 0);
    }
}
