//! Change observation on top of the flow bus.
//!
//! [`ObserverHub`] lets any number of callbacks observe one subject pattern
//! through a single forwarding subscription. The forwarder is spawned when
//! the first observer registers and cancelled when the last one leaves.
//!
//! [`AbortWatch`] turns "this record now says stop" into a
//! [`CancellationToken`] that executors hand to backend calls.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use quire_crdt::NotebookDocument;

use crate::flows::NotebookFlow;
use crate::notebook::SharedNotebook;

type Callback = Arc<dyn Fn(&NotebookFlow) + Send + Sync>;

#[derive(Default)]
struct HubState {
    next_id: u64,
    callbacks: BTreeMap<u64, Callback>,
    forwarder: Option<CancellationToken>,
}

pub struct ObserverHub {
    notebook: SharedNotebook,
    pattern: String,
    state: Arc<Mutex<HubState>>,
}

impl ObserverHub {
    pub fn new(notebook: SharedNotebook, pattern: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            notebook,
            pattern: pattern.into(),
            state: Arc::new(Mutex::new(HubState::default())),
        })
    }

    /// Register a callback. It runs on the forwarder task for every matching
    /// change until the returned guard is dropped or unobserved.
    ///
    /// Must be called from within a tokio runtime.
    pub fn observe(
        self: &Arc<Self>,
        callback: impl Fn(&NotebookFlow) + Send + Sync + 'static,
    ) -> ObserverGuard {
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.callbacks.insert(id, Arc::new(callback));

        if state.forwarder.is_none() {
            let cancel = CancellationToken::new();
            state.forwarder = Some(cancel.clone());
            self.spawn_forwarder(cancel);
            tracing::debug!(pattern = %self.pattern, "observer forwarder started");
        }

        ObserverGuard {
            hub: Arc::clone(self),
            id: Some(id),
        }
    }

    pub fn observer_count(&self) -> usize {
        self.state.lock().callbacks.len()
    }

    /// Whether a forwarding subscription is live.
    pub fn is_forwarding(&self) -> bool {
        self.state.lock().forwarder.is_some()
    }

    fn spawn_forwarder(&self, cancel: CancellationToken) {
        let mut sub = self.notebook.subscribe(&self.pattern);
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    _ = cancel.cancelled() => break,
                    msg = sub.recv() => msg,
                };
                let Some(msg) = msg else { break };
                let callbacks: Vec<Callback> = state.lock().callbacks.values().cloned().collect();
                for callback in callbacks {
                    callback(&msg.payload);
                }
            }
        });
    }

    fn unobserve(&self, id: u64) {
        let mut state = self.state.lock();
        state.callbacks.remove(&id);
        if state.callbacks.is_empty()
            && let Some(cancel) = state.forwarder.take()
        {
            cancel.cancel();
            tracing::debug!(pattern = %self.pattern, "observer forwarder stopped");
        }
    }
}

/// Keeps a callback registered. Dropping it unobserves.
pub struct ObserverGuard {
    hub: Arc<ObserverHub>,
    id: Option<u64>,
}

impl ObserverGuard {
    pub fn unobserve(mut self) {
        if let Some(id) = self.id.take() {
            self.hub.unobserve(id);
        }
    }
}

impl Drop for ObserverGuard {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            self.hub.unobserve(id);
        }
    }
}

/// Cancels its token once `is_aborted` holds for the document.
///
/// The predicate is checked immediately, after every change matching
/// `pattern`, and every `poll` in case a notification was lost to lag.
pub struct AbortWatch {
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl AbortWatch {
    pub fn spawn(
        notebook: SharedNotebook,
        pattern: &str,
        poll: Duration,
        is_aborted: impl Fn(&NotebookDocument) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self::spawn_under(&CancellationToken::new(), notebook, pattern, poll, is_aborted)
    }

    /// Like [`AbortWatch::spawn`], but the token is also cancelled with `parent`.
    pub fn spawn_under(
        parent: &CancellationToken,
        notebook: SharedNotebook,
        pattern: &str,
        poll: Duration,
        is_aborted: impl Fn(&NotebookDocument) -> bool + Send + Sync + 'static,
    ) -> Self {
        let token = parent.child_token();
        // Subscribe before the first check so nothing slips between them.
        let mut sub = notebook.subscribe(pattern);
        if notebook.read(&is_aborted) {
            token.cancel();
            return Self { token, task: None };
        }

        let cancel = token.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    msg = sub.recv() => {
                        if msg.is_none() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(poll) => {}
                }
                if notebook.read(&is_aborted) {
                    cancel.cancel();
                    break;
                }
            }
        });
        Self {
            token,
            task: Some(task),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for AbortWatch {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
