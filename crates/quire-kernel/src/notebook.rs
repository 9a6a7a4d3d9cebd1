//! Shared notebook handle: one document, its lock and its flow bus.
//!
//! All reads and writes go through [`Notebook::read`] and
//! [`Notebook::update`]. `update` drains the document's recorded changes and
//! publishes them *after* releasing the write lock, so subscribers can read
//! the document from inside their handlers without deadlocking.

use std::sync::Arc;

use parking_lot::RwLock;

use quire_crdt::{DocError, NotebookDocument, RemoteUpdate};
use quire_types::{DocumentId, WorkspaceId};

use crate::flows::{FlowBus, NotebookFlow, OpSource, SharedNotebookFlowBus, Subscription};

pub type SharedNotebook = Arc<Notebook>;

pub struct Notebook {
    workspace_id: WorkspaceId,
    document_id: DocumentId,
    doc: RwLock<NotebookDocument>,
    flows: SharedNotebookFlowBus,
}

impl Notebook {
    pub fn new(
        workspace_id: WorkspaceId,
        document_id: DocumentId,
        doc: NotebookDocument,
        flow_capacity: usize,
    ) -> SharedNotebook {
        Arc::new(Self {
            workspace_id,
            document_id,
            doc: RwLock::new(doc),
            flows: Arc::new(FlowBus::new(flow_capacity)),
        })
    }

    pub fn workspace_id(&self) -> WorkspaceId {
        self.workspace_id
    }

    pub fn document_id(&self) -> DocumentId {
        self.document_id
    }

    pub fn flows(&self) -> &SharedNotebookFlowBus {
        &self.flows
    }

    pub fn subscribe(&self, pattern: &str) -> Subscription<NotebookFlow> {
        self.flows.subscribe(pattern)
    }

    pub fn read<R>(&self, f: impl FnOnce(&NotebookDocument) -> R) -> R {
        f(&self.doc.read())
    }

    /// Mutate the document and publish what changed.
    pub fn update<R>(&self, f: impl FnOnce(&mut NotebookDocument) -> R) -> R {
        let (out, changes) = {
            let mut doc = self.doc.write();
            let out = f(&mut doc);
            (out, doc.take_changes())
        };
        self.publish(changes, OpSource::Local);
        out
    }

    /// Apply a write received from another replica.
    pub fn apply_remote(&self, update: RemoteUpdate) -> Result<bool, DocError> {
        let (applied, changes) = {
            let mut doc = self.doc.write();
            let applied = doc.apply_remote(update);
            (applied, doc.take_changes())
        };
        self.publish(changes, OpSource::Remote);
        applied
    }

    fn publish(&self, changes: Vec<quire_crdt::Change>, source: OpSource) {
        for change in changes {
            self.flows.publish(NotebookFlow {
                document_id: self.document_id,
                change,
                source,
            });
        }
    }

    /// Serialize for a persistence checkpoint and mark the document pristine.
    pub fn checkpoint(&self) -> Result<String, DocError> {
        let mut doc = self.doc.write();
        let json = doc.to_json()?;
        doc.mark_pristine();
        Ok(json)
    }

    pub fn is_dirty(&self) -> bool {
        self.doc.read().is_dirty()
    }
}

impl std::fmt::Debug for Notebook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notebook")
            .field("workspace_id", &self.workspace_id)
            .field("document_id", &self.document_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quire_crdt::{Change, Stamp};
    use quire_types::{Block, ReplicaId};

    fn notebook() -> SharedNotebook {
        Notebook::new(
            WorkspaceId::new(),
            DocumentId::new(),
            NotebookDocument::default(),
            64,
        )
    }

    #[test]
    fn update_publishes_local_changes() {
        let nb = notebook();
        let mut sub = nb.subscribe("block.*");
        nb.update(|doc| doc.append_block(Block::new_python("a", "x = 1")))
            .unwrap();

        let msg = sub.try_recv().unwrap();
        assert_eq!(msg.subject, "block.inserted");
        assert!(msg.payload.is_local());
        assert_eq!(msg.payload.document_id, nb.document_id());
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn subscribers_can_read_while_handling() {
        let nb = notebook();
        let mut sub = nb.subscribe(">");
        nb.update(|doc| doc.append_block(Block::new_python("a", "x = 1")))
            .unwrap();
        while let Some(msg) = sub.try_recv() {
            if let Change::BlockInserted { block_id } = &msg.payload.change {
                assert!(nb.read(|doc| doc.contains_block(block_id)));
            }
        }
    }

    #[test]
    fn remote_changes_are_tagged_remote() {
        let nb = notebook();
        let mut sub = nb.subscribe("block.>");
        let applied = nb
            .apply_remote(RemoteUpdate::Block {
                block: Block::new_python("r", "y = 2"),
                stamp: Stamp::new(7, ReplicaId::new()),
            })
            .unwrap();
        assert!(applied);
        assert!(!sub.try_recv().unwrap().payload.is_local());
    }

    #[test]
    fn checkpoint_marks_pristine() {
        let nb = notebook();
        nb.update(|doc| doc.append_block(Block::new_python("a", "x = 1")))
            .unwrap();
        assert!(nb.is_dirty());
        let json = nb.checkpoint().unwrap();
        assert!(json.contains("\"a\""));
        assert!(!nb.is_dirty());
    }
}
