//! Document layout: block groups, each an ordered run of tabs.
//!
//! A tab references exactly one block and a block has at most one tab. The
//! document walks the layout group by group, tab by tab, to get "document
//! order" for dependency and run-all computations.

use serde::{Deserialize, Serialize};

use quire_types::{BlockId, GroupId};

use crate::error::{DocError, Result};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockGroup {
    pub id: GroupId,
    pub tabs: Vec<BlockId>,
    /// The tab currently shown; defaults to the first.
    pub current: Option<BlockId>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layout {
    groups: Vec<BlockGroup>,
}

impl Layout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn groups(&self) -> &[BlockGroup] {
        &self.groups
    }

    pub fn group(&self, id: GroupId) -> Option<&BlockGroup> {
        self.groups.iter().find(|g| g.id == id)
    }

    /// Every placed block id in document order.
    pub fn block_ids(&self) -> impl Iterator<Item = &BlockId> {
        self.groups.iter().flat_map(|g| g.tabs.iter())
    }

    pub fn contains(&self, block_id: &BlockId) -> bool {
        self.block_ids().any(|id| id == block_id)
    }

    pub fn group_of(&self, block_id: &BlockId) -> Option<GroupId> {
        self.groups
            .iter()
            .find(|g| g.tabs.contains(block_id))
            .map(|g| g.id)
    }

    /// Insert a new single-tab group at `position` (clamped to the end).
    pub(crate) fn insert_group(&mut self, position: usize, block_id: BlockId) -> Result<GroupId> {
        if self.contains(&block_id) {
            return Err(DocError::AlreadyPlaced(block_id));
        }
        let group = BlockGroup {
            id: GroupId::new(),
            current: Some(block_id.clone()),
            tabs: vec![block_id],
        };
        let id = group.id;
        let position = position.min(self.groups.len());
        self.groups.insert(position, group);
        Ok(id)
    }

    /// Append a tab to an existing group.
    pub(crate) fn add_tab(&mut self, group_id: GroupId, block_id: BlockId) -> Result<()> {
        if self.contains(&block_id) {
            return Err(DocError::AlreadyPlaced(block_id));
        }
        let group = self
            .groups
            .iter_mut()
            .find(|g| g.id == group_id)
            .ok_or(DocError::GroupNotFound(group_id))?;
        group.tabs.push(block_id);
        Ok(())
    }

    /// Drop a block's tab. Empty groups are removed with it.
    pub(crate) fn remove_block(&mut self, block_id: &BlockId) -> bool {
        let mut removed = false;
        for group in &mut self.groups {
            let before = group.tabs.len();
            group.tabs.retain(|id| id != block_id);
            if group.tabs.len() != before {
                removed = true;
                if group.current.as_ref() == Some(block_id) {
                    group.current = group.tabs.first().cloned();
                }
            }
        }
        self.groups.retain(|g| !g.tabs.is_empty());
        removed
    }
}
