//! Dataframe registry and post-execution reconciliation.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use quire_types::{BlockId, DataFrame, DataFrameInfo};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataframeRegistry {
    entries: BTreeMap<String, DataFrame>,
}

impl DataframeRegistry {
    pub fn get(&self, name: &str) -> Option<&DataFrame> {
        self.entries.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DataFrame> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn insert(&mut self, df: DataFrame) {
        self.entries.insert(df.name.clone(), df);
    }

    pub(crate) fn remove(&mut self, name: &str) -> Option<DataFrame> {
        self.entries.remove(name)
    }

    /// Fold the dataframes the kernel reports after `block_id` ran into the
    /// registry. Returns whether anything changed.
    ///
    /// A dataframe that is no longer reported is dropped only when it has an
    /// owning block and that block is gone from the document or is the block
    /// that just ran. Dataframes owned by other live blocks are kept even if
    /// the kernel stopped reporting them, since a concurrent re-run of their
    /// owner may be about to recreate them.
    pub(crate) fn reconcile(
        &mut self,
        block_id: &BlockId,
        produced: Vec<DataFrameInfo>,
        block_exists: impl Fn(&BlockId) -> bool,
        now: u64,
    ) -> bool {
        let mut changed = false;
        let produced_names: HashSet<&str> = produced.iter().map(|df| df.name.as_str()).collect();

        let before = self.entries.len();
        self.entries.retain(|name, df| {
            if produced_names.contains(name.as_str()) {
                return true;
            }
            match &df.block_id {
                Some(owner) => owner != block_id && block_exists(owner),
                None => true,
            }
        });
        changed |= self.entries.len() != before;

        for info in produced {
            match self.entries.get_mut(&info.name) {
                None => {
                    self.entries.insert(
                        info.name.clone(),
                        DataFrame {
                            name: info.name,
                            columns: info.columns,
                            updated_at: now,
                            block_id: Some(block_id.clone()),
                        },
                    );
                    changed = true;
                }
                Some(existing) => {
                    if existing.columns != info.columns {
                        existing.columns = info.columns;
                        existing.updated_at = now;
                        changed = true;
                    }
                    // Whichever block last produced it owns it.
                    if existing.block_id.as_ref() != Some(block_id) {
                        existing.block_id = Some(block_id.clone());
                        changed = true;
                    }
                }
            }
        }

        changed
    }
}
