//! Dependency queue: which upstream blocks must re-run before a target.
//!
//! Notebooks are linear, so "upstream" means "earlier in document order".
//! An upstream executable block is included when it has never run, ran
//! before the execution environment started, ran before some block above it
//! last ran, or has been edited since it ran. Once one block is included,
//! every executable block after it is included too: the included block will
//! run after anything that has already run below it.

use quire_types::{Block, BlockId};

use crate::layout::Layout;

/// Ordered list of upstream blocks that must run before `target`.
///
/// `environment_started_at` is when the execution backend last (re)started;
/// `None` means no environment is running, so every upstream block is
/// included. Returns an empty list when `target` is not in the layout.
pub fn compute_dependency_queue<'a>(
    target: &BlockId,
    layout: &Layout,
    lookup: impl Fn(&BlockId) -> Option<&'a Block>,
    force_all: bool,
    environment_started_at: Option<u64>,
) -> Vec<&'a Block> {
    if !layout.contains(target) {
        return Vec::new();
    }

    let mut queue = Vec::new();
    let mut ran_after = environment_started_at.unwrap_or(0);
    let mut cascading = force_all || environment_started_at.is_none();

    for id in layout.block_ids() {
        if id == target {
            break;
        }
        let Some(block) = lookup(id) else {
            continue;
        };
        if !block.is_executable() {
            continue;
        }

        let stale = match block.executed_at() {
            None => true,
            Some(at) => at < ran_after,
        };
        if cascading || stale || block.is_dirty() {
            queue.push(block);
            cascading = true;
        } else if let Some(at) = block.executed_at() {
            ran_after = ran_after.max(at);
        }
    }

    queue
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    struct Fixture {
        layout: Layout,
        blocks: BTreeMap<BlockId, Block>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                layout: Layout::new(),
                blocks: BTreeMap::new(),
            }
        }

        fn push(&mut self, block: Block) {
            let pos = self.layout.groups().len();
            self.layout.insert_group(pos, block.id.clone()).unwrap();
            self.blocks.insert(block.id.clone(), block);
        }

        fn python(&mut self, id: &str, ran_at: Option<u64>) {
            let mut block = Block::new_python(id, format!("{id} = 1"));
            if let Some(at) = ran_at {
                let py = block.python_mut().unwrap();
                py.last_query = Some(py.source.clone());
                py.last_query_time = Some(at);
            }
            self.push(block);
        }

        fn queue(&self, target: &str, force_all: bool, env: Option<u64>) -> Vec<String> {
            compute_dependency_queue(
                &target.into(),
                &self.layout,
                |id| self.blocks.get(id),
                force_all,
                env,
            )
            .into_iter()
            .map(|b| b.id.to_string())
            .collect()
        }
    }

    #[test]
    fn fresh_upstream_blocks_are_skipped() {
        let mut f = Fixture::new();
        f.python("a", Some(10));
        f.python("b", Some(20));
        f.python("target", None);
        assert!(f.queue("target", false, Some(5)).is_empty());
    }

    #[test]
    fn never_run_blocks_are_included() {
        let mut f = Fixture::new();
        f.python("a", Some(10));
        f.python("b", None);
        f.python("target", None);
        assert_eq!(f.queue("target", false, Some(5)), vec!["b"]);
    }

    #[test]
    fn blocks_run_before_environment_start_are_included() {
        let mut f = Fixture::new();
        f.python("a", Some(10));
        f.python("b", Some(20));
        f.python("target", None);
        assert_eq!(f.queue("target", false, Some(15)), vec!["a", "b"]);
    }

    #[test]
    fn stale_relative_to_upstream_block() {
        // "b" ran before "a" was last re-run, so it saw old state.
        let mut f = Fixture::new();
        f.python("a", Some(30));
        f.python("b", Some(20));
        f.python("c", Some(40));
        f.python("target", None);
        assert_eq!(f.queue("target", false, Some(5)), vec!["b", "c"]);
    }

    #[test]
    fn inclusion_cascades_downstream() {
        let mut f = Fixture::new();
        f.python("a", Some(10));
        f.python("b", Some(20));
        f.python("c", Some(30));
        f.python("target", None);
        f.blocks.get_mut(&BlockId::from("b")).unwrap().python_mut().unwrap().source = "b = 2".into();

        assert_eq!(f.queue("target", false, Some(5)), vec!["b", "c"]);
    }

    #[test]
    fn non_executable_and_downstream_blocks_are_ignored() {
        let mut f = Fixture::new();
        f.push(Block::new_rich_text("notes", "hello"));
        f.python("a", None);
        f.python("target", None);
        f.python("after", None);
        assert_eq!(f.queue("target", false, Some(5)), vec!["a"]);
    }

    #[test]
    fn force_all_and_missing_environment_include_everything() {
        let mut f = Fixture::new();
        f.python("a", Some(10));
        f.python("b", Some(20));
        f.python("target", None);
        assert_eq!(f.queue("target", true, Some(5)), vec!["a", "b"]);
        assert_eq!(f.queue("target", false, None), vec!["a", "b"]);
    }

    #[test]
    fn unknown_target_yields_empty_queue() {
        let mut f = Fixture::new();
        f.python("a", None);
        assert!(f.queue("missing", false, Some(5)).is_empty());
    }
}
