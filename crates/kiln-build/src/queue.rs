//! FIFO of pending compilations with object-directory serialization.

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};

use kiln_model::{ProjectTree, SourceId};

use crate::depfile::manifest::UnitManifest;
use crate::ensure_compilable;

#[derive(Debug, Default)]
pub struct SourceQueue {
    entries: VecDeque<SourceId>,
    queued: HashSet<SourceId>,
    busy_dirs: HashSet<PathBuf>,
    total_enqueued: usize,
}

fn object_dir(tree: &ProjectTree, id: SourceId) -> PathBuf {
    tree.project(tree.source(id).object_project)
        .object_dir
        .clone()
}

impl SourceQueue {
    pub fn new() -> SourceQueue {
        SourceQueue::default()
    }

    /// Enqueue a source; each source enters the queue at most once per
    /// phase. Returns whether it was inserted.
    pub fn insert(&mut self, source: SourceId) -> bool {
        if !self.queued.insert(source) {
            return false;
        }
        self.entries.push_back(source);
        self.total_enqueued += 1;
        true
    }

    /// Next entry, in insertion order, whose object directory is not busy.
    /// The returned source's object directory is marked busy.
    pub fn extract(&mut self, tree: &ProjectTree) -> Option<SourceId> {
        let pos = self
            .entries
            .iter()
            .position(|&id| !self.busy_dirs.contains(&object_dir(tree, id)))?;
        let id = self.entries.remove(pos).expect("position in bounds");
        self.busy_dirs.insert(object_dir(tree, id));
        Some(id)
    }

    pub fn mark_free(&mut self, dir: &Path) {
        self.busy_dirs.remove(dir);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True when nothing can be extracted right now: every remaining entry
    /// blocks on a busy object directory (vacuously true when empty).
    pub fn is_virtually_empty(&self, tree: &ProjectTree) -> bool {
        self.entries
            .iter()
            .all(|&id| self.busy_dirs.contains(&object_dir(tree, id)))
    }

    pub fn total_enqueued(&self) -> usize {
        self.total_enqueued
    }

    pub fn busy_dirs(&self) -> &HashSet<PathBuf> {
        &self.busy_dirs
    }

    /// Enqueue the compilable sources a unit manifest makes reachable:
    /// every imported unit, and subunit parents when split units are
    /// disallowed. Returns the number of newly queued sources.
    pub fn insert_transitive_dependencies(
        &mut self,
        tree: &mut ProjectTree,
        manifest: &UnitManifest,
        no_split_units: bool,
    ) -> usize {
        let mut added = 0;
        let consider = |queue: &mut SourceQueue, tree: &mut ProjectTree, base: &str| {
            let Some(found) = tree.source_by_base(base) else {
                return 0;
            };
            // Compile the unit's implementation when the record names its
            // spec.
            let target = tree.source(found).unit_body.unwrap_or(found);
            if ensure_compilable(tree, target) && queue.insert(target) {
                1
            } else {
                0
            }
        };
        for imp in &manifest.imports {
            if let Some(base) = &imp.source {
                added += consider(self, tree, base);
            }
        }
        if no_split_units {
            for sub in &manifest.subunits {
                added += consider(self, tree, &sub.source);
            }
        }
        added
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_model::loader::load_tree_from_str;
    use kiln_model::TREE_SCHEMA_VERSION;
    use serde_json::json;

    fn two_project_tree() -> ProjectTree {
        let doc = json!({
            "schema_version": TREE_SCHEMA_VERSION,
            "root": "p",
            "projects": [
                {
                    "name": "q", "dir": "/q", "object_dir": "/q/obj",
                    "languages": [{
                        "name": "c",
                        "config": {"compiler_driver": "cc"},
                        "sources": [
                            {"file": "q1.c", "path": "/q/q1.c", "kind": "impl"},
                        ],
                    }],
                },
                {
                    "name": "p", "dir": "/p", "object_dir": "/p/obj",
                    "imports": ["q"],
                    "languages": [{
                        "name": "c",
                        "config": {"compiler_driver": "cc"},
                        "sources": [
                            {"file": "a.c", "path": "/p/a.c", "kind": "impl"},
                            {"file": "b.c", "path": "/p/b.c", "kind": "impl"},
                        ],
                    }],
                },
            ],
        });
        load_tree_from_str(&doc.to_string()).unwrap()
    }

    #[test]
    fn extract_skips_busy_object_dirs_and_preserves_order() {
        let tree = two_project_tree();
        let a = tree.source_by_base("a.c").unwrap();
        let b = tree.source_by_base("b.c").unwrap();
        let q1 = tree.source_by_base("q1.c").unwrap();

        let mut queue = SourceQueue::new();
        assert!(queue.insert(a));
        assert!(queue.insert(b));
        assert!(queue.insert(q1));
        assert!(!queue.insert(a), "duplicate insert must be rejected");

        // a and b share /p/obj: after extracting a, b is blocked but q1 in
        // /q/obj is still available.
        assert_eq!(queue.extract(&tree), Some(a));
        assert_eq!(queue.extract(&tree), Some(q1));
        assert_eq!(queue.extract(&tree), None);
        assert!(!queue.is_empty());
        assert!(queue.is_virtually_empty(&tree));

        queue.mark_free(Path::new("/p/obj"));
        assert_eq!(queue.extract(&tree), Some(b));
        assert!(queue.is_empty());
    }
}
