//! Import legality: every dependency a compile pulls in must map to a
//! project the compiling project is allowed to see.

use std::collections::HashSet;

use kiln_model::{ProjectId, ProjectTree, SourceId};

#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    Allowed,
    /// Not directly imported; rechecked after the whole dep file is
    /// tokenized, against the closure of the recorded direct imports.
    Deferred,
    Violation(String),
}

/// Per-compile working set: the directly imported projects seen so far plus
/// the dependencies whose verdict is postponed.
pub struct LegalityChecker {
    from: ProjectId,
    visited: HashSet<ProjectId>,
    deferred: Vec<SourceId>,
}

impl LegalityChecker {
    pub fn new(from: ProjectId) -> LegalityChecker {
        LegalityChecker {
            from,
            visited: HashSet::new(),
            deferred: Vec::new(),
        }
    }

    pub fn check(
        &mut self,
        tree: &mut ProjectTree,
        dep: SourceId,
        indirect_imports: bool,
    ) -> Outcome {
        let dep_project = tree.source(dep).project;
        if tree.extension_related(self.from, dep_project) {
            return Outcome::Allowed;
        }
        if !tree.source(dep).in_interfaces {
            return Outcome::Violation(format!(
                "source {} of project {} is not part of its interfaces",
                tree.source(dep).display_file,
                tree.project(dep_project).name
            ));
        }

        let direct = tree
            .project(self.from)
            .imports
            .clone()
            .into_iter()
            .any(|imp| tree.extension_related(imp, dep_project));
        if direct {
            self.visited.insert(tree.ultimate_extending(dep_project));
            return Outcome::Allowed;
        }
        if indirect_imports {
            self.deferred.push(dep);
            return Outcome::Deferred;
        }
        Outcome::Violation(violation_text(tree, self.from, dep))
    }

    /// Recheck the deferred dependencies against the transitive closure of
    /// the directly imported projects recorded during the scan.
    pub fn finish(&mut self, tree: &mut ProjectTree) -> Vec<String> {
        let direct: Vec<ProjectId> = self.visited.iter().copied().collect();
        let mut closure: HashSet<ProjectId> = self.visited.clone();
        for base in direct {
            closure.extend(tree.transitive_imports(base));
        }
        let mut violations = Vec::new();
        for dep in self.deferred.drain(..) {
            let dep_project = tree.ultimate_extending(tree.source(dep).project);
            if !closure.contains(&dep_project) {
                violations.push(violation_text(tree, self.from, dep));
            }
        }
        violations
    }
}

fn violation_text(tree: &ProjectTree, from: ProjectId, dep: SourceId) -> String {
    format!(
        "project {} does not import project {} (source {})",
        tree.project(from).name,
        tree.project(tree.source(dep).project).name,
        tree.source(dep).display_file
    )
}
