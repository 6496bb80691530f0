//! Depth-first traversal over the project import graph.
//!
//! Expressed as a pull iterator over an explicit frame stack; each aggregate
//! descent opens a fresh traversal context with its own visited set, so a
//! project aggregated twice is visited once per aggregate context.

use std::collections::HashSet;

use crate::{ProjectId, ProjectTree};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisitOrder {
    Pre,
    Post,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Visit {
    pub project: ProjectId,
    pub in_encapsulated_lib: bool,
    /// Traversal context of the visit; 0 is the root context, each aggregate
    /// descent allocates the next one.
    pub context: u32,
}

#[derive(Debug, Clone, Copy)]
enum Stage {
    Enter,
    Exit,
}

#[derive(Debug, Clone, Copy)]
struct Frame {
    project: ProjectId,
    ctx: u32,
    in_encapsulated_lib: bool,
    stage: Stage,
}

pub struct ProjectIter<'t> {
    tree: &'t ProjectTree,
    order: VisitOrder,
    include_aggregated: bool,
    stack: Vec<Frame>,
    visited: Vec<HashSet<ProjectId>>,
}

impl<'t> ProjectIter<'t> {
    pub fn new(
        tree: &'t ProjectTree,
        root: ProjectId,
        order: VisitOrder,
        include_aggregated: bool,
    ) -> ProjectIter<'t> {
        ProjectIter {
            tree,
            order,
            include_aggregated,
            stack: vec![Frame {
                project: root,
                ctx: 0,
                in_encapsulated_lib: false,
                stage: Stage::Enter,
            }],
            visited: vec![HashSet::new()],
        }
    }

    fn push_children(&mut self, frame: Frame) {
        let project = self.tree.project(frame.project);
        let child_flag = frame.in_encapsulated_lib
            || (project.qualifier.is_library() && project.standalone_encapsulated);

        let mut children: Vec<Frame> = Vec::new();

        if let Some(parent) = project.extends {
            children.push(Frame {
                project: parent,
                ctx: frame.ctx,
                in_encapsulated_lib: child_flag,
                stage: Stage::Enter,
            });
        }
        for &imp in &project.imports {
            let target = if self.tree.project(imp).extended_by.is_some()
                && !matches!(
                    self.tree.project(imp).qualifier,
                    crate::Qualifier::Abstract
                ) {
                self.tree.ultimate_extending(imp)
            } else {
                imp
            };
            children.push(Frame {
                project: target,
                ctx: frame.ctx,
                in_encapsulated_lib: child_flag,
                stage: Stage::Enter,
            });
        }
        if self.include_aggregated && project.qualifier.is_aggregate() {
            for &agg in &project.aggregated {
                let ctx = self.visited.len() as u32;
                self.visited.push(HashSet::new());
                children.push(Frame {
                    project: agg,
                    ctx,
                    in_encapsulated_lib: child_flag,
                    stage: Stage::Enter,
                });
            }
        }

        for child in children.into_iter().rev() {
            self.stack.push(child);
        }
    }
}

impl Iterator for ProjectIter<'_> {
    type Item = Visit;

    fn next(&mut self) -> Option<Visit> {
        loop {
            let frame = self.stack.pop()?;
            let visit = Visit {
                project: frame.project,
                in_encapsulated_lib: frame.in_encapsulated_lib,
                context: frame.ctx,
            };
            match frame.stage {
                Stage::Enter => {
                    if !self.visited[frame.ctx as usize].insert(frame.project) {
                        continue;
                    }
                    match self.order {
                        VisitOrder::Pre => {
                            self.push_children(frame);
                            return Some(visit);
                        }
                        VisitOrder::Post => {
                            self.stack.push(Frame {
                                stage: Stage::Exit,
                                ..frame
                            });
                            self.push_children(frame);
                        }
                    }
                }
                Stage::Exit => return Some(visit),
            }
        }
    }
}
