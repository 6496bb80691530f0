//! The staleness oracle: decides whether a source must be (re)compiled.
//! Every I/O problem on the way resolves to "must compile"; the oracle
//! never fails.

use kiln_model::{DependencyKind, FileStamp, ProjectTree, SourceId};

use crate::depfile::{makefile, manifest};
use crate::{util, BuildOptions};

#[derive(Debug)]
pub enum Staleness {
    UpToDate {
        /// Pre-parsed unit manifest, for closure computation downstream.
        manifest: Option<Box<manifest::UnitManifest>>,
    },
    MustCompile(StaleReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StaleReason {
    AlwaysCompile,
    ObjectMissing,
    ObjectOlderThanSource,
    DepFileMissing,
    DepFileMalformed,
    DepSourceNewer(String),
    DepSourceMissing(String),
    SwitchesDrift,
}

impl StaleReason {
    pub fn describe(&self) -> String {
        match self {
            StaleReason::AlwaysCompile => "compilation forced".to_string(),
            StaleReason::ObjectMissing => "object file does not exist".to_string(),
            StaleReason::ObjectOlderThanSource => "object file is older than source".to_string(),
            StaleReason::DepFileMissing => "dependency file does not exist".to_string(),
            StaleReason::DepFileMalformed => "dependency file cannot be parsed".to_string(),
            StaleReason::DepSourceNewer(path) => {
                format!("included source {path} is newer than dependency file")
            }
            StaleReason::DepSourceMissing(path) => {
                format!("included source {path} no longer exists")
            }
            StaleReason::SwitchesDrift => "compilation switches changed".to_string(),
        }
    }
}

/// Timestamp-and-dep-file part of the decision. The switches-file
/// comparison needs the freshly assembled command line, so the scheduler
/// layers it on top via `switches::check_switches_file` when this returns
/// `UpToDate` and the user enabled switch checking.
pub fn check(tree: &mut ProjectTree, opts: &BuildOptions, id: SourceId) -> Staleness {
    let project = tree.source(id).project;
    if tree.project(project).externally_built && !opts.always_compile {
        return Staleness::UpToDate { manifest: None };
    }
    if opts.always_compile {
        return Staleness::MustCompile(StaleReason::AlwaysCompile);
    }

    tree.refresh_stamps(id);
    let (source_stamp, object_stamp, dep_stamp) = {
        let s = tree.source(id);
        (s.source_stamp, s.object_stamp, s.dep_stamp)
    };
    let Some(object_stamp) = object_stamp else {
        return Staleness::MustCompile(StaleReason::ObjectMissing);
    };
    if let Some(source_stamp) = source_stamp {
        if object_stamp < source_stamp {
            return Staleness::MustCompile(StaleReason::ObjectOlderThanSource);
        }
    }

    let dep_kind = tree.language(tree.source(id).language).config.dependency_kind;
    match dep_kind {
        DependencyKind::None => Staleness::UpToDate { manifest: None },
        DependencyKind::Makefile => {
            let Some(dep_stamp) = dep_stamp else {
                return Staleness::MustCompile(StaleReason::DepFileMissing);
            };
            let dep_path = tree.source(id).dep_path.clone();
            let Ok(text) = std::fs::read_to_string(&dep_path) else {
                return Staleness::MustCompile(StaleReason::DepFileMissing);
            };
            let Ok(deps) = makefile::parse(&text) else {
                return Staleness::MustCompile(StaleReason::DepFileMalformed);
            };
            for prereq in &deps.prereqs {
                let path = util::normalize_dep_path(prereq);
                let Some(stamp) = FileStamp::of(&path) else {
                    return Staleness::MustCompile(StaleReason::DepSourceMissing(prereq.clone()));
                };
                if stamp > dep_stamp {
                    return Staleness::MustCompile(StaleReason::DepSourceNewer(prereq.clone()));
                }
            }
            Staleness::UpToDate { manifest: None }
        }
        DependencyKind::UnitManifest => {
            let Some(dep_stamp) = dep_stamp else {
                return Staleness::MustCompile(StaleReason::DepFileMissing);
            };
            let dep_path = tree.source(id).dep_path.clone();
            let Ok(m) = manifest::load(&dep_path) else {
                return Staleness::MustCompile(StaleReason::DepFileMalformed);
            };
            let mut bases: Vec<String> = m
                .imports
                .iter()
                .filter_map(|imp| imp.source.clone())
                .collect();
            if opts.no_split_units {
                bases.extend(m.subunits.iter().map(|sub| sub.source.clone()));
            }
            for base in bases {
                // Units the tree does not know about (runtime units) are
                // outside the staleness contract.
                let Some(dep_sid) = tree.source_by_base(&base) else {
                    continue;
                };
                let path = tree.source(dep_sid).path.clone();
                let Some(stamp) = FileStamp::of(&path) else {
                    return Staleness::MustCompile(StaleReason::DepSourceMissing(base));
                };
                if stamp > dep_stamp {
                    return Staleness::MustCompile(StaleReason::DepSourceNewer(base));
                }
            }
            Staleness::UpToDate {
                manifest: Some(Box::new(m)),
            }
        }
    }
}
