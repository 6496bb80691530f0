//! Compile-phase driver: decides which sources need rebuilding, runs
//! compilers in parallel under a concurrency cap, post-processes their
//! dependency output, and enforces import legality across projects.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;

use kiln_model::{Compilable, LanguageId, ProjectId, ProjectTree, SourceId, SourceKind};

pub mod cmdline;
pub mod config_file;
pub mod depfile;
pub mod imports;
pub mod includes;
pub mod mapping;
pub mod queue;
pub mod response;
pub mod rewrite;
pub mod stale;
pub mod supervisor;
pub mod switches;
pub mod tempfiles;
pub mod util;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Verbosity {
    Quiet,
    #[default]
    Default,
    Verbose,
}

#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub max_parallelism: usize,
    pub keep_going: bool,
    pub check_switches: bool,
    pub always_compile: bool,
    pub indirect_imports: bool,
    pub no_split_units: bool,
    /// Enqueue sources discovered through unit manifests.
    pub closure: bool,
    pub display_progress: bool,
    pub keep_temp_files: bool,
    pub use_include_path_file: bool,
    pub verbosity: Verbosity,
    /// Compile switches from the invocation, for every language.
    pub compile_switches_all: Vec<String>,
    /// Compile switches from the invocation, per language name.
    pub compile_switches_by_lang: HashMap<String, Vec<String>>,
}

impl Default for BuildOptions {
    fn default() -> BuildOptions {
        BuildOptions {
            max_parallelism: 1,
            keep_going: false,
            check_switches: false,
            always_compile: false,
            indirect_imports: false,
            no_split_units: false,
            closure: false,
            display_progress: false,
            keep_temp_files: false,
            use_include_path_file: false,
            verbosity: Verbosity::Default,
            compile_switches_all: Vec::new(),
            compile_switches_by_lang: HashMap::new(),
        }
    }
}

/// Mutable driver state threaded through every component; nothing in the
/// phase is ambient process state except the environment variables it sets
/// (tracked in `env_vars_set` and cleared by `finish`).
pub struct BuildContext {
    pub opts: BuildOptions,
    pub temp_files: tempfiles::TempFileRegistry,
    pub mapping_pools: HashMap<LanguageId, Vec<PathBuf>>,
    pub env_vars_set: BTreeSet<String>,
    /// Compiler drivers resolved before the phase starts.
    pub drivers: HashMap<LanguageId, PathBuf>,
    /// Dependency-builder executables, resolved once per language.
    pub dep_tools: HashMap<LanguageId, PathBuf>,
    pub include_cache: Option<includes::IncludeCache>,
    pub config_files: HashMap<(ProjectId, LanguageId), Option<PathBuf>>,
}

impl BuildContext {
    pub fn new(opts: BuildOptions) -> BuildContext {
        let keep = opts.keep_temp_files;
        BuildContext {
            opts,
            temp_files: tempfiles::TempFileRegistry::new(keep),
            mapping_pools: HashMap::new(),
            env_vars_set: BTreeSet::new(),
            drivers: HashMap::new(),
            dep_tools: HashMap::new(),
            include_cache: None,
            config_files: HashMap::new(),
        }
    }

    /// Phase teardown: clear the environment variables the include-path
    /// delivery set and reclaim temp files.
    pub fn finish(&mut self) {
        for var in std::mem::take(&mut self.env_vars_set) {
            std::env::set_var(var, "");
        }
        self.temp_files.cleanup();
    }
}

/// Whether a source takes part in compilation. The verdict is cached on the
/// source, and only after its timestamp has been observed.
pub fn ensure_compilable(tree: &mut ProjectTree, id: SourceId) -> bool {
    match tree.source(id).compilable {
        Compilable::Yes => return true,
        Compilable::No => return false,
        Compilable::Unknown => {}
    }
    tree.refresh_stamps(id);
    let verdict = {
        let src = tree.source(id);
        if src.locally_removed || src.replaced_by.is_some() {
            false
        } else {
            match src.kind {
                SourceKind::Impl => true,
                SourceKind::Spec => {
                    tree.language(src.language).config.compile_specs && src.unit_body.is_none()
                }
                SourceKind::Separate => false,
            }
        }
    };
    tree.source_mut(id).compilable = if verdict { Compilable::Yes } else { Compilable::No };
    verdict
}
