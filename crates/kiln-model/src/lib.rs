use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

pub mod graph;
pub mod loader;

pub const TREE_SCHEMA_VERSION: &str = "kiln.tree@0.1.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProjectId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LanguageId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qualifier {
    Standard,
    Library,
    Abstract,
    Aggregate,
    AggregateLibrary,
}

impl Qualifier {
    pub fn is_aggregate(self) -> bool {
        matches!(self, Qualifier::Aggregate | Qualifier::AggregateLibrary)
    }

    pub fn is_library(self) -> bool {
        matches!(self, Qualifier::Library | Qualifier::AggregateLibrary)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Qualifier::Standard => "standard",
            Qualifier::Library => "library",
            Qualifier::Abstract => "abstract",
            Qualifier::Aggregate => "aggregate",
            Qualifier::AggregateLibrary => "aggregate-library",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LibraryKind {
    Static,
    Dynamic,
    Relocatable,
    StaticPic,
}

impl LibraryKind {
    /// Whether objects destined for this library must be position independent.
    pub fn needs_pic(self) -> bool {
        !matches!(self, LibraryKind::Static)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LibraryKind::Static => "static",
            LibraryKind::Dynamic => "dynamic",
            LibraryKind::Relocatable => "relocatable",
            LibraryKind::StaticPic => "static-pic",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DependencyKind {
    #[default]
    None,
    Makefile,
    UnitManifest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PathSyntax {
    #[default]
    Canonical,
    Host,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Spec,
    Impl,
    Separate,
}

impl SourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::Spec => "spec",
            SourceKind::Impl => "impl",
            SourceKind::Separate => "separate",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compilable {
    #[default]
    Unknown,
    Yes,
    No,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Casing {
    #[default]
    Lowercase,
    Uppercase,
    Mixedcase,
}

impl Casing {
    pub fn as_str(self) -> &'static str {
        match self {
            Casing::Lowercase => "lowercase",
            Casing::Uppercase => "uppercase",
            Casing::Mixedcase => "mixedcase",
        }
    }
}

/// File modification stamp. The textual rendering (`secs.nanos`) is the
/// opaque byte string persisted on the first line of switches files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FileStamp {
    secs: i64,
    nanos: u32,
}

impl FileStamp {
    pub fn of(path: &Path) -> Option<FileStamp> {
        let md = std::fs::metadata(path).ok()?;
        let mtime = md.modified().ok()?;
        match mtime.duration_since(UNIX_EPOCH) {
            Ok(d) => Some(FileStamp {
                secs: d.as_secs() as i64,
                nanos: d.subsec_nanos(),
            }),
            Err(e) => {
                let d = e.duration();
                Some(FileStamp {
                    secs: -(d.as_secs() as i64),
                    nanos: d.subsec_nanos(),
                })
            }
        }
    }

    pub fn as_line(&self) -> String {
        format!("{}.{:09}", self.secs, self.nanos)
    }
}

#[derive(Debug, Clone, Default)]
pub struct NamingData {
    pub spec_suffix: String,
    pub body_suffix: String,
    pub dot_replacement: String,
    pub casing: Casing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseFileFormat {
    #[default]
    Plain,
    Quoted,
}

#[derive(Debug, Clone)]
pub struct ResponseFileConfig {
    pub format: ResponseFileFormat,
    /// Prepended to the response-file path to form the replacement argument,
    /// e.g. `@`.
    pub switch: String,
    /// Joined argv length above which the response file is engaged.
    pub max_length: usize,
}

/// Pattern/replacement applied to the raw dep file before parsing, for
/// compilers that emit mapped path prefixes.
#[derive(Debug, Clone)]
pub struct DepRewrite {
    pub pattern: Vec<u8>,
    pub replacement: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct LanguageConfig {
    /// Compiler executable: either an absolute/relative path or a bare name
    /// resolved on PATH before the phase starts.
    pub compiler_driver: String,
    pub leading_switches: Vec<String>,
    pub trailing_switches: Vec<String>,
    pub dependency_kind: DependencyKind,
    /// Template for the dependency-generation switch. An element containing
    /// `{}` receives the dep-file path in place; an element ending in `=`
    /// receives it joined; otherwise the path is appended as its own token.
    pub dependency_option: Vec<String>,
    /// When non-empty, a post-compile dependency-builder argv template. The
    /// `{}` element receives the source path; stdout is redirected to the
    /// dep file.
    pub compute_dependency: Vec<String>,
    pub source_switch: Vec<String>,
    pub object_switch: Vec<String>,
    pub multi_unit_switch: Option<String>,
    pub include_option: Vec<String>,
    pub mapping_file_switch: Option<String>,
    pub config_file_switch: Option<String>,
    pub include_path_var: Option<String>,
    pub include_path_file_var: Option<String>,
    pub pic_options: Vec<String>,
    /// Language names whose projects contribute include directories.
    pub compatible_languages: Vec<String>,
    /// Whether body-less specs are compiled on their own. Header-style
    /// languages leave this off.
    pub compile_specs: bool,
    pub path_syntax: PathSyntax,
    pub config_spec_pattern: Option<String>,
    pub config_body_pattern: Option<String>,
    pub config_spec_file_pattern: Option<String>,
    pub config_body_file_pattern: Option<String>,
    /// Prefix stamped onto binder-generated artifacts; must be distinct
    /// across the languages of a project.
    pub binder_prefix: Option<String>,
    pub object_suffix: String,
    pub dep_suffix: String,
    pub naming: NamingData,
    pub response_files: Option<ResponseFileConfig>,
    pub dep_rewrite: Option<DepRewrite>,
}

#[derive(Debug)]
pub struct Project {
    pub name: String,
    pub qualifier: Qualifier,
    /// Project directory; configured config-file paths resolve against it.
    pub dir: PathBuf,
    pub object_dir: PathBuf,
    pub library_kind: Option<LibraryKind>,
    pub languages: Vec<LanguageId>,
    pub imports: Vec<ProjectId>,
    pub extends: Option<ProjectId>,
    pub extended_by: Option<ProjectId>,
    pub aggregated: Vec<ProjectId>,
    pub externally_built: bool,
    pub standalone_encapsulated: bool,
    pub config_checked: bool,
}

#[derive(Debug)]
pub struct Language {
    pub name: String,
    pub project: ProjectId,
    pub sources: Vec<SourceId>,
    pub config: LanguageConfig,
    pub default_switches: Vec<String>,
    pub switches_by_source: HashMap<String, Vec<String>>,
    pub global_config_file: Option<String>,
    pub local_config_file: Option<String>,
}

#[derive(Debug)]
pub struct Source {
    pub file: String,
    pub display_file: String,
    pub path: PathBuf,
    pub kind: SourceKind,
    pub unit: Option<String>,
    pub unit_spec: Option<SourceId>,
    pub unit_body: Option<SourceId>,
    /// Multi-unit index; 0 means the source holds a single unit.
    pub index: u32,
    pub language: LanguageId,
    pub project: ProjectId,
    pub object_project: ProjectId,
    pub object_path: PathBuf,
    pub dep_path: PathBuf,
    pub switches_path: PathBuf,
    pub source_stamp: Option<FileStamp>,
    pub object_stamp: Option<FileStamp>,
    pub dep_stamp: Option<FileStamp>,
    pub locally_removed: bool,
    pub in_interfaces: bool,
    pub replaced_by: Option<SourceId>,
    pub compilable: Compilable,
}

/// Basename rendering used for the file-name lookup table. Case is folded on
/// hosts whose filesystems are conventionally case-insensitive.
pub fn canonical_base(name: &str) -> String {
    if cfg!(any(windows, target_os = "macos")) {
        name.to_ascii_lowercase()
    } else {
        name.to_string()
    }
}

/// Path rendering used for the path lookup table, folded the same way as
/// `canonical_base`.
pub fn canonical_path(path: &Path) -> PathBuf {
    if cfg!(any(windows, target_os = "macos")) {
        PathBuf::from(path.to_string_lossy().to_ascii_lowercase())
    } else {
        path.to_path_buf()
    }
}

#[derive(Debug)]
pub struct ProjectTree {
    pub root: ProjectId,
    /// Builder-level switches applying to every language.
    pub builder_all_switches: Vec<String>,
    /// Builder-level switches keyed by language name.
    pub builder_switches_by_lang: HashMap<String, Vec<String>>,
    projects: Vec<Project>,
    languages: Vec<Language>,
    sources: Vec<Source>,
    by_base: HashMap<String, Vec<SourceId>>,
    by_path: HashMap<PathBuf, SourceId>,
    transitive_cache: HashMap<ProjectId, Vec<ProjectId>>,
}

impl ProjectTree {
    pub(crate) fn new(
        root: ProjectId,
        projects: Vec<Project>,
        languages: Vec<Language>,
        sources: Vec<Source>,
    ) -> ProjectTree {
        let mut by_base: HashMap<String, Vec<SourceId>> = HashMap::new();
        let mut by_path: HashMap<PathBuf, SourceId> = HashMap::new();
        for (i, src) in sources.iter().enumerate() {
            let id = SourceId(i as u32);
            by_base.entry(canonical_base(&src.file)).or_default().push(id);
            by_path.insert(canonical_path(&src.path), id);
        }
        ProjectTree {
            root,
            builder_all_switches: Vec::new(),
            builder_switches_by_lang: HashMap::new(),
            projects,
            languages,
            sources,
            by_base,
            by_path,
            transitive_cache: HashMap::new(),
        }
    }

    pub fn project(&self, id: ProjectId) -> &Project {
        &self.projects[id.0 as usize]
    }

    pub fn project_mut(&mut self, id: ProjectId) -> &mut Project {
        &mut self.projects[id.0 as usize]
    }

    pub fn language(&self, id: LanguageId) -> &Language {
        &self.languages[id.0 as usize]
    }

    pub fn source(&self, id: SourceId) -> &Source {
        &self.sources[id.0 as usize]
    }

    pub fn source_mut(&mut self, id: SourceId) -> &mut Source {
        &mut self.sources[id.0 as usize]
    }

    pub fn project_ids(&self) -> impl Iterator<Item = ProjectId> {
        (0..self.projects.len() as u32).map(ProjectId)
    }

    pub fn language_ids(&self) -> impl Iterator<Item = LanguageId> {
        (0..self.languages.len() as u32).map(LanguageId)
    }

    pub fn source_ids(&self) -> impl Iterator<Item = SourceId> {
        (0..self.sources.len() as u32).map(SourceId)
    }

    pub fn project_by_name(&self, name: &str) -> Option<ProjectId> {
        self.projects
            .iter()
            .position(|p| p.name == name)
            .map(|i| ProjectId(i as u32))
    }

    /// Last project in the extension chain starting at `id`.
    pub fn ultimate_extending(&self, id: ProjectId) -> ProjectId {
        let mut cur = id;
        while let Some(next) = self.project(cur).extended_by {
            cur = next;
        }
        cur
    }

    /// Whether `a` and `b` are the same project or related by extension in
    /// either direction.
    pub fn extension_related(&self, a: ProjectId, b: ProjectId) -> bool {
        if a == b {
            return true;
        }
        let mut cur = a;
        while let Some(next) = self.project(cur).extends {
            if next == b {
                return true;
            }
            cur = next;
        }
        let mut cur = b;
        while let Some(next) = self.project(cur).extends {
            if next == a {
                return true;
            }
            cur = next;
        }
        false
    }

    /// Look a source up by basename, chasing replacements from extending
    /// projects and skipping locally removed sources.
    pub fn source_by_base(&self, base: &str) -> Option<SourceId> {
        let candidates = self.by_base.get(&canonical_base(base))?;
        let mut found = None;
        for &id in candidates {
            let mut id = id;
            while let Some(next) = self.source(id).replaced_by {
                id = next;
            }
            if self.source(id).locally_removed {
                continue;
            }
            found = Some(id);
            break;
        }
        found
    }

    pub fn source_by_path(&self, path: &Path) -> Option<SourceId> {
        let mut id = *self.by_path.get(&canonical_path(path))?;
        while let Some(next) = self.source(id).replaced_by {
            id = next;
        }
        if self.source(id).locally_removed {
            return None;
        }
        Some(id)
    }

    /// Projects transitively imported by `id` (not including `id` itself),
    /// memoized per project.
    pub fn transitive_imports(&mut self, id: ProjectId) -> Vec<ProjectId> {
        if let Some(cached) = self.transitive_cache.get(&id) {
            return cached.clone();
        }
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        let mut work: Vec<ProjectId> = self.project(id).imports.clone();
        while let Some(p) = work.pop() {
            let p = self.ultimate_extending(p);
            if p == id || !seen.insert(p) {
                continue;
            }
            out.push(p);
            work.extend(self.project(p).imports.iter().copied());
            if let Some(parent) = self.project(p).extends {
                work.extend(self.project(parent).imports.iter().copied());
            }
        }
        self.transitive_cache.insert(id, out.clone());
        out
    }

    /// Re-read the source, object, and dep stamps of `id` from disk.
    pub fn refresh_stamps(&mut self, id: SourceId) {
        let (src_path, obj_path, dep_path) = {
            let s = self.source(id);
            (s.path.clone(), s.object_path.clone(), s.dep_path.clone())
        };
        let s = self.source_mut(id);
        s.source_stamp = FileStamp::of(&src_path);
        s.object_stamp = FileStamp::of(&obj_path);
        s.dep_stamp = FileStamp::of(&dep_path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_stamp_line_is_fixed_width_nanos() {
        let stamp = FileStamp { secs: 17, nanos: 42 };
        assert_eq!(stamp.as_line(), "17.000000042");
    }

    #[test]
    fn canonical_base_folds_only_on_case_insensitive_hosts() {
        let folded = canonical_base("Main.C");
        if cfg!(any(windows, target_os = "macos")) {
            assert_eq!(folded, "main.c");
        } else {
            assert_eq!(folded, "Main.C");
        }
    }
}
