//! Loader for the resolved project tree produced by the project loader.
//!
//! The driver does not parse project description files; it consumes a JSON
//! rendition of the already-resolved tree and converts it into the arena
//! model, validating every cross-reference.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::{
    canonical_base, Casing, Compilable, DepRewrite, DependencyKind, Language, LanguageConfig,
    LanguageId, LibraryKind, NamingData, PathSyntax, Project, ProjectId, ProjectTree, Qualifier,
    ResponseFileConfig, ResponseFileFormat, Source, SourceId, SourceKind, TREE_SCHEMA_VERSION,
};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TreeDoc {
    schema_version: String,
    root: String,
    #[serde(default)]
    builder_all_switches: Vec<String>,
    #[serde(default)]
    builder_switches_by_lang: BTreeMap<String, Vec<String>>,
    projects: Vec<ProjectDoc>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProjectDoc {
    name: String,
    #[serde(default = "default_qualifier")]
    qualifier: String,
    dir: String,
    object_dir: String,
    #[serde(default)]
    library_kind: Option<String>,
    #[serde(default)]
    imports: Vec<String>,
    #[serde(default)]
    extends: Option<String>,
    #[serde(default)]
    aggregated: Vec<String>,
    #[serde(default)]
    externally_built: bool,
    #[serde(default)]
    standalone_encapsulated: bool,
    #[serde(default)]
    languages: Vec<LanguageDoc>,
}

fn default_qualifier() -> String {
    "standard".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct LanguageDoc {
    name: String,
    #[serde(default)]
    config: LanguageConfigDoc,
    #[serde(default)]
    default_switches: Vec<String>,
    #[serde(default)]
    switches_by_source: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    global_config_file: Option<String>,
    #[serde(default)]
    local_config_file: Option<String>,
    #[serde(default)]
    sources: Vec<SourceDoc>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct LanguageConfigDoc {
    compiler_driver: String,
    leading_switches: Vec<String>,
    trailing_switches: Vec<String>,
    dependency_kind: Option<String>,
    dependency_option: Vec<String>,
    compute_dependency: Vec<String>,
    source_switch: Vec<String>,
    object_switch: Vec<String>,
    multi_unit_switch: Option<String>,
    include_option: Vec<String>,
    mapping_file_switch: Option<String>,
    config_file_switch: Option<String>,
    include_path_var: Option<String>,
    include_path_file_var: Option<String>,
    pic_options: Vec<String>,
    compatible_languages: Vec<String>,
    compile_specs: bool,
    path_syntax: Option<String>,
    config_spec_pattern: Option<String>,
    config_body_pattern: Option<String>,
    config_spec_file_pattern: Option<String>,
    config_body_file_pattern: Option<String>,
    binder_prefix: Option<String>,
    object_suffix: Option<String>,
    dep_suffix: Option<String>,
    spec_suffix: Option<String>,
    body_suffix: Option<String>,
    dot_replacement: Option<String>,
    casing: Option<String>,
    response_file_format: Option<String>,
    response_file_switch: Option<String>,
    response_file_max_length: Option<usize>,
    dep_rewrite_pattern: Option<String>,
    dep_rewrite_replacement: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SourceDoc {
    file: String,
    path: String,
    kind: String,
    #[serde(default)]
    unit: Option<String>,
    #[serde(default)]
    index: u32,
    #[serde(default)]
    locally_removed: bool,
    #[serde(default = "default_true")]
    in_interfaces: bool,
}

fn default_true() -> bool {
    true
}

fn parse_qualifier(raw: &str) -> Result<Qualifier> {
    Ok(match raw {
        "standard" => Qualifier::Standard,
        "library" => Qualifier::Library,
        "abstract" => Qualifier::Abstract,
        "aggregate" => Qualifier::Aggregate,
        "aggregate-library" => Qualifier::AggregateLibrary,
        other => anyhow::bail!("unknown project qualifier {other:?}"),
    })
}

fn parse_library_kind(raw: &str) -> Result<LibraryKind> {
    Ok(match raw {
        "static" => LibraryKind::Static,
        "dynamic" => LibraryKind::Dynamic,
        "relocatable" => LibraryKind::Relocatable,
        "static-pic" => LibraryKind::StaticPic,
        other => anyhow::bail!("unknown library kind {other:?}"),
    })
}

fn parse_dependency_kind(raw: Option<&str>) -> Result<DependencyKind> {
    Ok(match raw {
        None | Some("none") => DependencyKind::None,
        Some("makefile") => DependencyKind::Makefile,
        Some("unit-manifest") => DependencyKind::UnitManifest,
        Some(other) => anyhow::bail!("unknown dependency kind {other:?}"),
    })
}

fn parse_path_syntax(raw: Option<&str>) -> Result<PathSyntax> {
    Ok(match raw {
        None | Some("canonical") => PathSyntax::Canonical,
        Some("host") => PathSyntax::Host,
        Some(other) => anyhow::bail!("unknown path syntax {other:?}"),
    })
}

fn parse_casing(raw: Option<&str>) -> Result<Casing> {
    Ok(match raw {
        None | Some("lowercase") => Casing::Lowercase,
        Some("uppercase") => Casing::Uppercase,
        Some("mixedcase") => Casing::Mixedcase,
        Some(other) => anyhow::bail!("unknown casing {other:?}"),
    })
}

fn parse_source_kind(raw: &str) -> Result<SourceKind> {
    Ok(match raw {
        "spec" => SourceKind::Spec,
        "impl" => SourceKind::Impl,
        "separate" => SourceKind::Separate,
        other => anyhow::bail!("unknown source kind {other:?}"),
    })
}

fn convert_language_config(doc: LanguageConfigDoc, lang: &str) -> Result<LanguageConfig> {
    let dependency_kind = parse_dependency_kind(doc.dependency_kind.as_deref())
        .with_context(|| format!("language {lang:?}"))?;
    let path_syntax = parse_path_syntax(doc.path_syntax.as_deref())
        .with_context(|| format!("language {lang:?}"))?;
    let casing =
        parse_casing(doc.casing.as_deref()).with_context(|| format!("language {lang:?}"))?;

    let response_files = match (doc.response_file_format.as_deref(), doc.response_file_switch) {
        (None, _) => None,
        (Some(fmt), switch) => {
            let format = match fmt {
                "plain" => ResponseFileFormat::Plain,
                "quoted" => ResponseFileFormat::Quoted,
                other => anyhow::bail!("language {lang:?}: unknown response file format {other:?}"),
            };
            Some(ResponseFileConfig {
                format,
                switch: switch.unwrap_or_else(|| "@".to_string()),
                max_length: doc.response_file_max_length.unwrap_or(4096),
            })
        }
    };

    let dep_rewrite = match (doc.dep_rewrite_pattern, doc.dep_rewrite_replacement) {
        (None, None) => None,
        (Some(pattern), replacement) => {
            if pattern.is_empty() {
                anyhow::bail!("language {lang:?}: dep_rewrite_pattern must be non-empty");
            }
            Some(DepRewrite {
                pattern: pattern.into_bytes(),
                replacement: replacement.unwrap_or_default().into_bytes(),
            })
        }
        (None, Some(_)) => {
            anyhow::bail!("language {lang:?}: dep_rewrite_replacement without dep_rewrite_pattern")
        }
    };

    Ok(LanguageConfig {
        compiler_driver: doc.compiler_driver,
        leading_switches: doc.leading_switches,
        trailing_switches: doc.trailing_switches,
        dependency_kind,
        dependency_option: doc.dependency_option,
        compute_dependency: doc.compute_dependency,
        source_switch: doc.source_switch,
        object_switch: doc.object_switch,
        multi_unit_switch: doc.multi_unit_switch,
        include_option: doc.include_option,
        mapping_file_switch: doc.mapping_file_switch,
        config_file_switch: doc.config_file_switch,
        include_path_var: doc.include_path_var,
        include_path_file_var: doc.include_path_file_var,
        pic_options: doc.pic_options,
        compatible_languages: doc.compatible_languages,
        compile_specs: doc.compile_specs,
        path_syntax,
        config_spec_pattern: doc.config_spec_pattern,
        config_body_pattern: doc.config_body_pattern,
        config_spec_file_pattern: doc.config_spec_file_pattern,
        config_body_file_pattern: doc.config_body_file_pattern,
        binder_prefix: doc.binder_prefix,
        object_suffix: doc.object_suffix.unwrap_or_else(|| ".o".to_string()),
        dep_suffix: doc.dep_suffix.unwrap_or_else(|| ".d".to_string()),
        naming: NamingData {
            spec_suffix: doc.spec_suffix.unwrap_or_default(),
            body_suffix: doc.body_suffix.unwrap_or_default(),
            dot_replacement: doc.dot_replacement.unwrap_or_else(|| "-".to_string()),
            casing,
        },
        response_files,
        dep_rewrite,
    })
}

fn source_stem(file: &str) -> &str {
    match file.rfind('.') {
        Some(0) | None => file,
        Some(dot) => &file[..dot],
    }
}

/// Object basename for a source; multi-unit members get a `~index` infix so
/// every unit of the file lands on a distinct object.
fn object_base(file: &str, index: u32, suffix: &str) -> String {
    let stem = source_stem(file);
    if index == 0 {
        format!("{stem}{suffix}")
    } else {
        format!("{stem}~{index}{suffix}")
    }
}

pub fn load_tree(path: &Path) -> Result<ProjectTree> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("[KILN_TREE_READ] read tree: {}", path.display()))?;
    let doc: TreeDoc = serde_json::from_slice(&bytes)
        .with_context(|| format!("[KILN_TREE_PARSE] parse tree JSON: {}", path.display()))?;
    tree_from_doc(doc)
}

pub fn load_tree_from_str(text: &str) -> Result<ProjectTree> {
    let doc: TreeDoc =
        serde_json::from_str(text).context("[KILN_TREE_PARSE] parse tree JSON")?;
    tree_from_doc(doc)
}

fn tree_from_doc(doc: TreeDoc) -> Result<ProjectTree> {
    if doc.schema_version.trim() != TREE_SCHEMA_VERSION {
        anyhow::bail!(
            "[KILN_TREE_SCHEMA] tree schema_version mismatch: expected {} got {:?}",
            TREE_SCHEMA_VERSION,
            doc.schema_version
        );
    }

    let mut ids_by_name: HashMap<String, ProjectId> = HashMap::new();
    for (i, p) in doc.projects.iter().enumerate() {
        if ids_by_name
            .insert(p.name.clone(), ProjectId(i as u32))
            .is_some()
        {
            anyhow::bail!("[KILN_TREE_DUP] duplicate project name {:?}", p.name);
        }
    }
    let resolve = |name: &str, what: &str| -> Result<ProjectId> {
        ids_by_name.get(name).copied().with_context(|| {
            format!("[KILN_TREE_REF] {what} references unknown project {name:?}")
        })
    };

    let root = resolve(&doc.root, "root")?;

    let mut projects: Vec<Project> = Vec::with_capacity(doc.projects.len());
    let mut languages: Vec<Language> = Vec::new();
    let mut sources: Vec<Source> = Vec::new();
    // Per project: (language id, source docs) pending source construction.
    let mut pending: Vec<(LanguageId, Vec<SourceDoc>)> = Vec::new();

    for (i, pdoc) in doc.projects.into_iter().enumerate() {
        let pid = ProjectId(i as u32);
        let qualifier = parse_qualifier(&pdoc.qualifier)
            .with_context(|| format!("project {:?}", pdoc.name))?;
        let library_kind = match &pdoc.library_kind {
            None => None,
            Some(raw) => Some(
                parse_library_kind(raw).with_context(|| format!("project {:?}", pdoc.name))?,
            ),
        };
        if qualifier.is_library() && library_kind.is_none() {
            anyhow::bail!(
                "[KILN_TREE_LIB] library project {:?} is missing library_kind",
                pdoc.name
            );
        }
        if !pdoc.aggregated.is_empty() && !qualifier.is_aggregate() {
            anyhow::bail!(
                "[KILN_TREE_AGG] project {:?} aggregates projects but is {:?}",
                pdoc.name,
                qualifier.as_str()
            );
        }

        let imports = pdoc
            .imports
            .iter()
            .map(|n| resolve(n, &format!("project {:?} imports", pdoc.name)))
            .collect::<Result<Vec<_>>>()?;
        let extends = match &pdoc.extends {
            None => None,
            Some(n) => Some(resolve(n, &format!("project {:?} extends", pdoc.name))?),
        };
        let mut aggregated = Vec::with_capacity(pdoc.aggregated.len());
        let mut seen_agg = HashSet::new();
        for n in &pdoc.aggregated {
            let id = resolve(n, &format!("project {:?} aggregates", pdoc.name))?;
            if !seen_agg.insert(id) {
                anyhow::bail!(
                    "[KILN_TREE_AGG] project {:?} aggregates {n:?} more than once",
                    pdoc.name
                );
            }
            aggregated.push(id);
        }

        let mut language_ids = Vec::with_capacity(pdoc.languages.len());
        for ldoc in pdoc.languages {
            let lid = LanguageId(languages.len() as u32);
            let name = ldoc.name.to_ascii_lowercase();
            let config = convert_language_config(ldoc.config, &name)?;
            languages.push(Language {
                name,
                project: pid,
                sources: Vec::new(),
                config,
                default_switches: ldoc.default_switches,
                switches_by_source: ldoc.switches_by_source.into_iter().collect(),
                global_config_file: ldoc.global_config_file,
                local_config_file: ldoc.local_config_file,
            });
            language_ids.push(lid);
            pending.push((lid, ldoc.sources));
        }

        projects.push(Project {
            name: pdoc.name,
            qualifier,
            dir: PathBuf::from(pdoc.dir),
            object_dir: PathBuf::from(pdoc.object_dir),
            library_kind,
            languages: language_ids,
            imports,
            extends,
            extended_by: None,
            aggregated,
            externally_built: pdoc.externally_built,
            standalone_encapsulated: pdoc.standalone_encapsulated,
            config_checked: false,
        });
    }

    link_extension_chain(&mut projects)?;

    // Build sources now that the extension chain is known, so object paths
    // land under the ultimate extender's object directory.
    for (lid, docs) in pending {
        for sdoc in docs {
            let sid = SourceId(sources.len() as u32);
            let kind = parse_source_kind(&sdoc.kind)
                .with_context(|| format!("source {:?}", sdoc.file))?;
            let pid = languages[lid.0 as usize].project;
            let object_project = ultimate_extending_of(&projects, pid);
            let cfg = &languages[lid.0 as usize].config;
            let obj_dir = projects[object_project.0 as usize].object_dir.clone();
            let object_path = obj_dir.join(object_base(&sdoc.file, sdoc.index, &cfg.object_suffix));
            let dep_path = obj_dir.join(object_base(&sdoc.file, sdoc.index, &cfg.dep_suffix));
            let switches_path = obj_dir.join(object_base(&sdoc.file, sdoc.index, ".cswi"));

            let path = PathBuf::from(&sdoc.path);
            if !path.is_absolute() {
                anyhow::bail!(
                    "[KILN_TREE_PATH] source {:?} path must be absolute, got {:?}",
                    sdoc.file,
                    sdoc.path
                );
            }

            sources.push(Source {
                display_file: sdoc.file.clone(),
                file: sdoc.file,
                path,
                kind,
                unit: sdoc.unit,
                unit_spec: None,
                unit_body: None,
                index: sdoc.index,
                language: lid,
                project: pid,
                object_project,
                object_path,
                dep_path,
                switches_path,
                source_stamp: None,
                object_stamp: None,
                dep_stamp: None,
                locally_removed: sdoc.locally_removed,
                in_interfaces: sdoc.in_interfaces,
                replaced_by: None,
                compilable: Compilable::Unknown,
            });
            languages[lid.0 as usize].sources.push(sid);
        }
    }

    link_units(&languages, &mut sources);
    link_replacements(&projects, &mut sources);

    let mut tree = ProjectTree::new(root, projects, languages, sources);
    tree.builder_all_switches = doc.builder_all_switches;
    tree.builder_switches_by_lang = doc.builder_switches_by_lang.into_iter().collect();
    Ok(tree)
}

fn ultimate_extending_of(projects: &[Project], id: ProjectId) -> ProjectId {
    let mut cur = id;
    while let Some(next) = projects[cur.0 as usize].extended_by {
        cur = next;
    }
    cur
}

fn link_extension_chain(projects: &mut [Project]) -> Result<()> {
    let n = projects.len();
    for i in 0..n {
        if let Some(parent) = projects[i].extends {
            let child = ProjectId(i as u32);
            if let Some(prev) = projects[parent.0 as usize].extended_by {
                anyhow::bail!(
                    "[KILN_TREE_EXT] project {:?} is extended by both {:?} and {:?}",
                    projects[parent.0 as usize].name,
                    projects[prev.0 as usize].name,
                    projects[i].name
                );
            }
            projects[parent.0 as usize].extended_by = Some(child);
        }
    }
    // Reject extension cycles.
    for i in 0..n {
        let mut steps = 0usize;
        let mut cur = ProjectId(i as u32);
        while let Some(next) = projects[cur.0 as usize].extends {
            cur = next;
            steps += 1;
            if steps > n {
                anyhow::bail!(
                    "[KILN_TREE_EXT] extension cycle involving project {:?}",
                    projects[i].name
                );
            }
        }
    }
    Ok(())
}

/// Wire spec/body pointers between sources declaring the same unit within one
/// language.
fn link_units(languages: &[Language], sources: &mut [Source]) {
    let mut by_unit: HashMap<(LanguageId, String), (Option<SourceId>, Option<SourceId>)> =
        HashMap::new();
    for (i, src) in sources.iter().enumerate() {
        let Some(unit) = &src.unit else { continue };
        let entry = by_unit
            .entry((src.language, unit.clone()))
            .or_insert((None, None));
        match src.kind {
            SourceKind::Spec => entry.0 = Some(SourceId(i as u32)),
            SourceKind::Impl => entry.1 = Some(SourceId(i as u32)),
            SourceKind::Separate => {}
        }
    }
    for lang in languages {
        for &sid in &lang.sources {
            let src = &sources[sid.0 as usize];
            let Some(unit) = src.unit.clone() else { continue };
            if let Some(&(spec, body)) = by_unit.get(&(src.language, unit)) {
                let src = &mut sources[sid.0 as usize];
                src.unit_spec = spec;
                src.unit_body = body;
            }
        }
    }
}

/// A source in an extending project replaces the same basename in the
/// project it extends.
fn link_replacements(projects: &[Project], sources: &mut [Source]) {
    let mut by_proj_base: HashMap<(ProjectId, String), SourceId> = HashMap::new();
    for (i, src) in sources.iter().enumerate() {
        by_proj_base.insert(
            (src.project, canonical_base(&src.file)),
            SourceId(i as u32),
        );
    }
    for i in 0..sources.len() {
        let (project, base) = {
            let s = &sources[i];
            (s.project, canonical_base(&s.file))
        };
        let mut cur = project;
        while let Some(child) = projects[cur.0 as usize].extended_by {
            if let Some(&rep) = by_proj_base.get(&(child, base.clone())) {
                sources[i].replaced_by = Some(rep);
                break;
            }
            cur = child;
        }
    }
}
