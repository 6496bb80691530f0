//! Mapping files: a per-compile input handing the compiler the unit-name to
//! source-path table. Paths are recycled through a per-language pool so a
//! phase creates at most `max_parallelism` of them per language.

use std::path::PathBuf;

use anyhow::{Context, Result};
use kiln_model::{LanguageId, ProjectTree, SourceId, SourceKind};

use crate::BuildContext;

/// Pop a mapping file for a compile, creating and filling a fresh one when
/// the pool is dry. `None` when the language takes no mapping file.
pub fn acquire(
    tree: &ProjectTree,
    ctx: &mut BuildContext,
    language: LanguageId,
) -> Result<Option<PathBuf>> {
    if tree.language(language).config.mapping_file_switch.is_none() {
        return Ok(None);
    }
    if let Some(path) = ctx
        .mapping_pools
        .get_mut(&language)
        .and_then(|pool| pool.pop())
    {
        return Ok(Some(path));
    }
    let path = ctx.temp_files.create("kiln_map")?;
    let content = mapping_content(tree, language);
    std::fs::write(&path, content)
        .with_context(|| format!("write mapping file: {}", path.display()))?;
    Ok(Some(path))
}

/// Return a mapping file to its language pool after the compile finished.
pub fn release(ctx: &mut BuildContext, language: LanguageId, path: Option<PathBuf>) {
    if let Some(path) = path {
        ctx.mapping_pools.entry(language).or_default().push(path);
    }
}

/// One record per unit-bearing source of the language's name, tree-wide:
/// unit name tagged with its role, then the source path.
fn mapping_content(tree: &ProjectTree, language: LanguageId) -> String {
    let lang_name = &tree.language(language).name;
    let mut out = String::new();
    let mut ids: Vec<SourceId> = tree
        .source_ids()
        .filter(|&id| {
            let src = tree.source(id);
            src.unit.is_some()
                && !src.locally_removed
                && src.replaced_by.is_none()
                && &tree.language(src.language).name == lang_name
        })
        .collect();
    ids.sort();
    for id in ids {
        let src = tree.source(id);
        let unit = src.unit.as_deref().unwrap_or_default();
        let role = match src.kind {
            SourceKind::Spec => "%s",
            SourceKind::Impl => "%b",
            SourceKind::Separate => "%b",
        };
        out.push_str(unit);
        out.push_str(role);
        out.push('\n');
        out.push_str(&src.file);
        out.push('\n');
        out.push_str(&src.path.display().to_string());
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BuildOptions;
    use kiln_model::loader::load_tree_from_str;
    use kiln_model::TREE_SCHEMA_VERSION;
    use serde_json::json;

    fn unit_tree() -> ProjectTree {
        let doc = json!({
            "schema_version": TREE_SCHEMA_VERSION,
            "root": "p",
            "projects": [{
                "name": "p", "dir": "/p", "object_dir": "/p/obj",
                "languages": [{
                    "name": "ada",
                    "config": {
                        "compiler_driver": "compiler",
                        "mapping_file_switch": "-gnatem=",
                    },
                    "sources": [
                        {"file": "u.ads", "path": "/p/u.ads", "kind": "spec", "unit": "u"},
                        {"file": "u.adb", "path": "/p/u.adb", "kind": "impl", "unit": "u"},
                    ],
                }],
            }],
        });
        load_tree_from_str(&doc.to_string()).unwrap()
    }

    #[test]
    fn acquire_recycles_released_paths() {
        let tree = unit_tree();
        let lang = tree.source(tree.source_by_base("u.adb").unwrap()).language;
        let mut ctx = BuildContext::new(BuildOptions::default());

        let first = acquire(&tree, &mut ctx, lang).unwrap().expect("mapping file");
        let text = std::fs::read_to_string(&first).unwrap();
        assert!(text.contains("u%s\n"), "got: {text}");
        assert!(text.contains("u%b\n"), "got: {text}");

        release(&mut ctx, lang, Some(first.clone()));
        let second = acquire(&tree, &mut ctx, lang).unwrap().unwrap();
        assert_eq!(first, second, "released path must be reused");
        ctx.finish();
    }
}
