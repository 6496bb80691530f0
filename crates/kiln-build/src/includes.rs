//! Include-path delivery. A language picks exactly one discipline: switches
//! in the argv, a directory-list file named through an environment variable,
//! or the joined list in an environment variable.

use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::{Context, Result};
use kiln_model::{LanguageId, ProjectId, ProjectTree};

use crate::{util, BuildContext};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncludeDelivery {
    None,
    Switches(Vec<String>),
    EnvJoined { var: String, value: String },
    EnvFile { var: String, path: PathBuf },
}

/// Prepared data for the (project, language) pair of the current compile;
/// rebuilt only when the pair changes.
#[derive(Debug, Clone)]
pub struct IncludeCache {
    pub project: ProjectId,
    pub language: LanguageId,
    pub delivery: IncludeDelivery,
}

/// Object directories visible to a compile of `project` in `language`: the
/// ultimate extender's own directory plus every transitively imported
/// project declaring a compatible language.
pub fn include_dirs(
    tree: &mut ProjectTree,
    project: ProjectId,
    language: LanguageId,
) -> Vec<PathBuf> {
    let mut compat: HashSet<String> = tree
        .language(language)
        .config
        .compatible_languages
        .iter()
        .map(|l| l.to_ascii_lowercase())
        .collect();
    compat.insert(tree.language(language).name.clone());

    let mut seen = HashSet::new();
    let mut dirs = Vec::new();
    let own = tree
        .project(tree.ultimate_extending(project))
        .object_dir
        .clone();
    seen.insert(own.clone());
    dirs.push(own);

    for q in tree.transitive_imports(project) {
        let declares = tree
            .project(q)
            .languages
            .iter()
            .any(|&l| compat.contains(&tree.language(l).name));
        if !declares {
            continue;
        }
        let dir = tree.project(q).object_dir.clone();
        if seen.insert(dir.clone()) {
            dirs.push(dir);
        }
    }
    dirs
}

/// Compute (or fetch cached) delivery for the pair, applying environment
/// variables as a side effect for the env disciplines.
pub fn prepare(
    tree: &mut ProjectTree,
    ctx: &mut BuildContext,
    project: ProjectId,
    language: LanguageId,
) -> Result<IncludeDelivery> {
    if let Some(cache) = &ctx.include_cache {
        if cache.project == project && cache.language == language {
            return Ok(cache.delivery.clone());
        }
    }

    let dirs = include_dirs(tree, project, language);
    let cfg = &tree.language(language).config;

    let delivery = if ctx.opts.use_include_path_file && cfg.include_path_file_var.is_some() {
        let var = cfg.include_path_file_var.clone().unwrap();
        env_file_delivery(ctx, var, &dirs)?
    } else if !cfg.include_option.is_empty() {
        let option = cfg.include_option.clone();
        let mut switches = Vec::new();
        for dir in &dirs {
            // All but the last template element pass through; the last is
            // joined with the directory.
            for head in &option[..option.len() - 1] {
                switches.push(head.clone());
            }
            switches.push(format!(
                "{}{}",
                option.last().unwrap(),
                dir.display()
            ));
        }
        IncludeDelivery::Switches(switches)
    } else if let Some(var) = cfg.include_path_file_var.clone() {
        env_file_delivery(ctx, var, &dirs)?
    } else if let Some(var) = cfg.include_path_var.clone() {
        let sep = util::path_list_separator();
        let value = dirs
            .iter()
            .map(|d| d.display().to_string())
            .collect::<Vec<_>>()
            .join(&sep.to_string());
        std::env::set_var(&var, &value);
        ctx.env_vars_set.insert(var.clone());
        IncludeDelivery::EnvJoined { var, value }
    } else {
        IncludeDelivery::None
    };

    ctx.include_cache = Some(IncludeCache {
        project,
        language,
        delivery: delivery.clone(),
    });
    Ok(delivery)
}

fn env_file_delivery(
    ctx: &mut BuildContext,
    var: String,
    dirs: &[PathBuf],
) -> Result<IncludeDelivery> {
    let path = ctx.temp_files.create("kiln_incpath")?;
    let mut text = String::new();
    for dir in dirs {
        text.push_str(&dir.display().to_string());
        text.push('\n');
    }
    std::fs::write(&path, text)
        .with_context(|| format!("write include path file: {}", path.display()))?;
    std::env::set_var(&var, &path);
    ctx.env_vars_set.insert(var.clone());
    Ok(IncludeDelivery::EnvFile { var, path })
}
