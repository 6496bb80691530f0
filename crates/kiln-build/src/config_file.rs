//! Per-project compiler config files, generated once per project per run.
//! The file aggregates user-supplied global/local config content, the
//! naming-scheme pattern expansions, and per-source unit declarations.

use std::fmt::Write as _;
use std::path::PathBuf;

use anyhow::{Context, Result};
use kiln_model::{LanguageId, NamingData, ProjectId, ProjectTree, SourceKind};

use crate::BuildContext;

/// Expand `%b` (body suffix), `%s` (spec suffix), `%d` (dot replacement),
/// `%c` (casing image), `%%`.
pub fn expand_naming(pattern: &str, naming: &NamingData) -> Result<String> {
    let mut out = String::with_capacity(pattern.len());
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('b') => out.push_str(&naming.body_suffix),
            Some('s') => out.push_str(&naming.spec_suffix),
            Some('d') => out.push_str(&naming.dot_replacement),
            Some('c') => out.push_str(naming.casing.as_str()),
            Some('%') => out.push('%'),
            other => anyhow::bail!(
                "invalid naming pattern escape %{} in {:?}",
                other.map(String::from).unwrap_or_default(),
                pattern
            ),
        }
    }
    Ok(out)
}

/// Expand `%u` (unit), `%f` (file basename), `%i` (unit index), `%%`.
pub fn expand_source(pattern: &str, unit: &str, file: &str, index: u32) -> Result<String> {
    let mut out = String::with_capacity(pattern.len());
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('u') => out.push_str(unit),
            Some('f') => out.push_str(file),
            Some('i') => {
                let _ = write!(out, "{index}");
            }
            Some('%') => out.push('%'),
            other => anyhow::bail!(
                "invalid source pattern escape %{} in {:?}",
                other.map(String::from).unwrap_or_default(),
                pattern
            ),
        }
    }
    Ok(out)
}

/// The generated config file for the pair, materialized on first request.
/// `None` when the language takes no config file.
pub fn config_file_for(
    tree: &mut ProjectTree,
    ctx: &mut BuildContext,
    project: ProjectId,
    language: LanguageId,
) -> Result<Option<PathBuf>> {
    if tree.language(language).config.config_file_switch.is_none() {
        return Ok(None);
    }
    if let Some(cached) = ctx.config_files.get(&(project, language)) {
        return Ok(cached.clone());
    }

    let mut text = String::new();
    let project_dir = tree.project(project).dir.clone();
    let lang = tree.language(language);

    // User-specified content is copied verbatim; paths resolve against the
    // project directory, symlinks untouched.
    for configured in [&lang.global_config_file, &lang.local_config_file]
        .into_iter()
        .flatten()
    {
        let path = project_dir.join(configured);
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("copy config file: {}", path.display()))?;
        text.push_str(&content);
        if !content.ends_with('\n') && !content.is_empty() {
            text.push('\n');
        }
    }

    let naming = lang.config.naming.clone();
    if let Some(pattern) = &lang.config.config_spec_pattern {
        text.push_str(&expand_naming(pattern, &naming)?);
        text.push('\n');
    }
    if let Some(pattern) = &lang.config.config_body_pattern {
        text.push_str(&expand_naming(pattern, &naming)?);
        text.push('\n');
    }

    let spec_file_pattern = lang.config.config_spec_file_pattern.clone();
    let body_file_pattern = lang.config.config_body_file_pattern.clone();
    for &sid in &tree.language(language).sources {
        let src = tree.source(sid);
        let Some(unit) = &src.unit else { continue };
        let pattern = match src.kind {
            SourceKind::Spec => spec_file_pattern.as_deref(),
            SourceKind::Impl | SourceKind::Separate => body_file_pattern.as_deref(),
        };
        if let Some(pattern) = pattern {
            text.push_str(&expand_source(pattern, unit, &src.file, src.index)?);
            text.push('\n');
        }
    }

    let path = ctx.temp_files.create("kiln_conf")?;
    std::fs::write(&path, text)
        .with_context(|| format!("write generated config file: {}", path.display()))?;

    tree.project_mut(project).config_checked = true;
    ctx.config_files
        .insert((project, language), Some(path.clone()));
    Ok(Some(path))
}
