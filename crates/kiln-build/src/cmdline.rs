//! Builds the compiler argv for one source. The order of contributions is
//! fixed; `last_switches_for_file` marks the prefix that is persisted to the
//! switches file and replayed by the staleness comparison.

use std::path::PathBuf;

use anyhow::{Context, Result};
use kiln_model::{DependencyKind, LanguageId, ProjectTree, SourceId};

use crate::{config_file, includes, mapping, response, util, BuildContext};

#[derive(Debug)]
pub struct AssembledCommand {
    pub driver: PathBuf,
    /// The logical command line; what the switches file records.
    pub argv: Vec<String>,
    /// What is actually passed to the process: equals `argv` unless a
    /// response file was engaged.
    pub spawn_argv: Vec<String>,
    pub last_switches_for_file: usize,
    pub mapping_file: Option<PathBuf>,
}

/// Substitute `value` into a switch template: an element containing `{}`
/// takes it in place, a last element ending in `=` takes it joined, and
/// otherwise it is appended as its own token.
fn apply_template(out: &mut Vec<String>, template: &[String], value: &str) {
    if template.iter().any(|t| t.contains("{}")) {
        for t in template {
            out.push(t.replace("{}", value));
        }
        return;
    }
    let (last, head) = template.split_last().expect("non-empty template");
    out.extend(head.iter().cloned());
    if last.ends_with('=') {
        out.push(format!("{last}{value}"));
    } else {
        out.push(last.clone());
        out.push(value.to_string());
    }
}

/// Locate the compiler once per language; a missing driver aborts the
/// phase.
pub fn resolve_driver(
    tree: &ProjectTree,
    ctx: &mut BuildContext,
    language: LanguageId,
) -> Result<PathBuf> {
    if let Some(found) = ctx.drivers.get(&language) {
        return Ok(found.clone());
    }
    let lang = tree.language(language);
    let name = lang.config.compiler_driver.clone();
    if name.trim().is_empty() {
        anyhow::bail!(
            "no compiler driver configured for language {} of project {}",
            lang.name,
            tree.project(lang.project).name
        );
    }
    let resolved = util::locate_exec(&name).with_context(|| {
        format!(
            "compiler driver {:?} for language {} not found",
            name, lang.name
        )
    })?;
    ctx.drivers.insert(language, resolved.clone());
    Ok(resolved)
}

pub fn assemble(
    tree: &mut ProjectTree,
    ctx: &mut BuildContext,
    id: SourceId,
) -> Result<AssembledCommand> {
    let (project, language, object_project) = {
        let s = tree.source(id);
        (s.project, s.language, s.object_project)
    };
    let driver = resolve_driver(tree, ctx, language)?;

    let mut argv: Vec<String> = Vec::new();
    let cfg = tree.language(language).config.clone();
    let lang_name = tree.language(language).name.clone();

    argv.extend(cfg.leading_switches.iter().cloned());
    argv.extend(tree.builder_all_switches.iter().cloned());
    if let Some(sw) = tree.builder_switches_by_lang.get(&lang_name) {
        argv.extend(sw.iter().cloned());
    }

    {
        let obj_proj = tree.project(object_project);
        if obj_proj.qualifier.is_library()
            && obj_proj.library_kind.is_some_and(|k| k.needs_pic())
        {
            argv.extend(cfg.pic_options.iter().cloned());
        }
    }

    {
        let lang = tree.language(language);
        let file = &tree.source(id).file;
        match lang.switches_by_source.get(file) {
            Some(per_file) => argv.extend(per_file.iter().cloned()),
            None => argv.extend(lang.default_switches.iter().cloned()),
        }
    }

    argv.extend(ctx.opts.compile_switches_all.iter().cloned());
    if let Some(sw) = ctx.opts.compile_switches_by_lang.get(&lang_name) {
        argv.extend(sw.iter().cloned());
    }

    if cfg.dependency_kind != DependencyKind::None && !cfg.dependency_option.is_empty() {
        let dep_path = tree.source(id).dep_path.display().to_string();
        apply_template(&mut argv, &cfg.dependency_option, &dep_path);
    }

    match includes::prepare(tree, ctx, project, language)? {
        includes::IncludeDelivery::Switches(switches) => argv.extend(switches),
        includes::IncludeDelivery::None
        | includes::IncludeDelivery::EnvJoined { .. }
        | includes::IncludeDelivery::EnvFile { .. } => {}
    }

    if let Some(path) = config_file::config_file_for(tree, ctx, project, language)? {
        let switch = cfg.config_file_switch.as_deref().unwrap_or_default();
        argv.push(format!("{switch}{}", path.display()));
    }

    let mapping_file = mapping::acquire(tree, ctx, language)?;
    if let Some(path) = &mapping_file {
        let switch = cfg.mapping_file_switch.as_deref().unwrap_or_default();
        argv.push(format!("{switch}{}", path.display()));
    }

    let last_switches_for_file = argv.len();

    argv.extend(cfg.trailing_switches.iter().cloned());

    let rendered_source = util::render_path(&tree.source(id).path, cfg.path_syntax);
    if cfg.source_switch.is_empty() {
        argv.push(rendered_source);
    } else {
        apply_template(&mut argv, &cfg.source_switch, &rendered_source);
    }

    let index = tree.source(id).index;
    let object = tree.source(id).object_path.display().to_string();
    if !cfg.object_switch.is_empty() {
        apply_template(&mut argv, &cfg.object_switch, &object);
    } else if index != 0 {
        argv.push("-o".to_string());
        argv.push(object);
    }

    if index != 0 {
        if let Some(sw) = &cfg.multi_unit_switch {
            argv.push(format!("{sw}{index}"));
        }
    }

    let spawn_argv = match &cfg.response_files {
        Some(resp) => {
            let joined_len: usize =
                argv.iter().map(|a| a.len() + 1).sum::<usize>() + driver.as_os_str().len();
            if joined_len > resp.max_length {
                let path = response::write_response_file(resp.format, &argv, &mut ctx.temp_files)?;
                vec![format!("{}{}", resp.switch, path.display())]
            } else {
                argv.clone()
            }
        }
        None => argv.clone(),
    };

    Ok(AssembledCommand {
        driver,
        argv,
        spawn_argv,
        last_switches_for_file,
        mapping_file,
    })
}
