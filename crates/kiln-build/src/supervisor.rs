//! Single-threaded compile scheduler. Parallelism is exclusively across
//! child compiler processes; all driver state is owned here.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use anyhow::{Context, Result};
use kiln_model::graph::{ProjectIter, VisitOrder};
use kiln_model::{DependencyKind, LanguageId, ProjectId, ProjectTree, SourceId};

use crate::depfile::{makefile, manifest};
use crate::imports::{LegalityChecker, Outcome};
use crate::queue::SourceQueue;
use crate::stale::{self, StaleReason, Staleness};
use crate::{
    cmdline, ensure_compilable, mapping, rewrite, switches, util, BuildContext, Verbosity,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Purpose {
    Compilation,
    DependencyExtraction,
}

struct InFlight {
    child: Child,
    source: SourceId,
    project: ProjectId,
    language: LanguageId,
    purpose: Purpose,
    argv: Vec<String>,
    last_switches_for_file: usize,
    mapping_file: Option<PathBuf>,
}

#[derive(Debug)]
pub struct BadCompilation {
    pub source: SourceId,
    pub file: String,
    pub project: String,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct PhaseReport {
    pub compiled: usize,
    pub up_to_date: usize,
    pub failed: Vec<BadCompilation>,
}

impl PhaseReport {
    pub fn ok(&self) -> bool {
        self.failed.is_empty()
    }
}

enum PostDeps {
    Clean(Option<Box<manifest::UnitManifest>>),
    Malformed(String),
    Illegal(String),
}

pub fn run_compile_phase(tree: &mut ProjectTree, ctx: &mut BuildContext) -> Result<PhaseReport> {
    let mut sup = Supervisor {
        tree: &mut *tree,
        ctx: &mut *ctx,
        queue: SourceQueue::new(),
        running: Vec::new(),
        report: PhaseReport::default(),
    };
    sup.prepare()?;
    sup.run()?;
    let report = sup.report;
    ctx.finish();
    Ok(report)
}

struct Supervisor<'a> {
    tree: &'a mut ProjectTree,
    ctx: &'a mut BuildContext,
    queue: SourceQueue,
    running: Vec<InFlight>,
    report: PhaseReport,
}

impl Supervisor<'_> {
    /// Populate the queue, run the pre-phase checks, and resolve every
    /// compiler driver the phase will need.
    fn prepare(&mut self) -> Result<()> {
        let visits: Vec<ProjectId> =
            ProjectIter::new(self.tree, self.tree.root, VisitOrder::Pre, true)
                .map(|v| v.project)
                .collect();

        self.check_binder_prefixes(&visits)?;

        let mut queued_languages: Vec<LanguageId> = Vec::new();
        for project in visits {
            // Closure mode seeds from the root; imported sources enter the
            // queue through unit manifests.
            if self.ctx.opts.closure && project != self.tree.root {
                continue;
            }
            let languages = self.tree.project(project).languages.clone();
            for language in languages {
                let sources = self.tree.language(language).sources.clone();
                let mut any = false;
                for source in sources {
                    if ensure_compilable(self.tree, source) && self.queue.insert(source) {
                        any = true;
                    }
                }
                if any {
                    queued_languages.push(language);
                }
            }
        }

        for language in queued_languages {
            let project = self.tree.language(language).project;
            if self.tree.project(project).externally_built && !self.ctx.opts.always_compile {
                continue;
            }
            cmdline::resolve_driver(self.tree, self.ctx, language)?;
        }
        Ok(())
    }

    fn check_binder_prefixes(&self, visits: &[ProjectId]) -> Result<()> {
        for &project in visits {
            let mut seen: HashMap<String, String> = HashMap::new();
            for &language in &self.tree.project(project).languages {
                let lang = self.tree.language(language);
                let Some(prefix) = &lang.config.binder_prefix else {
                    continue;
                };
                if prefix.is_empty() {
                    continue;
                }
                if let Some(other) = seen.insert(prefix.clone(), lang.name.clone()) {
                    anyhow::bail!(
                        "binding prefix {:?} is the same for languages {} and {} in project {}",
                        prefix,
                        other,
                        lang.name,
                        self.tree.project(project).name
                    );
                }
            }
        }
        Ok(())
    }

    fn run(&mut self) -> Result<()> {
        while !(self.queue.is_empty() && self.running.is_empty()) {
            if self.must_exit_because_of_error()? {
                break;
            }
            self.start_compile_if_possible()?;
            self.wait_for_available_slot()?;
        }
        Ok(())
    }

    fn must_exit_because_of_error(&mut self) -> Result<bool> {
        if self.report.failed.is_empty() || self.ctx.opts.keep_going {
            return Ok(false);
        }
        self.drain_outstanding()?;
        Ok(true)
    }

    /// Fail-fast wind-down: wait for every outstanding child, record
    /// failures, skip legality checking.
    fn drain_outstanding(&mut self) -> Result<()> {
        while let Some(mut inf) = self.running.pop() {
            let status = inf.child.wait().context("wait for outstanding compiler")?;
            if status.success() {
                self.finalize_success(inf, false)?;
            } else {
                let reason = describe_exit(&status);
                self.record_failure(inf, format!("compiler {reason}"));
            }
        }
        Ok(())
    }

    fn start_compile_if_possible(&mut self) -> Result<()> {
        if self.running.len() >= self.ctx.opts.max_parallelism {
            return Ok(());
        }
        let Some(id) = self.queue.extract(self.tree) else {
            return Ok(());
        };

        match stale::check(self.tree, &self.ctx.opts, id) {
            Staleness::MustCompile(reason) => {
                self.say_recompiling(id, &reason);
                let cmd = cmdline::assemble(self.tree, self.ctx, id)?;
                self.spawn_compile(id, cmd)?;
            }
            Staleness::UpToDate { manifest } => {
                let externally_built =
                    self.tree.project(self.tree.source(id).project).externally_built;
                if self.ctx.opts.check_switches && !externally_built {
                    let cmd = cmdline::assemble(self.tree, self.ctx, id)?;
                    let (switches_path, stamp_line, trailing) = {
                        let src = self.tree.source(id);
                        let trailing = self
                            .tree
                            .language(src.language)
                            .config
                            .trailing_switches
                            .clone();
                        (
                            src.switches_path.clone(),
                            src.object_stamp.map(|s| s.as_line()).unwrap_or_default(),
                            trailing,
                        )
                    };
                    let unchanged = switches::check_switches_file(
                        &switches_path,
                        &stamp_line,
                        &cmd.argv[..cmd.last_switches_for_file],
                        &trailing,
                    );
                    if !unchanged {
                        self.say_recompiling(id, &StaleReason::SwitchesDrift);
                        self.spawn_compile(id, cmd)?;
                        return Ok(());
                    }
                    let language = self.tree.source(id).language;
                    mapping::release(self.ctx, language, cmd.mapping_file);
                }
                self.complete_up_to_date(id, manifest);
            }
        }
        Ok(())
    }

    fn complete_up_to_date(&mut self, id: SourceId, manifest: Option<Box<manifest::UnitManifest>>) {
        if self.ctx.opts.closure {
            if let Some(m) = &manifest {
                self.queue
                    .insert_transitive_dependencies(self.tree, m, self.ctx.opts.no_split_units);
            }
        }
        let dir = self.object_dir(id);
        self.queue.mark_free(&dir);
        self.report.up_to_date += 1;
        self.display_progress();
    }

    fn spawn_compile(&mut self, id: SourceId, cmd: cmdline::AssembledCommand) -> Result<()> {
        let dir = self.object_dir(id);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("create object directory: {}", dir.display()))?;

        if self.ctx.opts.verbosity > Verbosity::Quiet {
            println!(
                "{} {}",
                cmd.driver.display(),
                cmd.spawn_argv.join(" ")
            );
        }

        let child = Command::new(&cmd.driver)
            .args(&cmd.spawn_argv)
            .current_dir(&dir)
            .spawn()
            .with_context(|| format!("spawn compiler: {}", cmd.driver.display()))?;

        let (project, language) = {
            let s = self.tree.source(id);
            (s.project, s.language)
        };
        self.running.push(InFlight {
            child,
            source: id,
            project,
            language,
            purpose: Purpose::Compilation,
            argv: cmd.argv,
            last_switches_for_file: cmd.last_switches_for_file,
            mapping_file: cmd.mapping_file,
        });
        Ok(())
    }

    /// Block until one child can be reaped, when every slot is taken or the
    /// queue cannot make progress while compiles are pending.
    fn wait_for_available_slot(&mut self) -> Result<()> {
        let slots_full = self.running.len() >= self.ctx.opts.max_parallelism;
        let queue_blocked =
            !self.running.is_empty() && self.queue.is_virtually_empty(self.tree);
        if !slots_full && !queue_blocked {
            return Ok(());
        }
        let (idx, status) = self.reap_one()?;
        let inf = self.running.swap_remove(idx);
        self.post_process(inf, status)
    }

    fn reap_one(&mut self) -> Result<(usize, std::process::ExitStatus)> {
        loop {
            for (idx, inf) in self.running.iter_mut().enumerate() {
                if let Some(status) = inf.child.try_wait().context("poll compiler")? {
                    return Ok((idx, status));
                }
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn post_process(&mut self, inf: InFlight, status: std::process::ExitStatus) -> Result<()> {
        match inf.purpose {
            Purpose::Compilation => {
                if !status.success() {
                    let reason = describe_exit(&status);
                    self.record_failure(inf, format!("compiler {reason}"));
                    return Ok(());
                }
                let compute = self
                    .tree
                    .language(inf.language)
                    .config
                    .compute_dependency
                    .clone();
                if !compute.is_empty() {
                    return self.spawn_dep_extraction(inf, &compute);
                }
                self.finalize_success(inf, true)
            }
            Purpose::DependencyExtraction => {
                if !status.success() {
                    let reason = describe_exit(&status);
                    self.record_failure(inf, format!("dependency extraction {reason}"));
                    return Ok(());
                }
                self.finalize_success(inf, true)
            }
        }
    }

    /// Re-occupy the reaped slot with the external dependency builder,
    /// stdout redirected to the dep file. The object directory stays busy.
    fn spawn_dep_extraction(&mut self, inf: InFlight, compute: &[String]) -> Result<()> {
        let tool = match self.ctx.dep_tools.get(&inf.language) {
            Some(tool) => tool.clone(),
            None => {
                let resolved = util::locate_exec(&compute[0]).with_context(|| {
                    format!("dependency extractor {:?} not found", compute[0])
                })?;
                self.ctx.dep_tools.insert(inf.language, resolved.clone());
                resolved
            }
        };
        let (src_path, dep_path) = {
            let s = self.tree.source(inf.source);
            (s.path.display().to_string(), s.dep_path.clone())
        };
        let args: Vec<String> = compute[1..]
            .iter()
            .map(|a| a.replace("{}", &src_path))
            .collect();
        let dep_file = std::fs::File::create(&dep_path)
            .with_context(|| format!("create dep file: {}", dep_path.display()))?;
        let dir = self.object_dir(inf.source);
        let child = Command::new(&tool)
            .args(&args)
            .current_dir(&dir)
            .stdout(Stdio::from(dep_file))
            .spawn()
            .with_context(|| format!("spawn dependency extractor: {}", tool.display()))?;
        self.running.push(InFlight {
            child,
            purpose: Purpose::DependencyExtraction,
            ..inf
        });
        Ok(())
    }

    fn finalize_success(&mut self, inf: InFlight, check_legality: bool) -> Result<()> {
        let (dep_path, object_path, switches_path) = {
            let s = self.tree.source(inf.source);
            (
                s.dep_path.clone(),
                s.object_path.clone(),
                s.switches_path.clone(),
            )
        };
        let (dep_kind, dep_rewrite, trailing) = {
            let cfg = &self.tree.language(inf.language).config;
            (
                cfg.dependency_kind,
                cfg.dep_rewrite.clone(),
                cfg.trailing_switches.clone(),
            )
        };

        if dep_kind != DependencyKind::None {
            if let Some(rw) = &dep_rewrite {
                if let Err(err) = rewrite::rewrite_file(&dep_path, &rw.pattern, &rw.replacement) {
                    self.record_failure(inf, format!("{err:#}"));
                    return Ok(());
                }
            }
        }

        let deps = if check_legality {
            match dep_kind {
                DependencyKind::None => PostDeps::Clean(None),
                DependencyKind::Makefile => self.process_makefile_deps(&inf, &dep_path),
                DependencyKind::UnitManifest => self.process_unit_manifest(&inf, &dep_path),
            }
        } else {
            PostDeps::Clean(None)
        };

        match deps {
            PostDeps::Clean(manifest) => {
                if self.ctx.opts.closure {
                    if let Some(m) = &manifest {
                        self.queue.insert_transitive_dependencies(
                            self.tree,
                            m,
                            self.ctx.opts.no_split_units,
                        );
                    }
                }
            }
            PostDeps::Malformed(reason) => {
                self.record_failure(inf, reason);
                return Ok(());
            }
            PostDeps::Illegal(reason) => {
                // Invalidate the artifacts so the next run recompiles.
                let _ = std::fs::remove_file(&object_path);
                let _ = std::fs::remove_file(&dep_path);
                let _ = std::fs::remove_file(&switches_path);
                self.record_failure(inf, reason);
                return Ok(());
            }
        }

        self.tree.refresh_stamps(inf.source);
        let Some(stamp) = self.tree.source(inf.source).object_stamp else {
            self.record_failure(inf, "compiler did not produce the object file".to_string());
            return Ok(());
        };
        switches::write_switches_file(
            &switches_path,
            &stamp.as_line(),
            &inf.argv[..inf.last_switches_for_file],
            &trailing,
        )?;

        let mut inf = inf;
        mapping::release(self.ctx, inf.language, inf.mapping_file.take());
        let dir = self.object_dir(inf.source);
        self.queue.mark_free(&dir);
        self.report.compiled += 1;
        self.display_progress();
        Ok(())
    }

    fn process_makefile_deps(&mut self, inf: &InFlight, dep_path: &std::path::Path) -> PostDeps {
        let text = match std::fs::read_to_string(dep_path) {
            Ok(text) => text,
            Err(err) => {
                return PostDeps::Malformed(format!(
                    "cannot read dependency file {}: {err}",
                    dep_path.display()
                ))
            }
        };
        let deps = match makefile::parse(&text) {
            Ok(deps) => deps,
            Err(err) => {
                return PostDeps::Malformed(format!(
                    "malformed dependency file {}: {err:#}",
                    dep_path.display()
                ))
            }
        };

        let indirect = self.ctx.opts.indirect_imports;
        let mut checker = LegalityChecker::new(inf.project);
        let mut violations: Vec<String> = Vec::new();
        for prereq in &deps.prereqs {
            let path = util::normalize_dep_path(prereq);
            let Some(dep_sid) = self.tree.source_by_path(&path) else {
                continue;
            };
            if dep_sid == inf.source {
                continue;
            }
            match checker.check(self.tree, dep_sid, indirect) {
                Outcome::Allowed | Outcome::Deferred => {}
                Outcome::Violation(msg) => violations.push(msg),
            }
        }
        violations.extend(checker.finish(self.tree));
        if violations.is_empty() {
            PostDeps::Clean(None)
        } else {
            PostDeps::Illegal(violations.join("; "))
        }
    }

    fn process_unit_manifest(&mut self, inf: &InFlight, dep_path: &std::path::Path) -> PostDeps {
        let m = match manifest::load(dep_path) {
            Ok(m) => m,
            Err(err) => return PostDeps::Malformed(format!("{err:#}")),
        };

        let indirect = self.ctx.opts.indirect_imports;
        let mut checker = LegalityChecker::new(inf.project);
        let mut violations: Vec<String> = Vec::new();
        let mut bases: Vec<&str> = m
            .imports
            .iter()
            .filter_map(|imp| imp.source.as_deref())
            .collect();
        if self.ctx.opts.no_split_units {
            bases.extend(m.subunits.iter().map(|sub| sub.source.as_str()));
        }
        for base in bases {
            let Some(dep_sid) = self.tree.source_by_base(base) else {
                continue;
            };
            if dep_sid == inf.source {
                continue;
            }
            match checker.check(self.tree, dep_sid, indirect) {
                Outcome::Allowed | Outcome::Deferred => {}
                Outcome::Violation(msg) => violations.push(msg),
            }
        }
        violations.extend(checker.finish(self.tree));
        if violations.is_empty() {
            PostDeps::Clean(Some(Box::new(m)))
        } else {
            PostDeps::Illegal(violations.join("; "))
        }
    }

    fn record_failure(&mut self, mut inf: InFlight, reason: String) {
        let (file, project_name) = {
            let s = self.tree.source(inf.source);
            (
                s.display_file.clone(),
                self.tree.project(inf.project).name.clone(),
            )
        };
        if self.ctx.opts.verbosity > Verbosity::Quiet {
            eprintln!("{file}: {reason}");
        }
        mapping::release(self.ctx, inf.language, inf.mapping_file.take());
        let dir = self.object_dir(inf.source);
        self.queue.mark_free(&dir);
        self.report.failed.push(BadCompilation {
            source: inf.source,
            file,
            project: project_name,
            reason,
        });
        self.display_progress();
    }

    fn object_dir(&self, id: SourceId) -> PathBuf {
        self.tree
            .project(self.tree.source(id).object_project)
            .object_dir
            .clone()
    }

    fn say_recompiling(&self, id: SourceId, reason: &StaleReason) {
        if self.ctx.opts.verbosity >= Verbosity::Verbose {
            println!(
                "   recompiling {} ({})",
                self.tree.source(id).display_file,
                reason.describe()
            );
        }
    }

    fn display_progress(&self) {
        if !self.ctx.opts.display_progress {
            return;
        }
        let completed = self.report.compiled + self.report.up_to_date + self.report.failed.len();
        let total = self.queue.total_enqueued().max(1);
        println!(
            "completed {} out of {} ({}%)...",
            completed,
            self.queue.total_enqueued(),
            completed * 100 / total
        );
    }
}

fn describe_exit(status: &std::process::ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exited with code {code}"),
        None => "was terminated by a signal".to_string(),
    }
}
