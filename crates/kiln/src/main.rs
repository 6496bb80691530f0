use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser};

use kiln_build::supervisor::run_compile_phase;
use kiln_build::{BuildContext, BuildOptions, Verbosity};

mod report;

#[derive(Parser, Debug)]
#[command(name = "kiln")]
#[command(about = "Multi-language project builder.", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Run the compile phase over a resolved project tree.
    Build(BuildArgs),
}

#[derive(Debug, Args)]
struct BuildArgs {
    /// Resolved project tree (JSON).
    #[arg(long, value_name = "PATH")]
    tree: PathBuf,

    /// Maximum number of concurrent compiler processes.
    #[arg(short = 'j', long, default_value_t = 1, value_name = "N")]
    jobs: usize,

    /// Keep compiling other sources after a failure.
    #[arg(short = 'k', long)]
    keep_going: bool,

    /// Recompile when the recorded switches differ from the current
    /// command line.
    #[arg(short = 's', long)]
    check_switches: bool,

    /// Recompile everything regardless of timestamps.
    #[arg(short = 'f', long)]
    force: bool,

    /// Accept dependencies on indirectly imported projects.
    #[arg(long)]
    indirect_imports: bool,

    /// Treat subunits as part of their parent unit's compilation.
    #[arg(long)]
    no_split_units: bool,

    /// Enqueue sources made reachable through unit manifests.
    #[arg(long)]
    closure: bool,

    /// Display "completed N out of M" progress lines.
    #[arg(long)]
    progress: bool,

    /// Do not delete driver-created temporary files.
    #[arg(long)]
    keep_temps: bool,

    /// Deliver include paths through a file named by the language's
    /// environment variable.
    #[arg(long)]
    include_path_file: bool,

    /// Extra compile switch for every language (repeatable).
    #[arg(long = "compiler-arg", value_name = "SWITCH")]
    compiler_args: Vec<String>,

    /// Extra compile switch for one language, as `<lang>:<switch>`
    /// (repeatable).
    #[arg(long = "compiler-arg-for", value_name = "LANG:SWITCH")]
    compiler_args_for: Vec<String>,

    #[arg(short, long)]
    verbose: bool,

    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Emit a machine-readable JSON report on stdout.
    #[arg(
        long,
        value_enum,
        num_args = 0..=1,
        default_missing_value = "canon",
        value_name = "MODE"
    )]
    json: Option<report::JsonArg>,
}

fn main() -> ExitCode {
    match try_main() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::from(2)
        }
    }
}

fn try_main() -> Result<ExitCode> {
    let cli = Cli::parse();
    match cli.command {
        Command::Build(args) => cmd_build(args),
    }
}

fn build_options(args: &BuildArgs) -> Result<BuildOptions> {
    if args.jobs == 0 {
        anyhow::bail!("--jobs must be at least 1");
    }
    let mut by_lang: HashMap<String, Vec<String>> = HashMap::new();
    for spec in &args.compiler_args_for {
        let (lang, switch) = spec
            .split_once(':')
            .with_context(|| format!("--compiler-arg-for expects <lang>:<switch>, got {spec:?}"))?;
        by_lang
            .entry(lang.to_ascii_lowercase())
            .or_default()
            .push(switch.to_string());
    }
    Ok(BuildOptions {
        max_parallelism: args.jobs,
        keep_going: args.keep_going,
        check_switches: args.check_switches,
        always_compile: args.force,
        indirect_imports: args.indirect_imports,
        no_split_units: args.no_split_units,
        closure: args.closure,
        display_progress: args.progress,
        keep_temp_files: args.keep_temps,
        use_include_path_file: args.include_path_file,
        verbosity: if args.quiet {
            Verbosity::Quiet
        } else if args.verbose {
            Verbosity::Verbose
        } else {
            Verbosity::Default
        },
        compile_switches_all: args.compiler_args.clone(),
        compile_switches_by_lang: by_lang,
    })
}

fn cmd_build(args: BuildArgs) -> Result<ExitCode> {
    let mut opts = build_options(&args)?;
    // A JSON report owns stdout; drop the command echo unless -v insists.
    if args.json.is_some() && !args.verbose {
        opts.verbosity = Verbosity::Quiet;
    }
    let mut tree = kiln_model::loader::load_tree(&args.tree)?;
    let mut ctx = BuildContext::new(opts);

    let report = run_compile_phase(&mut tree, &mut ctx)?;

    if !report.ok() && !args.quiet {
        for bad in &report.failed {
            eprintln!("   compilation of {} failed", bad.file);
        }
    }
    report::emit(args.json.unwrap_or(report::JsonArg::Off), &report)?;

    Ok(if report.ok() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}
