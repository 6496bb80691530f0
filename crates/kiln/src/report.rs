//! Machine-readable build reports, emitted on stdout next to the human
//! summary on stderr.

use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::Serialize;

use kiln_build::supervisor::PhaseReport;

pub const BUILD_REPORT_SCHEMA_VERSION: &str = "kiln.build.report@0.1.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[clap(rename_all = "kebab_case")]
pub enum JsonArg {
    #[clap(alias = "true")]
    Canon,
    Pretty,
    #[clap(alias = "false")]
    Off,
}

#[derive(Debug, Serialize)]
struct BuildReport<'a> {
    schema_version: &'static str,
    ok: bool,
    compiled: usize,
    up_to_date: usize,
    failed: Vec<FailedSource<'a>>,
}

#[derive(Debug, Serialize)]
struct FailedSource<'a> {
    file: &'a str,
    project: &'a str,
    reason: &'a str,
}

pub fn emit(mode: JsonArg, report: &PhaseReport) -> Result<()> {
    if mode == JsonArg::Off {
        return Ok(());
    }
    let doc = BuildReport {
        schema_version: BUILD_REPORT_SCHEMA_VERSION,
        ok: report.ok(),
        compiled: report.compiled,
        up_to_date: report.up_to_date,
        failed: report
            .failed
            .iter()
            .map(|bad| FailedSource {
                file: &bad.file,
                project: &bad.project,
                reason: &bad.reason,
            })
            .collect(),
    };
    let text = match mode {
        JsonArg::Canon => serde_json::to_string(&doc).context("encode build report")?,
        JsonArg::Pretty => serde_json::to_string_pretty(&doc).context("encode build report")?,
        JsonArg::Off => unreachable!(),
    };
    println!("{text}");
    Ok(())
}
