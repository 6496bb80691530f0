//! Compiler argument files, for toolchains whose command lines overflow the
//! OS limit.

use std::path::PathBuf;

use anyhow::{Context, Result};
use kiln_model::ResponseFileFormat;

use crate::tempfiles::TempFileRegistry;

pub fn write_response_file(
    format: ResponseFileFormat,
    args: &[String],
    registry: &mut TempFileRegistry,
) -> Result<PathBuf> {
    let path = registry.create("kiln_resp")?;
    let mut text = String::new();
    match format {
        ResponseFileFormat::Plain => {
            for arg in args {
                text.push_str(arg);
                text.push('\n');
            }
        }
        ResponseFileFormat::Quoted => {
            text.push_str("INPUT (\n");
            for arg in args {
                text.push('"');
                text.push_str(arg);
                text.push_str("\"\n");
            }
            text.push_str(")\n");
        }
    }
    std::fs::write(&path, text)
        .with_context(|| format!("write response file: {}", path.display()))?;
    Ok(path)
}
