//! Unit manifests: the structured dependency record a unit-aware compiler
//! writes next to each object, listing the imported units and, when split
//! units are disallowed, the subunits folded into the compilation.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const UNITDEP_SCHEMA_VERSION: &str = "kiln.unitdep@0.1.0";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UnitManifest {
    pub schema_version: String,
    pub unit: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub imports: Vec<UnitImport>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subunits: Vec<SubunitDep>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UnitImport {
    pub unit: String,
    /// Basename of the imported unit's source, when the compiler resolved
    /// one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dep_file: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubunitDep {
    pub name: String,
    pub parent: String,
    pub source: String,
}

pub fn load(path: &Path) -> Result<UnitManifest> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("read unit manifest: {}", path.display()))?;
    parse(&bytes).with_context(|| format!("unit manifest: {}", path.display()))
}

pub fn parse(bytes: &[u8]) -> Result<UnitManifest> {
    let m: UnitManifest =
        serde_json::from_slice(bytes).context("parse unit manifest JSON")?;
    if m.schema_version.trim() != UNITDEP_SCHEMA_VERSION {
        anyhow::bail!(
            "unit manifest schema_version mismatch: expected {} got {:?}",
            UNITDEP_SCHEMA_VERSION,
            m.schema_version
        );
    }
    if m.unit.trim().is_empty() {
        anyhow::bail!("unit manifest has an empty unit name");
    }
    Ok(m)
}
