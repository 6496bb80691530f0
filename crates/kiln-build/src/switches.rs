//! Switches files: the driver-produced record of the exact command line and
//! object timestamp behind each object file.
//!
//! Format, line by line: the object-file stamp, then each argv element that
//! is subject to replay comparison, then every trailing required switch.

use std::io::Write as _;
use std::path::Path;

use anyhow::{Context, Result};

/// Written strictly after the compiler exited, so the stamp recorded here is
/// the stamp of the finished object.
pub fn write_switches_file(
    path: &Path,
    object_stamp_line: &str,
    argv: &[String],
    trailing: &[String],
) -> Result<()> {
    let mut text = String::with_capacity(64 + argv.len() * 16);
    text.push_str(object_stamp_line);
    text.push('\n');
    for arg in argv {
        text.push_str(arg);
        text.push('\n');
    }
    for sw in trailing {
        text.push_str(sw);
        text.push('\n');
    }
    let mut file = std::fs::File::create(path)
        .with_context(|| format!("create switches file: {}", path.display()))?;
    file.write_all(text.as_bytes()).with_context(|| {
        format!(
            "could not write switches file {} (disk full?)",
            path.display()
        )
    })?;
    Ok(())
}

/// Compare the on-disk switches file against what the assembler would pass
/// now. Any mismatch, missing line, extra trailing line, or I/O problem
/// means the source must be recompiled.
pub fn check_switches_file(
    path: &Path,
    object_stamp_line: &str,
    argv: &[String],
    trailing: &[String],
) -> bool {
    let Ok(text) = std::fs::read_to_string(path) else {
        return false;
    };
    let mut lines = text.lines();
    if lines.next() != Some(object_stamp_line) {
        return false;
    }
    for expected in argv.iter().chain(trailing) {
        if lines.next() != Some(expected.as_str()) {
            return false;
        }
    }
    lines.next().is_none()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn write_then_check_round_trips() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("a.cswi");
        let argv = strings(&["-O2", "-MF", "/p/obj/a.d"]);
        let trailing = strings(&["-c"]);
        write_switches_file(&path, "12.000000345", &argv, &trailing).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "12.000000345\n-O2\n-MF\n/p/obj/a.d\n-c\n");

        assert!(check_switches_file(&path, "12.000000345", &argv, &trailing));
    }

    #[test]
    fn single_argv_drift_is_detected() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("a.cswi");
        write_switches_file(&path, "1.000000000", &strings(&["-O2"]), &[]).unwrap();
        assert!(!check_switches_file(&path, "1.000000000", &strings(&["-O3"]), &[]));
    }

    #[test]
    fn extra_or_missing_lines_fail_the_check() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("a.cswi");
        write_switches_file(&path, "1.000000000", &strings(&["-O2", "-g"]), &[]).unwrap();
        // Missing expectation: file has one line too many.
        assert!(!check_switches_file(&path, "1.000000000", &strings(&["-O2"]), &[]));
        // Extra expectation: file is one line short.
        assert!(!check_switches_file(
            &path,
            "1.000000000",
            &strings(&["-O2", "-g", "-c"]),
            &[]
        ));
    }

    #[test]
    fn unreadable_file_means_must_compile() {
        assert!(!check_switches_file(
            Path::new("/nonexistent/kiln/a.cswi"),
            "1.000000000",
            &[],
            &[]
        ));
    }

    #[test]
    fn stamp_mismatch_fails_the_check() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("a.cswi");
        write_switches_file(&path, "1.000000000", &[], &[]).unwrap();
        assert!(!check_switches_file(&path, "2.000000000", &[], &[]));
    }
}
