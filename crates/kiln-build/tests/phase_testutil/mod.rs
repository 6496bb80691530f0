//! Shared scaffolding for compile-phase tests: scratch project layouts and
//! `/bin/sh` stub compilers that create objects and dep files.

#![cfg(unix)]

use std::path::{Path, PathBuf};

/// A stub compiler understanding the switch shapes the tests configure:
/// `-o <obj>`, `-MF <dep>`, source recognized by extension. `extra_shell`
/// is spliced in before the object is written (for failure injection,
/// sleeps, or extra dep entries).
pub fn write_stub_compiler(dir: &Path, name: &str, extra_shell: &str) -> PathBuf {
    let path = dir.join(name);
    let script = format!(
        r#"#!/bin/sh
obj=""; dep=""; src=""; prev=""
for a in "$@"; do
  case "$prev" in
    -o) obj="$a" ;;
    -MF) dep="$a" ;;
  esac
  case "$a" in
    *.c|*.adb) src="$a" ;;
  esac
  prev="$a"
done
base=$(basename "$src")
{extra_shell}
touch "$obj"
if [ -n "$dep" ]; then
  printf '%s: %s\n' "$obj" "$src" > "$dep"
fi
exit 0
"#
    );
    write_executable(&path, &script);
    path
}

pub fn write_executable(path: &Path, content: &str) {
    use std::os::unix::fs::PermissionsExt as _;
    std::fs::write(path, content).expect("write script");
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .expect("chmod script");
}

/// Language config JSON the stub compiler understands.
pub fn stub_lang_config(driver: &Path) -> serde_json::Value {
    serde_json::json!({
        "compiler_driver": driver,
        "dependency_kind": "makefile",
        "dependency_option": ["-MF", "{}"],
        "object_switch": ["-o"],
        "trailing_switches": ["-c"],
    })
}

pub fn read_log(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(|l| l.to_string())
        .collect()
}
