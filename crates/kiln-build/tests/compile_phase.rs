#![cfg(unix)]

use std::path::Path;

use serde_json::json;

use kiln_build::supervisor::run_compile_phase;
use kiln_build::{BuildContext, BuildOptions};
use kiln_model::loader::load_tree_from_str;
use kiln_model::{ProjectTree, TREE_SCHEMA_VERSION};

mod phase_testutil;
use phase_testutil::{read_log, stub_lang_config, write_executable, write_stub_compiler};

fn load(doc: &serde_json::Value) -> ProjectTree {
    load_tree_from_str(&doc.to_string()).expect("load tree")
}

fn write_source(dir: &Path, name: &str) {
    std::fs::write(dir.join(name), format!("content of {name}\n")).expect("write source");
}

#[test]
fn serial_two_languages_compile_in_queue_order() {
    let dir = tempfile::TempDir::new().unwrap();
    let log = dir.path().join("spawns.log");
    let cc = write_stub_compiler(
        dir.path(),
        "stubcc",
        &format!("echo \"$base\" >> {}", log.display()),
    );
    write_source(dir.path(), "x.c");
    write_source(dir.path(), "y.adb");

    let doc = json!({
        "schema_version": TREE_SCHEMA_VERSION,
        "root": "p",
        "projects": [{
            "name": "p",
            "dir": dir.path(),
            "object_dir": dir.path().join("obj"),
            "languages": [
                {
                    "name": "c",
                    "config": stub_lang_config(&cc),
                    "sources": [
                        {"file": "x.c", "path": dir.path().join("x.c"), "kind": "impl"},
                    ],
                },
                {
                    "name": "ada",
                    "config": stub_lang_config(&cc),
                    "sources": [
                        {"file": "y.adb", "path": dir.path().join("y.adb"), "kind": "impl"},
                    ],
                },
            ],
        }],
    });
    let mut tree = load(&doc);
    let mut ctx = BuildContext::new(BuildOptions {
        max_parallelism: 1,
        ..BuildOptions::default()
    });

    let report = run_compile_phase(&mut tree, &mut ctx).unwrap();
    assert!(report.ok());
    assert_eq!(report.compiled, 2);
    assert_eq!(read_log(&log), vec!["x.c", "y.adb"]);
    assert!(dir.path().join("obj/x.cswi").exists());
    assert!(dir.path().join("obj/y.cswi").exists());
}

#[test]
fn shared_object_dir_is_never_oversubscribed() {
    let dir = tempfile::TempDir::new().unwrap();
    let log = dir.path().join("overlap.log");
    let cc = write_stub_compiler(
        dir.path(),
        "stubcc",
        &format!(
            "echo \"start $base\" >> {log}\nsleep 0.2\necho \"end $base\" >> {log}",
            log = log.display()
        ),
    );
    write_source(dir.path(), "a.c");
    write_source(dir.path(), "b.c");

    let doc = json!({
        "schema_version": TREE_SCHEMA_VERSION,
        "root": "p",
        "projects": [{
            "name": "p",
            "dir": dir.path(),
            "object_dir": dir.path().join("obj"),
            "languages": [{
                "name": "c",
                "config": stub_lang_config(&cc),
                "sources": [
                    {"file": "a.c", "path": dir.path().join("a.c"), "kind": "impl"},
                    {"file": "b.c", "path": dir.path().join("b.c"), "kind": "impl"},
                ],
            }],
        }],
    });
    let mut tree = load(&doc);
    let mut ctx = BuildContext::new(BuildOptions {
        max_parallelism: 4,
        ..BuildOptions::default()
    });

    let report = run_compile_phase(&mut tree, &mut ctx).unwrap();
    assert!(report.ok());
    assert_eq!(report.compiled, 2);

    // Both sources share one object directory: each compile must fully
    // finish before the next starts.
    let lines = read_log(&log);
    assert_eq!(lines.len(), 4, "got: {lines:?}");
    assert_eq!(lines[0], "start a.c");
    assert_eq!(lines[1], "end a.c");
    assert_eq!(lines[2], "start b.c");
    assert_eq!(lines[3], "end b.c");
}

fn failing_pair_doc(dir: &Path, cc: &Path) -> serde_json::Value {
    json!({
        "schema_version": TREE_SCHEMA_VERSION,
        "root": "p",
        "projects": [{
            "name": "p",
            "dir": dir,
            "object_dir": dir.join("obj"),
            "languages": [{
                "name": "c",
                "config": stub_lang_config(cc),
                "sources": [
                    {"file": "fail1.c", "path": dir.join("fail1.c"), "kind": "impl"},
                    {"file": "ok.c", "path": dir.join("ok.c"), "kind": "impl"},
                ],
            }],
        }],
    })
}

#[test]
fn keep_going_records_failure_and_compiles_the_rest() {
    let dir = tempfile::TempDir::new().unwrap();
    let cc = write_stub_compiler(
        dir.path(),
        "stubcc",
        "case \"$base\" in fail*) exit 1 ;; esac",
    );
    write_source(dir.path(), "fail1.c");
    write_source(dir.path(), "ok.c");

    let mut tree = load(&failing_pair_doc(dir.path(), &cc));
    let mut ctx = BuildContext::new(BuildOptions {
        keep_going: true,
        ..BuildOptions::default()
    });

    let report = run_compile_phase(&mut tree, &mut ctx).unwrap();
    assert!(!report.ok());
    assert_eq!(report.compiled, 1);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].file, "fail1.c");
    assert!(report.failed[0].reason.contains("exited with code 1"));

    assert!(!dir.path().join("obj/fail1.cswi").exists());
    assert!(dir.path().join("obj/ok.cswi").exists());
}

#[test]
fn fail_fast_stops_pulling_new_work() {
    let dir = tempfile::TempDir::new().unwrap();
    let cc = write_stub_compiler(
        dir.path(),
        "stubcc",
        "case \"$base\" in fail*) exit 1 ;; esac",
    );
    write_source(dir.path(), "fail1.c");
    write_source(dir.path(), "ok.c");

    let mut tree = load(&failing_pair_doc(dir.path(), &cc));
    let mut ctx = BuildContext::new(BuildOptions::default());

    let report = run_compile_phase(&mut tree, &mut ctx).unwrap();
    assert!(!report.ok());
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.compiled, 0);
    assert!(!dir.path().join("obj/ok.o").exists());
}

#[test]
fn illegal_import_invalidates_the_produced_artifacts() {
    let dir = tempfile::TempDir::new().unwrap();
    let p_dir = dir.path().join("p");
    let q_dir = dir.path().join("q");
    std::fs::create_dir_all(&p_dir).unwrap();
    std::fs::create_dir_all(&q_dir).unwrap();
    write_source(&p_dir, "foo.c");
    write_source(&q_dir, "bar.h");

    // The stub reports bar.h as an included dependency.
    let cc = write_stub_compiler(dir.path(), "stubcc", "");
    let script = std::fs::read_to_string(&cc).unwrap().replace(
        "printf '%s: %s\\n' \"$obj\" \"$src\" > \"$dep\"",
        &format!(
            "printf '%s: %s {}\\n' \"$obj\" \"$src\" > \"$dep\"",
            q_dir.join("bar.h").display()
        ),
    );
    write_executable(&cc, &script);

    let doc = json!({
        "schema_version": TREE_SCHEMA_VERSION,
        "root": "p",
        "projects": [
            {
                "name": "q",
                "dir": q_dir,
                "object_dir": q_dir.join("obj"),
                "languages": [{
                    "name": "c",
                    "config": stub_lang_config(&cc),
                    "sources": [
                        {"file": "bar.h", "path": q_dir.join("bar.h"), "kind": "spec"},
                    ],
                }],
            },
            {
                "name": "p",
                "dir": p_dir,
                "object_dir": p_dir.join("obj"),
                "languages": [{
                    "name": "c",
                    "config": stub_lang_config(&cc),
                    "sources": [
                        {"file": "foo.c", "path": p_dir.join("foo.c"), "kind": "impl"},
                    ],
                }],
            },
        ],
    });
    let mut tree = load(&doc);
    let mut ctx = BuildContext::new(BuildOptions {
        keep_going: true,
        ..BuildOptions::default()
    });

    let report = run_compile_phase(&mut tree, &mut ctx).unwrap();
    assert!(!report.ok());
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].file, "foo.c");
    assert!(
        report.failed[0].reason.contains("does not import"),
        "got: {}",
        report.failed[0].reason
    );

    // The compile itself succeeded; the post-processor must have deleted
    // everything it produced.
    assert!(!p_dir.join("obj/foo.o").exists());
    assert!(!p_dir.join("obj/foo.d").exists());
    assert!(!p_dir.join("obj/foo.cswi").exists());
}

#[test]
fn imported_project_dependency_is_accepted() {
    let dir = tempfile::TempDir::new().unwrap();
    let p_dir = dir.path().join("p");
    let q_dir = dir.path().join("q");
    std::fs::create_dir_all(&p_dir).unwrap();
    std::fs::create_dir_all(&q_dir).unwrap();
    write_source(&p_dir, "foo.c");
    write_source(&q_dir, "bar.h");

    let cc = write_stub_compiler(dir.path(), "stubcc", "");
    let script = std::fs::read_to_string(&cc).unwrap().replace(
        "printf '%s: %s\\n' \"$obj\" \"$src\" > \"$dep\"",
        &format!(
            "printf '%s: %s {}\\n' \"$obj\" \"$src\" > \"$dep\"",
            q_dir.join("bar.h").display()
        ),
    );
    write_executable(&cc, &script);

    let doc = json!({
        "schema_version": TREE_SCHEMA_VERSION,
        "root": "p",
        "projects": [
            {
                "name": "q",
                "dir": q_dir,
                "object_dir": q_dir.join("obj"),
                "languages": [{
                    "name": "c",
                    "config": stub_lang_config(&cc),
                    "sources": [
                        {"file": "bar.h", "path": q_dir.join("bar.h"), "kind": "spec"},
                    ],
                }],
            },
            {
                "name": "p",
                "dir": p_dir,
                "object_dir": p_dir.join("obj"),
                "imports": ["q"],
                "languages": [{
                    "name": "c",
                    "config": stub_lang_config(&cc),
                    "sources": [
                        {"file": "foo.c", "path": p_dir.join("foo.c"), "kind": "impl"},
                    ],
                }],
            },
        ],
    });
    let mut tree = load(&doc);
    let mut ctx = BuildContext::new(BuildOptions::default());

    let report = run_compile_phase(&mut tree, &mut ctx).unwrap();
    assert!(report.ok(), "failed: {:?}", report.failed);
    assert!(p_dir.join("obj/foo.o").exists());
    assert!(p_dir.join("obj/foo.cswi").exists());
}

#[test]
fn second_run_is_up_to_date_and_switches_drift_rebuilds() {
    let dir = tempfile::TempDir::new().unwrap();
    let cc = write_stub_compiler(dir.path(), "stubcc", "");
    write_source(dir.path(), "a.c");

    let doc = json!({
        "schema_version": TREE_SCHEMA_VERSION,
        "root": "p",
        "projects": [{
            "name": "p",
            "dir": dir.path(),
            "object_dir": dir.path().join("obj"),
            "languages": [{
                "name": "c",
                "config": stub_lang_config(&cc),
                "default_switches": ["-O2"],
                "sources": [
                    {"file": "a.c", "path": dir.path().join("a.c"), "kind": "impl"},
                ],
            }],
        }],
    });

    let opts = BuildOptions {
        check_switches: true,
        ..BuildOptions::default()
    };

    let mut tree = load(&doc);
    let mut ctx = BuildContext::new(opts.clone());
    let report = run_compile_phase(&mut tree, &mut ctx).unwrap();
    assert_eq!((report.compiled, report.up_to_date), (1, 0));

    // Unchanged: the second run compiles nothing.
    let mut tree = load(&doc);
    let mut ctx = BuildContext::new(opts.clone());
    let report = run_compile_phase(&mut tree, &mut ctx).unwrap();
    assert_eq!(
        (report.compiled, report.up_to_date),
        (0, 1),
        "failed: {:?}",
        report.failed
    );

    // Tamper with one recorded argv line: the oracle must order a rebuild,
    // and the rebuild must restore the record.
    let cswi = dir.path().join("obj/a.cswi");
    let recorded = std::fs::read_to_string(&cswi).unwrap();
    assert!(recorded.contains("-O2\n"));
    std::fs::write(&cswi, recorded.replace("-O2\n", "-O3\n")).unwrap();

    let mut tree = load(&doc);
    let mut ctx = BuildContext::new(opts.clone());
    let report = run_compile_phase(&mut tree, &mut ctx).unwrap();
    assert_eq!((report.compiled, report.up_to_date), (1, 0));
    let restored = std::fs::read_to_string(&cswi).unwrap();
    assert!(restored.contains("-O2\n"));

    let mut tree = load(&doc);
    let mut ctx = BuildContext::new(opts);
    let report = run_compile_phase(&mut tree, &mut ctx).unwrap();
    assert_eq!((report.compiled, report.up_to_date), (0, 1));
}

#[test]
fn unit_manifest_closure_pulls_imported_sources() {
    let dir = tempfile::TempDir::new().unwrap();
    let p_dir = dir.path().join("p");
    let q_dir = dir.path().join("q");
    std::fs::create_dir_all(&p_dir).unwrap();
    std::fs::create_dir_all(&q_dir).unwrap();
    write_source(&p_dir, "u.adb");
    write_source(&q_dir, "w.adb");
    write_source(&q_dir, "z.adb");

    let compiler = p_dir.join("stubada");
    write_executable(
        &compiler,
        r#"#!/bin/sh
obj=""; dep=""; src=""; prev=""
for a in "$@"; do
  case "$prev" in
    -o) obj="$a" ;;
    -MF) dep="$a" ;;
  esac
  case "$a" in
    *.adb) src="$a" ;;
  esac
  prev="$a"
done
base=$(basename "$src")
touch "$obj"
case "$base" in
  u.adb)
    cat > "$dep" <<'EOF'
{"schema_version":"kiln.unitdep@0.1.0","unit":"u","imports":[{"unit":"w","source":"w.adb"}]}
EOF
    ;;
  *)
    printf '{"schema_version":"kiln.unitdep@0.1.0","unit":"%s"}\n' "${base%.adb}" > "$dep"
    ;;
esac
exit 0
"#,
    );

    let lang = |sources: serde_json::Value| {
        json!({
            "name": "ada",
            "config": {
                "compiler_driver": compiler,
                "dependency_kind": "unit-manifest",
                "dependency_option": ["-MF", "{}"],
                "dep_suffix": ".ud.json",
                "object_switch": ["-o"],
            },
            "sources": sources,
        })
    };
    let doc = json!({
        "schema_version": TREE_SCHEMA_VERSION,
        "root": "p",
        "projects": [
            {
                "name": "q",
                "dir": q_dir,
                "object_dir": q_dir.join("obj"),
                "languages": [lang(json!([
                    {"file": "w.adb", "path": q_dir.join("w.adb"), "kind": "impl", "unit": "w"},
                    {"file": "z.adb", "path": q_dir.join("z.adb"), "kind": "impl", "unit": "z"},
                ]))],
            },
            {
                "name": "p",
                "dir": p_dir,
                "object_dir": p_dir.join("obj"),
                "imports": ["q"],
                "languages": [lang(json!([
                    {"file": "u.adb", "path": p_dir.join("u.adb"), "kind": "impl", "unit": "u"},
                ]))],
            },
        ],
    });
    let mut tree = load(&doc);
    let mut ctx = BuildContext::new(BuildOptions {
        closure: true,
        ..BuildOptions::default()
    });

    let report = run_compile_phase(&mut tree, &mut ctx).unwrap();
    assert!(report.ok(), "failed: {:?}", report.failed);
    // u.adb was seeded; w.adb came in through the manifest; z.adb is
    // unreachable and stays uncompiled.
    assert_eq!(report.compiled, 2);
    assert!(p_dir.join("obj/u.o").exists());
    assert!(q_dir.join("obj/w.o").exists());
    assert!(!q_dir.join("obj/z.o").exists());
}

#[test]
fn dependency_extractor_output_becomes_the_dep_file() {
    let dir = tempfile::TempDir::new().unwrap();
    write_source(dir.path(), "a.c");

    // Compiler produces only the object.
    let cc = dir.path().join("stubcc");
    write_executable(
        &cc,
        r#"#!/bin/sh
obj=""; prev=""
for a in "$@"; do
  case "$prev" in -o) obj="$a" ;; esac
  prev="$a"
done
touch "$obj"
exit 0
"#,
    );
    // Extractor prints the Make-style record on stdout.
    let extractor = dir.path().join("stubdep");
    write_executable(
        &extractor,
        r#"#!/bin/sh
printf 'a.o: %s\n' "$1"
exit 0
"#,
    );

    let doc = json!({
        "schema_version": TREE_SCHEMA_VERSION,
        "root": "p",
        "projects": [{
            "name": "p",
            "dir": dir.path(),
            "object_dir": dir.path().join("obj"),
            "languages": [{
                "name": "c",
                "config": {
                    "compiler_driver": cc,
                    "dependency_kind": "makefile",
                    "compute_dependency": [extractor, "{}"],
                    "object_switch": ["-o"],
                },
                "sources": [
                    {"file": "a.c", "path": dir.path().join("a.c"), "kind": "impl"},
                ],
            }],
        }],
    });
    let mut tree = load(&doc);
    let mut ctx = BuildContext::new(BuildOptions::default());

    let report = run_compile_phase(&mut tree, &mut ctx).unwrap();
    assert!(report.ok(), "failed: {:?}", report.failed);
    assert_eq!(report.compiled, 1);

    let dep = std::fs::read_to_string(dir.path().join("obj/a.d")).unwrap();
    assert_eq!(dep, format!("a.o: {}\n", dir.path().join("a.c").display()));
    assert!(dir.path().join("obj/a.cswi").exists());
}

#[test]
fn include_path_env_var_is_set_then_cleared() {
    let dir = tempfile::TempDir::new().unwrap();
    let cc = write_stub_compiler(dir.path(), "stubcc", "");
    write_source(dir.path(), "a.c");

    let var = "KILN_TEST_INCLUDE_PATH_A7";
    let doc = json!({
        "schema_version": TREE_SCHEMA_VERSION,
        "root": "p",
        "projects": [{
            "name": "p",
            "dir": dir.path(),
            "object_dir": dir.path().join("obj"),
            "languages": [{
                "name": "c",
                "config": {
                    "compiler_driver": cc,
                    "dependency_kind": "makefile",
                    "dependency_option": ["-MF", "{}"],
                    "object_switch": ["-o"],
                    "include_path_var": var,
                },
                "sources": [
                    {"file": "a.c", "path": dir.path().join("a.c"), "kind": "impl"},
                ],
            }],
        }],
    });
    let mut tree = load(&doc);
    let mut ctx = BuildContext::new(BuildOptions::default());

    let report = run_compile_phase(&mut tree, &mut ctx).unwrap();
    assert!(report.ok(), "failed: {:?}", report.failed);
    // The phase sets the variable for its children and resets it on the
    // way out.
    assert_eq!(std::env::var(var).as_deref(), Ok(""));
}
