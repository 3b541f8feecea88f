//! Integration tests for the kiln binary.
//!
//! Each test writes a small project into a temporary directory and runs the
//! compiled binary against it. Actions are `/bin/sh` snippets.

#![cfg(unix)]

use std::fs;
use std::path::Path;
use std::process::{Command, Output};

fn kiln(project: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_kiln"))
        .args(args)
        .current_dir(project)
        .env_remove("KILN_LOG")
        .output()
        .expect("failed to execute kiln")
}

fn assert_success(output: &Output, what: &str) {
    assert!(
        output.status.success(),
        "{what} failed (exit={:?}):\nstdout:\n{}\nstderr:\n{}",
        output.status.code(),
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr),
    );
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

const PLAN: &str = r#"{
    "target": "demo",
    "actions": [
        { "kind": "compile", "program": "/bin/sh", "arguments": "-c 'cat main.c > obj/main.o'",
          "prerequisites": ["main.c"], "produced": ["obj/main.o"],
          "description": "main.c", "emit-status-line": true },
        { "kind": "link", "program": "/bin/sh", "arguments": "-c 'cat obj/main.o > bin/app'",
          "prerequisites": ["obj/main.o"], "produced": ["bin/app"], "description": "app" }
    ]
}"#;

/// Compile `main.c` into `obj/`, link into `bin/`.
fn project() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("kiln.toml"), "[outdated]\ntimestamp-slop-ms = 0\n").unwrap();
    fs::write(dir.path().join("plan.json"), PLAN).unwrap();
    fs::write(dir.path().join("main.c"), "int main;\n").unwrap();
    dir
}

#[test]
fn build_then_rebuild_is_a_no_op() {
    let dir = project();

    let first = kiln(dir.path(), &["build"]);
    assert_success(&first, "first build");
    assert!(stdout(&first).contains("(2 of 2 actions executed"));
    assert_eq!(fs::read_to_string(dir.path().join("bin/app")).unwrap(), "int main;\n");
    assert!(dir.path().join(".kiln/demo/command-lines.json").exists());
    assert!(dir.path().join(".kiln/demo/include-deps.json").exists());

    let second = kiln(dir.path(), &["build"]);
    assert_success(&second, "second build");
    assert!(stdout(&second).contains("(0 of 2 actions executed"));

    let forced = kiln(dir.path(), &["build", "-f"]);
    assert_success(&forced, "forced build");
    assert!(stdout(&forced).contains("(2 of 2 actions executed"));
}

#[test]
fn outdated_lists_without_running() {
    let dir = project();

    let output = kiln(dir.path(), &["outdated"]);
    assert_success(&output, "outdated");
    let text = stdout(&output);
    assert!(text.contains("main.c"));
    assert!(text.contains("2 of 2 actions are out of date"));
    assert!(!dir.path().join("bin/app").exists());
    assert!(!dir.path().join(".kiln").exists());
}

#[test]
fn dry_run_executes_nothing() {
    let dir = project();

    let output = kiln(dir.path(), &["build", "--dry-run"]);
    assert_success(&output, "dry run");
    assert!(stdout(&output).contains("dry-run executor"));
    assert!(!dir.path().join("bin/app").exists());
    assert!(!dir.path().join(".kiln").exists());
}

#[test]
fn failing_action_fails_the_build() {
    let dir = project();
    let plan = r#"{ "actions": [
        { "kind": "compile", "program": "/bin/sh", "arguments": "-c 'exit 3'",
          "prerequisites": ["main.c"], "produced": ["main.o"] },
        { "kind": "link", "program": "/bin/sh", "arguments": "-c 'touch app'",
          "prerequisites": ["main.o"], "produced": ["app"] }
    ] }"#;
    fs::write(dir.path().join("plan.json"), plan).unwrap();

    let output = kiln(dir.path(), &["build"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("2 of 2 actions did not complete (1 launched)"), "{stderr}");
    assert!(!dir.path().join("app").exists());
}

#[test]
fn cyclic_plan_is_reported() {
    let dir = project();
    let plan = r#"{ "actions": [
        { "kind": "compile", "program": "/bin/true", "prerequisites": ["b"], "produced": ["a"] },
        { "kind": "compile", "program": "/bin/true", "prerequisites": ["a"], "produced": ["b"] }
    ] }"#;
    fs::write(dir.path().join("plan.json"), plan).unwrap();

    let output = kiln(dir.path(), &["graph"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("cycle"), "{stderr}");
    assert!(stderr.contains("Waiting on"), "{stderr}");
}

#[test]
fn clean_removes_target_state() {
    let dir = project();
    assert_success(&kiln(dir.path(), &["build"]), "build");
    assert!(dir.path().join(".kiln/demo").exists());

    let output = kiln(dir.path(), &["clean", "--target", "demo"]);
    assert_success(&output, "clean");
    assert!(stdout(&output).contains("Removed"));
    assert!(!dir.path().join(".kiln/demo").exists());

    let again = kiln(dir.path(), &["clean", "--target", "demo"]);
    assert_success(&again, "second clean");
    assert!(stdout(&again).contains("Nothing to clean."));
}
