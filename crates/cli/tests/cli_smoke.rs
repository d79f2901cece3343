//! CLI smoke tests for brick.
//!
//! These tests run the binary against small project models in a temp
//! directory and check exit codes and the files left behind.

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use tempfile::TempDir;

/// Get a Command for the brick binary.
fn brick_cmd() -> Command {
  cargo_bin_cmd!("brick")
}

struct Workspace {
  temp: TempDir,
}

impl Workspace {
  /// A project with one product copying `hello.txt` to `hello.out`.
  fn new(prepare: &str) -> Self {
    let temp = TempDir::new().unwrap();
    let source = temp.path().join("hello.txt");
    std::fs::write(&source, "hello\n").unwrap();

    let project = serde_json::json!({
      "name": "smoke",
      "products": [{
        "name": "app",
        "file_tags": ["out"],
        "sources": [{ "path": source, "file_tags": ["txt"] }],
        "rules": [{
          "name": "copy",
          "inputs": ["txt"],
          "artifacts": [{
            "file_path": "$${input.baseName}.out",
            "file_tags": ["out"],
            "install": { "dir": "share" }
          }],
          "prepare": { "source": prepare }
        }]
      }]
    });
    std::fs::write(
      temp.path().join("project.json"),
      serde_json::to_string_pretty(&project).unwrap(),
    )
    .unwrap();
    Self { temp }
  }

  fn path(&self) -> &Path {
    self.temp.path()
  }

  fn build_dir(&self) -> PathBuf {
    self.path().join("build")
  }

  fn output(&self) -> PathBuf {
    self.build_dir().join("app").join("hello.out")
  }

  fn cmd(&self, args: &[&str]) -> Command {
    let mut cmd = brick_cmd();
    cmd.current_dir(self.path()).arg("--build-dir").arg(self.build_dir()).args(args);
    cmd
  }
}

const COPY: &str = r#"return { program = "cp", arguments = { input.filePath, output.filePath }, description = "copying " .. input.fileName }"#;

// =============================================================================
// Help & Version
// =============================================================================

#[test]
fn help_flag_works() {
  brick_cmd()
    .arg("--help")
    .assert()
    .success()
    .stdout(predicate::str::contains("Usage"));
}

#[test]
fn version_flag_works() {
  brick_cmd()
    .arg("--version")
    .assert()
    .success()
    .stdout(predicate::str::contains("brick"));
}

#[test]
fn subcommand_help_works() {
  for cmd in &["resolve", "build", "install", "clean", "list"] {
    brick_cmd()
      .arg(cmd)
      .arg("--help")
      .assert()
      .success()
      .stdout(predicate::str::contains("Usage"));
  }
}

// =============================================================================
// Commands
// =============================================================================

#[test]
fn missing_project_file_fails() {
  let ws = Workspace::new(COPY);
  ws.cmd(&["build", "nope.json"])
    .assert()
    .failure()
    .stderr(predicate::str::contains("Failed to read project file"));
}

#[test]
fn resolve_stores_graph() {
  let ws = Workspace::new(COPY);
  ws.cmd(&["resolve", "project.json"])
    .assert()
    .success()
    .stdout(predicate::str::contains("Resolved smoke"));
  assert!(ws.build_dir().join("smoke.bg.json").exists());
  assert!(!ws.output().exists());
}

#[cfg(unix)]
#[test]
fn build_then_nothing_to_do() {
  let ws = Workspace::new(COPY);
  ws.cmd(&["build", "project.json"])
    .assert()
    .success()
    .stdout(predicate::str::contains("Build complete"));
  assert_eq!(std::fs::read_to_string(ws.output()).unwrap(), "hello\n");

  ws.cmd(&["build", "project.json"])
    .assert()
    .success()
    .stdout(predicate::str::contains("Nothing to do"));
}

#[cfg(unix)]
#[test]
fn dry_run_prints_commands_only() {
  let ws = Workspace::new(COPY);
  ws.cmd(&["build", "project.json", "--dry-run"])
    .assert()
    .success()
    .stdout(predicate::str::contains("copying hello.txt"));
  assert!(!ws.output().exists());
}

#[cfg(unix)]
#[test]
fn failing_command_exits_nonzero() {
  let ws = Workspace::new(r#"return { program = "false" }"#);
  ws.cmd(&["build", "project.json"])
    .assert()
    .failure()
    .stderr(predicate::str::contains("transformer(s) failed"));
}

#[cfg(unix)]
#[test]
fn failing_command_output_is_shown() {
  let ws = Workspace::new(r#"return { program = "sh", arguments = { "-c", "echo 'boom: no such header' >&2; exit 1" } }"#);
  ws.cmd(&["build", "project.json"])
    .assert()
    .failure()
    .stderr(predicate::str::contains("boom: no such header"));
}

#[test]
fn unknown_product_fails() {
  let ws = Workspace::new(COPY);
  ws.cmd(&["build", "project.json", "-p", "missing"])
    .assert()
    .failure()
    .stderr(predicate::str::contains("unknown product"));
}

#[cfg(unix)]
#[test]
fn list_shows_transformer_commands() {
  let ws = Workspace::new(COPY);
  ws.cmd(&["resolve", "project.json"]).assert().success();
  ws.cmd(&["list"])
    .assert()
    .success()
    .stdout(predicate::str::contains("app"))
    .stdout(predicate::str::contains("copying hello.txt"));

  ws.cmd(&["list", "--product", "app", "-o", "json"])
    .assert()
    .success()
    .stdout(predicate::str::contains("\"rule\": \"copy\""));

  ws.cmd(&["list", "--product", "other"]).assert().failure();
}

#[cfg(unix)]
#[test]
fn install_copies_into_install_root() {
  let ws = Workspace::new(COPY);
  ws.cmd(&["build", "project.json"]).assert().success();

  let root = ws.path().join("root");
  ws.cmd(&["install", "project.json", "--install-root", root.to_str().unwrap()])
    .assert()
    .success()
    .stdout(predicate::str::contains("Install complete"));
  assert_eq!(std::fs::read_to_string(root.join("share/hello.out")).unwrap(), "hello\n");
}

#[cfg(unix)]
#[test]
fn install_before_build_fails() {
  let ws = Workspace::new(COPY);
  ws.cmd(&["install", "project.json"]).assert().failure();
}

#[cfg(unix)]
#[test]
fn clean_removes_outputs_and_next_build_reruns() {
  let ws = Workspace::new(COPY);
  ws.cmd(&["build", "project.json"]).assert().success();
  assert!(ws.output().exists());

  ws.cmd(&["clean"])
    .assert()
    .success()
    .stdout(predicate::str::contains("Clean complete"));
  assert!(!ws.output().exists());

  ws.cmd(&["build", "project.json"])
    .assert()
    .success()
    .stdout(predicate::str::contains("Build complete"));
  assert!(ws.output().exists());
}

#[test]
fn clean_without_graph_is_a_no_op() {
  let ws = Workspace::new(COPY);
  ws.cmd(&["clean"])
    .assert()
    .success()
    .stdout(predicate::str::contains("Nothing to clean"));
}
