//! Shared test helpers for build session integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde_json::{Value, json};
use tempfile::TempDir;

use brick_lib::BuildProject;
use brick_lib::execute::{BuildReport, Canceler, ExecuteConfig};
use brick_lib::resolved::ResolvedProject;

/// Prepare script copying the single input to the single output.
pub const COPY: &str = r#"return { program = "cp", arguments = { input.filePath, output.filePath } }"#;

/// Prepare script concatenating every `mid` input into the output, in path order.
pub const CONCAT: &str = r#"
local args = { "-c", 'cat "$@" > "$0"', output.filePath }
for _, a in ipairs(inputs.mid) do
  table.insert(args, a.filePath)
end
return { program = "sh", arguments = args, description = "linking " .. output.fileName }
"#;

/// Isolated sources and build directory.
pub struct TestEnv {
  pub temp: TempDir,
}

impl TestEnv {
  pub fn new() -> Self {
    Self {
      temp: TempDir::new().unwrap(),
    }
  }

  pub fn src(&self, name: &str) -> PathBuf {
    self.temp.path().join("src").join(name)
  }

  pub fn build_dir(&self) -> PathBuf {
    self.temp.path().join("build")
  }

  /// Path of a generated file of `product`.
  pub fn out(&self, product: &str, name: &str) -> PathBuf {
    self.build_dir().join(product).join(name)
  }

  /// Write a source file relative to the source directory.
  pub fn write_source(&self, name: &str, content: &str) -> PathBuf {
    let path = self.src(name);
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, content).unwrap();
    path
  }

  pub fn open(&self) -> BuildProject {
    BuildProject::load_or_new(self.build_dir()).unwrap()
  }
}

/// Parses a project model the way the CLI reads it.
pub fn model(value: Value) -> ResolvedProject {
  serde_json::from_value(value).unwrap()
}

pub fn source(path: &Path, tag: &str) -> Value {
  json!({ "path": path, "file_tags": [tag] })
}

/// A rule turning each `from` input into `{baseName}.{to}`.
pub fn per_input_rule(name: &str, from: &str, to: &str, prepare: &str) -> Value {
  json!({
    "name": name,
    "inputs": [from],
    "artifacts": [{ "file_path": format!("$${{input.baseName}}.{to}"), "file_tags": [to] }],
    "prepare": { "source": prepare }
  })
}

/// A multiplex rule combining every `mid` input into `{product}.{to}`.
pub fn link_rule(to: &str) -> Value {
  json!({
    "name": "link",
    "inputs": ["mid"],
    "multiplex": true,
    "artifacts": [{ "file_path": format!("$${{product.name}}.{to}"), "file_tags": [to] }],
    "prepare": { "source": CONCAT }
  })
}

pub fn config() -> ExecuteConfig {
  ExecuteConfig {
    jobs: 2,
    ..Default::default()
  }
}

pub async fn build(project: &mut BuildProject) -> BuildReport {
  project.build(&[], &config(), &Canceler::new()).await.unwrap()
}

/// Moves the modification time of `path` into the future.
pub fn touch_later(path: &Path) {
  let file = std::fs::File::options().write(true).open(path).unwrap();
  file
    .set_modified(SystemTime::now() + Duration::from_secs(10))
    .unwrap();
}
