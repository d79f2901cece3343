mod build;
mod clean;
mod install;
mod list;
mod resolve;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use brick_lib::BuildProject;
use brick_lib::lock::Operation;
use brick_lib::resolve::ResolveSummary;
use brick_lib::resolved::ResolvedProject;

pub use build::{BuildArgs, cmd_build};
pub use clean::cmd_clean;
pub use install::{InstallArgs, cmd_install};
pub use list::cmd_list;
pub use resolve::cmd_resolve;

/// Reads the resolved project model written by the project evaluator.
fn read_project(path: &Path) -> Result<ResolvedProject> {
  let content = fs::read_to_string(path).with_context(|| format!("Failed to read project file {}", path.display()))?;
  serde_json::from_str(&content).with_context(|| format!("Failed to parse project file {}", path.display()))
}

/// Creates the build directory and returns its absolute path.
fn build_directory(path: &Path) -> Result<PathBuf> {
  fs::create_dir_all(path).with_context(|| format!("Failed to create build directory {}", path.display()))?;
  dunce::canonicalize(path).with_context(|| format!("Failed to resolve build directory {}", path.display()))
}

/// Opens the build directory for `operation` and resolves `project_file` into it.
fn open_resolved(project_file: &Path, build_dir: &Path, operation: Operation) -> Result<(BuildProject, ResolveSummary)> {
  let model = read_project(project_file)?;
  let build_dir = build_directory(build_dir)?;
  let mut project = BuildProject::open(&build_dir, operation).context("Failed to open build directory")?;
  let summary = project.resolve(&model).context("Resolve failed")?;
  Ok((project, summary))
}
