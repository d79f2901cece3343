//! Implementation of the `brick resolve` command.

use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};

use brick_lib::BuildProject;
use brick_lib::lock::Operation;
use brick_lib::resolve::{ResolveConfig, ResolveSummary};

use super::{build_directory, read_project};
use crate::output::{format_duration, print_info, print_stat, print_success};

/// Resolves the project model into the stored build graph without building anything.
pub fn cmd_resolve(project_file: &Path, build_dir: &Path, force_prepare: bool) -> Result<()> {
  let start = Instant::now();
  let model = read_project(project_file)?;
  let build_dir = build_directory(build_dir)?;

  let mut project = BuildProject::open(&build_dir, Operation::Resolve).context("Failed to open build directory")?;
  let mut config = ResolveConfig::new(&build_dir);
  config.force_prepare = force_prepare;
  let summary = project.resolve_with(&model, &config).context("Resolve failed")?;
  let path = project.save().context("Failed to store build graph")?;

  print_success(&format!("Resolved {}", model.name));
  print_summary(&summary);
  print_stat("Build graph", &path.display().to_string());
  print_stat("Duration", &format_duration(start.elapsed()));
  Ok(())
}

pub(super) fn print_summary(summary: &ResolveSummary) {
  print_stat("Products", &summary.products.to_string());
  print_stat("Transformers created", &summary.transformers_created.to_string());
  print_stat("Transformers kept", &summary.transformers_rescued.to_string());
  print_stat("Transformers removed", &summary.transformers_removed.to_string());
  print_stat("Prepare scripts run", &summary.prepare_runs.to_string());
  for path in &summary.removed_files {
    print_info(&format!("Removed stale output {}", path.display()));
  }
}
