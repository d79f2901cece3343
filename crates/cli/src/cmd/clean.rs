//! Implementation of the `brick clean` command.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;

use brick_lib::BuildProject;
use brick_lib::lock::Operation;

use super::build_directory;
use crate::output::{print_info, print_stat, print_success};

/// Deletes every generated file the stored graph knows about.
///
/// Source files and the graph itself are kept; the next build reruns every
/// transformer.
pub fn cmd_clean(build_dir: &Path) -> Result<()> {
  let build_dir = build_directory(build_dir)?;
  let mut project = BuildProject::open(&build_dir, Operation::Clean).context("Failed to open build directory")?;

  if !project.is_resolved() {
    print_info("Nothing to clean");
    return Ok(());
  }

  let removed = project.clean().context("Clean failed")?;
  info!(build_dir = %build_dir.display(), "cleaned");
  print_success("Clean complete");
  print_stat("Files removed", &removed.len().to_string());
  Ok(())
}
