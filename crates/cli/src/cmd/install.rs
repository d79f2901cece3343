//! Implementation of the `brick install` command.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

use brick_lib::install::InstallOptions;
use brick_lib::lock::Operation;

use super::open_resolved;
use crate::output::{print_error, print_info, print_item, print_stat, print_success};

pub struct InstallArgs {
  pub install_root: Option<PathBuf>,
  pub clean_install_root: bool,
  pub dry_run: bool,
  pub keep_going: bool,
  pub products: Vec<String>,
}

/// Copies the installable artifacts into the install root.
///
/// Installs whatever the last build left on disk; it does not build first.
pub fn cmd_install(project_file: &Path, build_dir: &Path, args: InstallArgs) -> Result<()> {
  let (project, _) = open_resolved(project_file, build_dir, Operation::Install)?;
  project.save().context("Failed to store build graph")?;

  let install_root = args
    .install_root
    .unwrap_or_else(|| project.build_directory().join("install-root"));
  let options = InstallOptions {
    install_root: install_root.clone(),
    remove_existing_installation: args.clean_install_root,
    dry_run: args.dry_run,
    keep_going: args.keep_going,
  };

  let report = project.install(&args.products, &options).context("Install failed")?;

  for (source, target) in &report.installed {
    print_item(&format!("{} -> {}", source.display(), target.display()));
  }
  for failure in &report.failures {
    print_error(&failure.to_string());
  }

  if args.dry_run {
    print_info(&format!("Dry run - {} file(s) would be installed", report.installed.len()));
  } else if report.is_success() {
    print_success("Install complete");
  }
  print_stat("Install root", &install_root.display().to_string());
  print_stat("Files", &report.installed.len().to_string());

  if !report.is_success() {
    bail!("{} file(s) failed to install", report.failures.len());
  }
  Ok(())
}
