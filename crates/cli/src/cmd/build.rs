//! Implementation of the `brick build` command.
//!
//! Resolves the project model into the build graph, then runs every stale
//! transformer of the requested products. Ctrl-C cancels the build: nothing
//! new is dispatched and running processes are killed.

use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use tracing::warn;

use brick_lib::BuildProject;
use brick_lib::execute::{BuildReport, Canceler, ExecuteConfig};
use brick_lib::lock::Operation;

use super::open_resolved;
use crate::output::{
  format_duration, print_command_output, print_error, print_info, print_item, print_stat, print_success, print_warning,
};

pub struct BuildArgs {
  pub jobs: Option<usize>,
  pub keep_going: bool,
  pub dry_run: bool,
  pub check_outputs: bool,
  pub products: Vec<String>,
}

pub fn cmd_build(project_file: &Path, build_dir: &Path, args: BuildArgs) -> Result<()> {
  let start = Instant::now();
  let (mut project, _) = open_resolved(project_file, build_dir, Operation::Build)?;

  let mut config = ExecuteConfig {
    keep_going: args.keep_going,
    dry_run: args.dry_run,
    force_timestamp_check: args.check_outputs,
    ..Default::default()
  };
  if let Some(jobs) = args.jobs {
    config.jobs = jobs;
  }

  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let canceler = Canceler::new();
  let report = rt
    .block_on(async {
      let interrupt = canceler.clone();
      tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
          warn!("interrupted, canceling build");
          interrupt.cancel();
        }
      });
      project.build(&args.products, &config, &canceler).await
    })
    .context("Build failed")?;

  if args.dry_run {
    print_info(&format!("Dry run - {} command(s) would run", report.dry_run_commands.len()));
    for command in &report.dry_run_commands {
      print_item(command);
    }
    return Ok(());
  }

  print_report(&project, &report);
  print_stat("Duration", &format_duration(start.elapsed()));

  if report.canceled {
    bail!("build canceled");
  }
  if !report.is_success() {
    bail!("{} transformer(s) failed", report.failures.len());
  }
  Ok(())
}

fn print_report(project: &BuildProject, report: &BuildReport) {
  for failure in &report.failures {
    print_error(&failure.to_string());
    if let Some(output) = failure.error.command_output() {
      print_command_output(output);
    }
    for output in &failure.outputs {
      print_item(&output.display().to_string());
    }
  }
  for (id, reason) in &report.skipped {
    print_warning(&format!("Skipped {}: {reason}", project.graph().transformer_label(*id)));
  }

  if report.is_success() {
    if report.executed.is_empty() {
      print_success("Nothing to do");
    } else {
      print_success("Build complete");
    }
  }
  print_stat("Executed", &report.executed.len().to_string());
  print_stat("Up to date", &report.up_to_date.len().to_string());
  if !report.failures.is_empty() {
    print_stat("Failed", &report.failures.len().to_string());
  }
  if !report.skipped.is_empty() {
    print_stat("Skipped", &report.skipped.len().to_string());
  }
}
