//! Types for transformer execution.
//!
//! This module defines the error types, the build report and the
//! configuration for running a build graph.

use std::path::PathBuf;

use thiserror::Error;

use crate::env::EnvironmentError;
use crate::graph::TransformerId;
use crate::script::ScriptError;

/// Why a transformer was not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
  /// A transformer it depends on failed or was itself skipped.
  FailedDependency(TransformerId),
  /// Another transformer failed and keep-going is off.
  BuildAborted,
  /// The build was canceled before it was dispatched.
  Canceled,
}

impl std::fmt::Display for SkipReason {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      SkipReason::FailedDependency(id) => write!(f, "dependency {id} failed"),
      SkipReason::BuildAborted => write!(f, "build aborted"),
      SkipReason::Canceled => write!(f, "canceled"),
    }
  }
}

/// Errors that can occur while running a transformer's commands.
#[derive(Debug, Error)]
pub enum ExecuteError {
  /// The process could not be started.
  #[error("cannot start {program}: {source}")]
  Spawn {
    program: String,
    #[source]
    source: std::io::Error,
  },

  /// The process exited with a code above the command's maximum.
  ///
  /// `output` holds the filtered stderr followed by stdout.
  #[error("command failed with exit code {code:?}: {command}")]
  ExitCode {
    command: String,
    code: Option<i32>,
    output: String,
  },

  /// A script command or output filter threw.
  #[error("script failed: {0}")]
  Script(#[from] ScriptError),

  /// The product build environment could not be set up.
  #[error(transparent)]
  Environment(#[from] EnvironmentError),

  /// An output that must always be updated was not created.
  #[error("output was not created: {}", .0.display())]
  OutputNotCreated(PathBuf),

  /// The build was canceled while the command ran.
  #[error("canceled")]
  Canceled,

  /// A worker task panicked.
  #[error("worker task failed: {0}")]
  Join(String),

  /// I/O error during execution.
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  /// The transformer graph has a cycle.
  #[error("cycle detected in transformer graph")]
  CycleDetected,

  /// A requested product is not part of the build graph.
  #[error("unknown product: {0}")]
  UnknownProduct(String),

  /// The graph changed shape under the executor.
  #[error("inconsistent build graph: {0}")]
  Internal(String),
}

impl ExecuteError {
  /// What the failed process printed, if anything.
  pub fn command_output(&self) -> Option<&str> {
    match self {
      ExecuteError::ExitCode { output, .. } if !output.trim().is_empty() => Some(output.trim_end()),
      _ => None,
    }
  }
}

/// One transformer that failed, with enough context to report it.
#[derive(Debug)]
pub struct TransformerFailure {
  pub transformer: TransformerId,
  pub product: String,
  pub rule: String,
  pub inputs: Vec<PathBuf>,
  pub outputs: Vec<PathBuf>,
  /// Description of the command that failed, if one had started.
  pub command: Option<String>,
  pub error: ExecuteError,
}

impl std::fmt::Display for TransformerFailure {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}/{} ({}): ", self.product, self.rule, self.transformer)?;
    if let Some(command) = &self.command {
      write!(f, "{command}: ")?;
    }
    write!(f, "{}", self.error)
  }
}

/// Outcome of one executor run.
#[derive(Debug, Default)]
pub struct BuildReport {
  /// Transformers whose commands ran successfully.
  pub executed: Vec<TransformerId>,

  /// Transformers that were not stale.
  pub up_to_date: Vec<TransformerId>,

  /// Every failure, in completion order. Without keep-going there is at most one.
  pub failures: Vec<TransformerFailure>,

  /// Transformers that were never dispatched.
  pub skipped: Vec<(TransformerId, SkipReason)>,

  /// Commands that would have run, in dispatch order (dry run only).
  pub dry_run_commands: Vec<String>,

  pub canceled: bool,
}

impl BuildReport {
  pub fn is_success(&self) -> bool {
    self.failures.is_empty() && self.skipped.is_empty() && !self.canceled
  }

  /// Number of transformers the report accounts for.
  pub fn total(&self) -> usize {
    self.executed.len() + self.up_to_date.len() + self.failures.len() + self.skipped.len()
  }
}

/// Configuration for build execution.
#[derive(Debug, Clone)]
pub struct ExecuteConfig {
  /// Maximum number of transformers to run in parallel.
  pub jobs: usize,

  /// Keep running independent transformers after a failure.
  pub keep_going: bool,

  /// Describe commands instead of running them.
  pub dry_run: bool,

  /// Read output timestamps from disk instead of the stored ones.
  pub force_timestamp_check: bool,
}

impl Default for ExecuteConfig {
  fn default() -> Self {
    Self {
      jobs: num_cpus(),
      keep_going: false,
      dry_run: false,
      force_timestamp_check: false,
    }
  }
}

/// Get the number of CPUs for default parallelism.
fn num_cpus() -> usize {
  std::thread::available_parallelism().map(|p| p.get()).unwrap_or(4)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn build_report_success_when_empty() {
    let report = BuildReport::default();
    assert!(report.is_success());
    assert_eq!(report.total(), 0);
  }

  #[test]
  fn build_report_failure() {
    let report = BuildReport {
      executed: vec![TransformerId(0)],
      failures: vec![TransformerFailure {
        transformer: TransformerId(1),
        product: "app".to_string(),
        rule: "compiler".to_string(),
        inputs: vec![PathBuf::from("/src/a.c")],
        outputs: vec![PathBuf::from("/build/a.o")],
        command: Some("cc -c a.c".to_string()),
        error: ExecuteError::ExitCode {
          command: "cc -c a.c".to_string(),
          code: Some(1),
          output: "a.c:3: error: expected ';'\n".to_string(),
        },
      }],
      skipped: vec![(TransformerId(2), SkipReason::FailedDependency(TransformerId(1)))],
      ..Default::default()
    };
    assert!(!report.is_success());
    assert_eq!(report.total(), 3);
    assert_eq!(
      report.failures[0].to_string(),
      "app/compiler (t1): cc -c a.c: command failed with exit code Some(1): cc -c a.c"
    );
    assert_eq!(report.failures[0].error.command_output(), Some("a.c:3: error: expected ';'"));
  }

  #[test]
  fn silent_failure_has_no_command_output() {
    let error = ExecuteError::ExitCode {
      command: "false".to_string(),
      code: Some(1),
      output: "\n".to_string(),
    };
    assert_eq!(error.command_output(), None);
    assert_eq!(ExecuteError::Canceled.command_output(), None);
  }

  #[test]
  fn canceled_report_is_not_success() {
    let report = BuildReport {
      canceled: true,
      ..Default::default()
    };
    assert!(!report.is_success());
  }

  #[test]
  fn skip_reason_display() {
    assert_eq!(
      SkipReason::FailedDependency(TransformerId(3)).to_string(),
      "dependency t3 failed"
    );
    assert_eq!(SkipReason::BuildAborted.to_string(), "build aborted");
  }

  #[test]
  fn execute_config_default_jobs() {
    let config = ExecuteConfig::default();
    assert!(config.jobs >= 1);
    assert!(!config.keep_going);
    assert!(!config.dry_run);
  }
}
