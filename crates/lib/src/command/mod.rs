//! The two kinds of executable build steps.
//!
//! Commands are plain values built by prepare scripts. A transformer's
//! command list is ordered and compared by value on re-resolve: a different
//! list means the transformer must run again.

pub mod process;
pub mod script;

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::consts::RESPONSE_FILE_PREFIX;
use crate::resolved::{PropertyMap, Script};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
  Process(ProcessCommand),
  Script(ScriptCommand),
}

impl Command {
  /// One human-readable line, used for dry runs and listings.
  pub fn describe(&self) -> String {
    match self {
      Command::Process(cmd) if !cmd.description.is_empty() => cmd.description.clone(),
      Command::Process(cmd) => cmd.command_line(),
      Command::Script(cmd) if !cmd.description.is_empty() => cmd.description.clone(),
      Command::Script(_) => "<script command>".to_string(),
    }
  }

  pub fn is_silent(&self) -> bool {
    match self {
      Command::Process(cmd) => cmd.silent,
      Command::Script(cmd) => cmd.silent,
    }
  }

  /// Environment variables whose value affects this command's result.
  pub fn relevant_environment_variables(&self) -> Option<&BTreeSet<String>> {
    match self {
      Command::Process(cmd) => Some(&cmd.relevant_environment_variables),
      Command::Script(_) => None,
    }
  }
}

fn default_response_file_prefix() -> String {
  RESPONSE_FILE_PREFIX.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessCommand {
  pub program: String,
  #[serde(default)]
  pub arguments: Vec<String>,
  #[serde(default)]
  pub working_directory: Option<PathBuf>,
  /// Added on top of the product build environment.
  #[serde(default)]
  pub environment: BTreeMap<String, String>,
  #[serde(default)]
  pub max_exit_code: i32,
  /// Command lines longer than this go through a response file; 0 disables it.
  #[serde(default)]
  pub response_file_threshold: usize,
  /// First argument moved into the response file.
  #[serde(default)]
  pub response_file_argument_index: usize,
  #[serde(default = "default_response_file_prefix")]
  pub response_file_usage_prefix: String,
  #[serde(default)]
  pub stdout_filter: Option<Script>,
  #[serde(default)]
  pub stderr_filter: Option<Script>,
  #[serde(default)]
  pub stdout_file_path: Option<PathBuf>,
  #[serde(default)]
  pub stderr_file_path: Option<PathBuf>,
  #[serde(default)]
  pub relevant_environment_variables: BTreeSet<String>,
  #[serde(default)]
  pub description: String,
  #[serde(default)]
  pub highlight: String,
  #[serde(default)]
  pub silent: bool,
}

impl ProcessCommand {
  pub fn new(program: impl Into<String>) -> Self {
    Self {
      program: program.into(),
      arguments: Vec::new(),
      working_directory: None,
      environment: BTreeMap::new(),
      max_exit_code: 0,
      response_file_threshold: 0,
      response_file_argument_index: 0,
      response_file_usage_prefix: default_response_file_prefix(),
      stdout_filter: None,
      stderr_filter: None,
      stdout_file_path: None,
      stderr_file_path: None,
      relevant_environment_variables: BTreeSet::new(),
      description: String::new(),
      highlight: String::new(),
      silent: false,
    }
  }

  pub fn args<I, S>(mut self, args: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.arguments.extend(args.into_iter().map(Into::into));
    self
  }

  pub fn description(mut self, description: impl Into<String>) -> Self {
    self.description = description.into();
    self
  }

  /// Program and arguments, quoted where they contain whitespace.
  pub fn command_line(&self) -> String {
    std::iter::once(&self.program)
      .chain(&self.arguments)
      .map(|part| quote(part))
      .collect::<Vec<_>>()
      .join(" ")
  }
}

fn quote(part: &str) -> String {
  if part.is_empty() || part.chars().any(|c| c.is_whitespace() || c == '"') {
    format!("\"{}\"", part.replace('"', "\\\""))
  } else {
    part.to_string()
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScriptCommand {
  pub source_code: String,
  /// Values handed to the script as its `properties` table.
  #[serde(default)]
  pub properties: PropertyMap,
  #[serde(default)]
  pub imports: Vec<PathBuf>,
  #[serde(default)]
  pub description: String,
  #[serde(default)]
  pub silent: bool,
}

impl ScriptCommand {
  pub fn new(source_code: impl Into<String>) -> Self {
    Self {
      source_code: source_code.into(),
      ..Default::default()
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn describe_prefers_description() {
    let cmd = Command::Process(ProcessCommand::new("cc").args(["-c", "a.c"]).description("compiling a.c"));
    assert_eq!(cmd.describe(), "compiling a.c");
  }

  #[test]
  fn describe_falls_back_to_command_line() {
    let cmd = Command::Process(ProcessCommand::new("cc").args(["-DNAME=hello world", "a.c"]));
    assert_eq!(cmd.describe(), "cc \"-DNAME=hello world\" a.c");
  }

  #[test]
  fn script_command_description() {
    let cmd = Command::Script(ScriptCommand::new("print(1)"));
    assert_eq!(cmd.describe(), "<script command>");
  }

  #[test]
  fn command_list_equality_is_by_value() {
    let a = vec![Command::Process(ProcessCommand::new("ld").args(["a.o"]))];
    let b = vec![Command::Process(ProcessCommand::new("ld").args(["a.o"]))];
    let c = vec![Command::Process(ProcessCommand::new("ld").args(["a.o", "b.o"]))];
    assert_eq!(a, b);
    assert_ne!(a, c);
  }

  #[test]
  fn deserialize_defaults() {
    let cmd: Command = serde_json::from_str(r#"{ "type": "process", "program": "true" }"#).unwrap();
    let Command::Process(cmd) = cmd else {
      panic!("expected process command");
    };
    assert_eq!(cmd.response_file_usage_prefix, "@");
    assert_eq!(cmd.max_exit_code, 0);
  }
}
