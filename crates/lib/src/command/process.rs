//! Process command execution.
//!
//! Runs one [`ProcessCommand`] with the product's build environment as the
//! complete child environment, applies output filters and enforces the
//! command's maximum exit code.

use std::io::Write;
use std::path::Path;
use std::process::Stdio;

use tempfile::NamedTempFile;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::ProcessCommand;
use crate::execute::{Canceler, ExecuteError};
use crate::script::{Environment, ScriptEngine};

/// Captured output of a finished process, after filtering.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
  pub stdout: String,
  pub stderr: String,
  pub exit_code: i32,
}

/// Execute a process command.
///
/// The child sees only `build_env` overlaid with the command's own
/// environment. `default_dir` is used (and created) when the command does
/// not name a working directory.
pub async fn run_process(
  cmd: &ProcessCommand,
  build_env: &Environment,
  default_dir: &Path,
  engine: &dyn ScriptEngine,
  canceler: &Canceler,
) -> Result<ProcessOutput, ExecuteError> {
  if canceler.is_canceled() {
    return Err(ExecuteError::Canceled);
  }

  let command_line = cmd.command_line();
  if !cmd.silent {
    info!(command = %command_line, "executing command");
  }

  let working_dir = match &cmd.working_directory {
    Some(dir) => dir.clone(),
    None => {
      tokio::fs::create_dir_all(default_dir).await?;
      default_dir.to_path_buf()
    }
  };

  let (arguments, _response_file) = prepare_arguments(cmd, &command_line)?;

  let mut command = Command::new(&cmd.program);
  command
    .args(&arguments)
    .current_dir(&working_dir)
    .env_clear()
    .envs(build_env)
    .envs(&cmd.environment)
    .stdin(Stdio::null())
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true);

  debug!(program = %cmd.program, working_dir = ?working_dir, "spawning process");

  let child = command.spawn().map_err(|source| ExecuteError::Spawn {
    program: cmd.program.clone(),
    source,
  })?;

  // Dropping the wait future kills the child.
  let output = tokio::select! {
    output = child.wait_with_output() => output?,
    _ = canceler.canceled() => {
      debug!(program = %cmd.program, "process killed by cancellation");
      return Err(ExecuteError::Canceled);
    }
  };

  let stdout = filter(engine, cmd.stdout_filter.as_ref(), &output.stdout)?;
  let stderr = filter(engine, cmd.stderr_filter.as_ref(), &output.stderr)?;
  deliver(&stdout, cmd.stdout_file_path.as_deref(), "stdout").await?;
  deliver(&stderr, cmd.stderr_file_path.as_deref(), "stderr").await?;

  let code = output.status.code();
  match code {
    Some(code) if code <= cmd.max_exit_code => {
      if cmd.stderr_file_path.is_none() && !stderr.trim().is_empty() {
        warn!(command = %command_line, stderr = %stderr.trim(), "command succeeded with diagnostics");
      }
      Ok(ProcessOutput {
        stdout,
        stderr,
        exit_code: code,
      })
    }
    _ => Err(ExecuteError::ExitCode {
      command: command_line,
      code,
      output: failure_output(&stderr, &stdout),
    }),
  }
}

/// Joins the captured streams of a failed process, stderr first.
fn failure_output(stderr: &str, stdout: &str) -> String {
  [stderr.trim_end(), stdout.trim_end()]
    .into_iter()
    .filter(|s| !s.is_empty())
    .collect::<Vec<_>>()
    .join("\n")
}

/// Moves trailing arguments into a response file when the command line is too long.
///
/// The returned temp file must outlive the process.
fn prepare_arguments(
  cmd: &ProcessCommand,
  command_line: &str,
) -> Result<(Vec<String>, Option<NamedTempFile>), ExecuteError> {
  let threshold = cmd.response_file_threshold;
  if threshold == 0 || command_line.len() <= threshold || cmd.response_file_argument_index > cmd.arguments.len() {
    return Ok((cmd.arguments.clone(), None));
  }

  let (kept, moved) = cmd.arguments.split_at(cmd.response_file_argument_index);
  let mut file = NamedTempFile::new()?;
  for arg in moved {
    writeln!(file, "{}", response_file_quote(arg))?;
  }
  file.flush()?;

  let mut arguments = kept.to_vec();
  arguments.push(format!("{}{}", cmd.response_file_usage_prefix, file.path().display()));
  debug!(path = ?file.path(), moved = moved.len(), "using response file");
  Ok((arguments, Some(file)))
}

fn response_file_quote(arg: &str) -> String {
  if arg.chars().any(|c| c.is_whitespace() || c == '"' || c == '\\') {
    format!("\"{}\"", arg.replace('\\', "\\\\").replace('"', "\\\""))
  } else {
    arg.to_string()
  }
}

fn filter(
  engine: &dyn ScriptEngine,
  filter: Option<&crate::resolved::Script>,
  raw: &[u8],
) -> Result<String, ExecuteError> {
  let text = String::from_utf8_lossy(raw).into_owned();
  match filter {
    Some(script) if !text.is_empty() => Ok(engine.filter_output(script, &text)?),
    _ => Ok(text),
  }
}

/// Writes captured output to its redirect file, or logs it.
async fn deliver(text: &str, redirect: Option<&Path>, stream: &str) -> Result<(), ExecuteError> {
  match redirect {
    Some(path) => {
      if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
      }
      tokio::fs::write(path, text).await?;
    }
    None => {
      let trimmed = text.trim();
      if !trimmed.is_empty() {
        debug!(stream, output = %trimmed, "command output");
      }
    }
  }
  Ok(())
}

#[cfg(all(test, unix))]
mod tests {
  use super::*;
  use crate::resolved::Script;
  use crate::script::LuaScriptEngine;
  use tempfile::TempDir;
  use tracing_test::traced_test;

  fn base_env() -> Environment {
    Environment::from([("PATH".to_string(), std::env::var("PATH").unwrap_or_default())])
  }

  fn sh(script: &str) -> ProcessCommand {
    ProcessCommand::new("/bin/sh").args(["-c", script])
  }

  async fn run(cmd: &ProcessCommand, env: &Environment, dir: &Path) -> Result<ProcessOutput, ExecuteError> {
    run_process(cmd, env, dir, &LuaScriptEngine::new(), &Canceler::new()).await
  }

  #[tokio::test]
  async fn execute_simple_command() {
    let temp_dir = TempDir::new().unwrap();
    let output = run(&sh("echo hello"), &base_env(), temp_dir.path()).await.unwrap();
    assert_eq!(output.stdout.trim(), "hello");
    assert_eq!(output.exit_code, 0);
  }

  #[tokio::test]
  async fn environment_is_build_env_plus_command_env() {
    let temp_dir = TempDir::new().unwrap();
    let mut env = base_env();
    env.insert("FROM_BUILD".to_string(), "b".to_string());
    let mut cmd = sh("echo \"$FROM_BUILD-$FROM_CMD-${HOME:-unset}\"");
    cmd.environment.insert("FROM_CMD".to_string(), "c".to_string());

    let output = run(&cmd, &env, temp_dir.path()).await.unwrap();
    assert_eq!(output.stdout.trim(), "b-c-unset");
  }

  #[tokio::test]
  async fn exit_code_above_maximum_fails() {
    let temp_dir = TempDir::new().unwrap();
    let result = run(&sh("exit 2"), &base_env(), temp_dir.path()).await;
    assert!(matches!(result, Err(ExecuteError::ExitCode { code: Some(2), .. })));
  }

  #[tokio::test]
  async fn failure_carries_filtered_output() {
    let temp_dir = TempDir::new().unwrap();
    let mut cmd = sh("echo compiling; echo 'a.c:3: error: missing ;' >&2; exit 1");
    cmd.stderr_filter = Some(Script::new("return (output:gsub('error', 'ERROR'))"));

    let err = run(&cmd, &base_env(), temp_dir.path()).await.unwrap_err();
    assert_eq!(err.command_output(), Some("a.c:3: ERROR: missing ;\ncompiling"));
  }

  #[tokio::test]
  #[traced_test]
  async fn stderr_of_successful_command_is_a_warning() {
    let temp_dir = TempDir::new().unwrap();
    run(&sh("echo 'deprecated flag' >&2"), &base_env(), temp_dir.path())
      .await
      .unwrap();
    assert!(logs_contain("command succeeded with diagnostics"));
    assert!(logs_contain("deprecated flag"));
  }

  #[tokio::test]
  async fn exit_code_within_maximum_succeeds() {
    let temp_dir = TempDir::new().unwrap();
    let mut cmd = sh("exit 1");
    cmd.max_exit_code = 1;
    let output = run(&cmd, &base_env(), temp_dir.path()).await.unwrap();
    assert_eq!(output.exit_code, 1);
  }

  #[tokio::test]
  async fn missing_program_is_spawn_error() {
    let temp_dir = TempDir::new().unwrap();
    let cmd = ProcessCommand::new("/nonexistent/brick-test-program");
    let result = run(&cmd, &base_env(), temp_dir.path()).await;
    assert!(matches!(result, Err(ExecuteError::Spawn { .. })));
  }

  #[tokio::test]
  async fn default_working_directory_is_created() {
    let temp_dir = TempDir::new().unwrap();
    let dir = temp_dir.path().join("product");
    run(&sh("touch cwd_marker"), &base_env(), &dir).await.unwrap();
    assert!(dir.join("cwd_marker").exists());
  }

  #[tokio::test]
  async fn stdout_filter_and_redirect() {
    let temp_dir = TempDir::new().unwrap();
    let target = temp_dir.path().join("logs/out.txt");
    let mut cmd = sh("echo 'warning: unused'");
    cmd.stdout_filter = Some(Script::new("return (output:gsub('warning', 'note'))"));
    cmd.stdout_file_path = Some(target.clone());

    run(&cmd, &base_env(), temp_dir.path()).await.unwrap();
    assert_eq!(std::fs::read_to_string(&target).unwrap().trim(), "note: unused");
  }

  #[tokio::test]
  async fn long_command_line_uses_response_file() {
    let temp_dir = TempDir::new().unwrap();
    let mut cmd = ProcessCommand::new("/bin/sh").args([
      "-c",
      "cat \"${0#@}\"",
      "first argument",
      "second",
    ]);
    cmd.response_file_threshold = 10;
    cmd.response_file_argument_index = 2;

    let output = run(&cmd, &base_env(), temp_dir.path()).await.unwrap();
    assert_eq!(output.stdout, "\"first argument\"\nsecond\n");
  }

  #[tokio::test]
  async fn short_command_line_passes_arguments_directly() {
    let cmd = ProcessCommand::new("cc").args(["a.c"]);
    let (args, file) = prepare_arguments(&cmd, &cmd.command_line()).unwrap();
    assert_eq!(args, vec!["a.c"]);
    assert!(file.is_none());
  }

  #[tokio::test]
  async fn canceled_before_start() {
    let temp_dir = TempDir::new().unwrap();
    let canceler = Canceler::new();
    canceler.cancel();
    let marker = temp_dir.path().join("ran");
    let cmd = sh(&format!("touch {}", marker.display()));
    let result = run_process(
      &cmd,
      &base_env(),
      temp_dir.path(),
      &LuaScriptEngine::new(),
      &canceler,
    )
    .await;
    assert!(matches!(result, Err(ExecuteError::Canceled)));
    assert!(!marker.exists());
  }

  #[tokio::test]
  async fn cancel_kills_running_process() {
    let temp_dir = TempDir::new().unwrap();
    let canceler = Canceler::new();
    let trigger = canceler.clone();
    tokio::spawn(async move {
      tokio::time::sleep(std::time::Duration::from_millis(100)).await;
      trigger.cancel();
    });

    let started = std::time::Instant::now();
    let result = run_process(
      &sh("sleep 30"),
      &base_env(),
      temp_dir.path(),
      &LuaScriptEngine::new(),
      &canceler,
    )
    .await;
    assert!(matches!(result, Err(ExecuteError::Canceled)));
    assert!(started.elapsed() < std::time::Duration::from_secs(10));
  }
}
