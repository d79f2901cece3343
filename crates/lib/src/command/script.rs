//! Script command execution.
//!
//! Script commands run on the blocking pool. They cannot be interrupted;
//! cancellation only takes effect before one starts. Every property the
//! script reads is reported to the observer so the next resolve can tell
//! whether the command must run again.

use std::sync::Arc;

use tracing::info;

use super::ScriptCommand;
use crate::execute::{Canceler, ExecuteError};
use crate::script::{PropertyObserver, ScriptEngine, ScriptScope};

pub async fn run_script(
  cmd: &ScriptCommand,
  scope: ScriptScope,
  engine: Arc<dyn ScriptEngine>,
  observer: Arc<dyn PropertyObserver>,
  canceler: &Canceler,
) -> Result<(), ExecuteError> {
  if canceler.is_canceled() {
    return Err(ExecuteError::Canceled);
  }
  if !cmd.silent {
    info!(description = %cmd.description, "running script command");
  }

  let cmd = cmd.clone();
  tokio::task::spawn_blocking(move || engine.run_command(&cmd, &scope, observer))
    .await
    .map_err(|e| ExecuteError::Join(e.to_string()))??;
  Ok(())
}
