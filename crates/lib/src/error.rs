//! Crate-level error for callers that want a single type.

use thiserror::Error;

use crate::env::EnvironmentError;
use crate::execute::ExecuteError;
use crate::graph::GraphError;
use crate::install::InstallError;
use crate::lock::LockError;
use crate::persist::PersistError;
use crate::resolve::ResolveError;
use crate::scan::ScanError;
use crate::script::ScriptError;

#[derive(Debug, Error)]
pub enum Error {
  #[error(transparent)]
  Resolve(#[from] ResolveError),

  #[error(transparent)]
  Execute(#[from] ExecuteError),

  #[error(transparent)]
  Install(#[from] InstallError),

  #[error(transparent)]
  Persist(#[from] PersistError),

  #[error(transparent)]
  Lock(#[from] LockError),

  #[error(transparent)]
  Graph(#[from] GraphError),

  #[error(transparent)]
  Environment(#[from] EnvironmentError),

  #[error(transparent)]
  Script(#[from] ScriptError),

  #[error(transparent)]
  Scan(#[from] ScanError),

  #[error("no build graph in {0}; resolve the project first")]
  NotResolved(std::path::PathBuf),

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
