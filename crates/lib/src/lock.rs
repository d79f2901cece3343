//! Build directory locking.
//!
//! Commands that write the stored graph or generated files hold an
//! exclusive lock for the whole session; `list` only reads and shares the
//! directory with other readers. The exclusive holder records who it is in
//! the lock file so a refused command can name it, and empties the file
//! again when it lets go.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::consts::{APP_NAME, LOCK_FILENAME};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
  Shared,
  Exclusive,
}

/// What a session does with the build directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
  Resolve,
  Build,
  Install,
  Clean,
  List,
}

impl Operation {
  /// Everything except listing rewrites the stored graph.
  pub fn mode(self) -> LockMode {
    match self {
      Operation::List => LockMode::Shared,
      Operation::Resolve | Operation::Build | Operation::Install | Operation::Clean => LockMode::Exclusive,
    }
  }
}

impl fmt::Display for Operation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Operation::Resolve => "resolve",
      Operation::Build => "build",
      Operation::Install => "install",
      Operation::Clean => "clean",
      Operation::List => "list",
    };
    write!(f, "{APP_NAME} {name}")
  }
}

/// Written into the lock file by the exclusive holder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHolder {
  pub pid: u32,
  pub operation: Operation,
  pub started_at_unix: u64,
}

impl LockHolder {
  fn current(operation: Operation) -> Self {
    Self {
      pid: std::process::id(),
      operation,
      started_at_unix: SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs(),
    }
  }

  pub fn started_at(&self) -> String {
    humantime::format_rfc3339_seconds(UNIX_EPOCH + Duration::from_secs(self.started_at_unix)).to_string()
  }
}

#[derive(Debug, Error)]
pub enum LockError {
  #[error(
    "build directory {} is busy: `{}` (PID {}) has been writing it since {}",
    build_directory.display(),
    holder.operation,
    holder.pid,
    holder.started_at()
  )]
  Writing {
    build_directory: PathBuf,
    holder: LockHolder,
  },

  #[error(
    "cannot {operation}: build directory {} is in use by another {app} process\n\
     If none is running, remove {}",
    build_directory.display(),
    lock_path.display(),
    app = APP_NAME
  )]
  InUse {
    operation: Operation,
    build_directory: PathBuf,
    lock_path: PathBuf,
  },

  #[error("cannot open lock file {}: {source}", path.display())]
  Open {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("cannot record lock holder in {}: {source}", path.display())]
  Record {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("locking {} failed: {source}", path.display())]
  Lock {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

/// Held lock on a build directory; released on drop.
#[derive(Debug)]
pub struct BuildDirLock {
  file: File,
  path: PathBuf,
  operation: Operation,
}

impl BuildDirLock {
  /// Locks `build_directory` for `operation` without waiting.
  ///
  /// The directory must exist.
  pub fn acquire(build_directory: &Path, operation: Operation) -> Result<Self, LockError> {
    let path = build_directory.join(LOCK_FILENAME);
    let file = OpenOptions::new()
      .read(true)
      .write(true)
      .create(true)
      .truncate(false)
      .open(&path)
      .map_err(|source| LockError::Open {
        path: path.clone(),
        source,
      })?;

    match try_lock(&file, operation.mode()) {
      Ok(()) => {}
      Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
        return Err(match read_holder(&file) {
          Some(holder) => LockError::Writing {
            build_directory: build_directory.to_path_buf(),
            holder,
          },
          None => LockError::InUse {
            operation,
            build_directory: build_directory.to_path_buf(),
            lock_path: path,
          },
        });
      }
      Err(source) => return Err(LockError::Lock { path, source }),
    }

    let lock = BuildDirLock { file, path, operation };
    if operation.mode() == LockMode::Exclusive {
      lock.record(&LockHolder::current(operation))?;
    }
    debug!(lock = %lock.path.display(), %operation, "build directory locked");
    Ok(lock)
  }

  pub fn operation(&self) -> Operation {
    self.operation
  }

  /// The recorded exclusive holder; `None` under a shared lock.
  pub fn holder(&self) -> Option<LockHolder> {
    read_holder(&self.file)
  }

  fn record(&self, holder: &LockHolder) -> Result<(), LockError> {
    let failed = |source| LockError::Record {
      path: self.path.clone(),
      source,
    };
    let mut file = &self.file;
    file.set_len(0).map_err(failed)?;
    file.seek(SeekFrom::Start(0)).map_err(failed)?;
    serde_json::to_writer(&mut file, holder).map_err(|e| failed(io::Error::other(e)))?;
    file.flush().map_err(failed)
  }
}

impl Drop for BuildDirLock {
  fn drop(&mut self) {
    if self.operation.mode() == LockMode::Exclusive
      && let Err(e) = self.file.set_len(0)
    {
      warn!(lock = %self.path.display(), error = %e, "cannot clear lock holder");
    }
  }
}

/// Reads the holder through an already open handle.
fn read_holder(file: &File) -> Option<LockHolder> {
  let mut file = file;
  file.seek(SeekFrom::Start(0)).ok()?;
  let mut contents = String::new();
  file.read_to_string(&mut contents).ok()?;
  serde_json::from_str(&contents).ok()
}

#[cfg(unix)]
fn try_lock(file: &File, mode: LockMode) -> io::Result<()> {
  use rustix::fs::{FlockOperation, flock};

  let operation = match mode {
    LockMode::Shared => FlockOperation::NonBlockingLockShared,
    LockMode::Exclusive => FlockOperation::NonBlockingLockExclusive,
  };
  flock(file, operation).map_err(io::Error::from)
}

#[cfg(not(unix))]
fn try_lock(file: &File, mode: LockMode) -> io::Result<()> {
  let result = match mode {
    LockMode::Shared => file.try_lock_shared(),
    LockMode::Exclusive => file.try_lock(),
  };
  result.map_err(|e| match e {
    std::fs::TryLockError::WouldBlock => io::ErrorKind::WouldBlock.into(),
    std::fs::TryLockError::Error(e) => e,
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  #[test]
  fn only_listing_shares_the_directory() {
    assert_eq!(Operation::List.mode(), LockMode::Shared);
    for op in [Operation::Resolve, Operation::Build, Operation::Install, Operation::Clean] {
      assert_eq!(op.mode(), LockMode::Exclusive, "{op}");
    }
    assert_eq!(Operation::Build.to_string(), "brick build");
  }

  #[test]
  fn writer_records_itself() {
    let temp = TempDir::new().unwrap();
    let lock = BuildDirLock::acquire(temp.path(), Operation::Resolve).unwrap();

    let holder = lock.holder().unwrap();
    assert_eq!(holder.operation, Operation::Resolve);
    assert_eq!(holder.pid, std::process::id());
    assert!(holder.started_at().ends_with('Z'));
  }

  #[test]
  fn readers_coexist_and_record_nothing() {
    let temp = TempDir::new().unwrap();
    let a = BuildDirLock::acquire(temp.path(), Operation::List).unwrap();
    let _b = BuildDirLock::acquire(temp.path(), Operation::List).unwrap();
    assert_eq!(a.holder(), None);
  }

  #[cfg(unix)]
  #[test]
  fn second_writer_is_told_who_holds_the_lock() {
    let temp = TempDir::new().unwrap();
    let _held = BuildDirLock::acquire(temp.path(), Operation::Build).unwrap();
    let err = BuildDirLock::acquire(temp.path(), Operation::Clean).unwrap_err();

    assert!(
      matches!(err, LockError::Writing { ref holder, .. } if holder.operation == Operation::Build),
      "{err}"
    );
    assert!(err.to_string().contains("`brick build`"), "{err}");
  }

  #[cfg(unix)]
  #[test]
  fn reader_blocks_writer_without_a_holder() {
    let temp = TempDir::new().unwrap();
    let _reader = BuildDirLock::acquire(temp.path(), Operation::List).unwrap();
    let err = BuildDirLock::acquire(temp.path(), Operation::Build).unwrap_err();
    assert!(matches!(err, LockError::InUse { operation: Operation::Build, .. }), "{err}");
  }

  #[test]
  fn released_writer_leaves_no_holder_behind() {
    let temp = TempDir::new().unwrap();
    drop(BuildDirLock::acquire(temp.path(), Operation::Build).unwrap());

    let reader = BuildDirLock::acquire(temp.path(), Operation::List).unwrap();
    assert_eq!(reader.holder(), None);
    assert_eq!(std::fs::read_to_string(temp.path().join(LOCK_FILENAME)).unwrap(), "");
  }
}
