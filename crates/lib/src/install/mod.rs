//! Copying installable artifacts into an install root.
//!
//! Target path: `install_root / prefix / dir / name`, where `name` is the
//! artifact's file name, or its path relative to the install `source_base`.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::graph::{ArtifactId, BuildGraph};
use crate::platform::paths::{home_dir, is_filesystem_root, relative_components};
use crate::resolved::InstallSpec;

#[derive(Debug, Error)]
pub enum InstallError {
  #[error("refusing to remove install root {}: it is the filesystem root or the home directory", .0.display())]
  UnsafeInstallRoot(PathBuf),

  #[error("failed to remove install root {}: {source}", path.display())]
  RemoveRoot {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("{} is not below its install source base {}", path.display(), base.display())]
  OutsideSourceBase { path: PathBuf, base: PathBuf },

  #[error("cannot install {}: file does not exist (was the product built?)", .0.display())]
  MissingFile(PathBuf),

  #[error("failed to create directory {}: {source}", path.display())]
  CreateDir {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to copy {} to {}: {source}", from.display(), to.display())]
  Copy {
    from: PathBuf,
    to: PathBuf,
    #[source]
    source: io::Error,
  },
}

#[derive(Debug, Clone, Default)]
pub struct InstallOptions {
  pub install_root: PathBuf,
  /// Wipe the install root before copying.
  pub remove_existing_installation: bool,
  /// Report what would be copied without touching the file system.
  pub dry_run: bool,
  /// Log and skip failed copies instead of stopping at the first one.
  pub keep_going: bool,
}

/// An installable artifact with its resolved target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallableArtifact {
  pub artifact: ArtifactId,
  pub product: String,
  pub source: PathBuf,
  /// Target path relative to the install root.
  pub relative_target: PathBuf,
}

impl InstallableArtifact {
  pub fn target(&self, install_root: &Path) -> PathBuf {
    install_root.join(&self.relative_target)
  }
}

#[derive(Debug, Default)]
pub struct InstallReport {
  /// Copied files as `(source, target)` pairs; planned copies in a dry run.
  pub installed: Vec<(PathBuf, PathBuf)>,
  pub failures: Vec<InstallError>,
}

impl InstallReport {
  pub fn is_success(&self) -> bool {
    self.failures.is_empty()
  }
}

/// Target path of `path` relative to the install root.
pub fn relative_target(spec: &InstallSpec, path: &Path) -> Result<PathBuf, InstallError> {
  let name = match &spec.source_base {
    Some(base) => path
      .strip_prefix(base)
      .map(Path::to_path_buf)
      .map_err(|_| InstallError::OutsideSourceBase {
        path: path.to_path_buf(),
        base: base.clone(),
      })?,
    None => path.file_name().map(PathBuf::from).unwrap_or_default(),
  };
  Ok(
    relative_components(&spec.prefix)
      .join(relative_components(&spec.dir))
      .join(relative_components(&name)),
  )
}

/// Installable artifacts of `products` (all products when empty), sorted by target.
pub fn installable_artifacts(graph: &BuildGraph, products: &[String]) -> Result<Vec<InstallableArtifact>, InstallError> {
  let mut out = Vec::new();
  for artifact in graph.artifacts() {
    if !products.is_empty() && !products.contains(&artifact.product) {
      continue;
    }
    let Some(spec) = &artifact.install else {
      continue;
    };
    out.push(InstallableArtifact {
      artifact: artifact.id,
      product: artifact.product.clone(),
      source: artifact.path().to_path_buf(),
      relative_target: relative_target(spec, artifact.path())?,
    });
  }
  out.sort_by(|a, b| a.relative_target.cmp(&b.relative_target));
  Ok(out)
}

/// Copies every installable artifact of `products` into the install root.
///
/// Refusing to remove an unsafe install root is always fatal. Other
/// failures stop the install unless `keep_going` is set, in which case they
/// are collected in the report.
pub fn install(graph: &BuildGraph, products: &[String], options: &InstallOptions) -> Result<InstallReport, InstallError> {
  let root = &options.install_root;
  info!(install_root = %root.display(), dry_run = options.dry_run, "starting install");

  if options.remove_existing_installation {
    remove_install_root(root, options.dry_run)?;
  }

  let mut report = InstallReport::default();
  for item in installable_artifacts(graph, products)? {
    let target = item.target(root);
    if options.dry_run {
      debug!(from = %item.source.display(), to = %target.display(), "would install");
      report.installed.push((item.source, target));
      continue;
    }

    match copy_file(&item.source, &target) {
      Ok(()) => {
        info!(from = %item.source.display(), to = %target.display(), "installed");
        report.installed.push((item.source, target));
      }
      Err(e) if options.keep_going => {
        error!(error = %e, "install failed");
        report.failures.push(e);
      }
      Err(e) => return Err(e),
    }
  }

  info!(
    installed = report.installed.len(),
    failed = report.failures.len(),
    "install complete"
  );
  Ok(report)
}

fn remove_install_root(root: &Path, dry_run: bool) -> Result<(), InstallError> {
  // Compare canonical paths; `/tmp/..` is the root too.
  let resolved = dunce::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
  let home = home_dir().map(|h| dunce::canonicalize(&h).unwrap_or(h));
  if is_filesystem_root(&resolved) || home.as_deref() == Some(resolved.as_path()) || root.as_os_str().is_empty() {
    return Err(InstallError::UnsafeInstallRoot(root.to_path_buf()));
  }

  if dry_run {
    debug!(install_root = %resolved.display(), "would remove install root");
    return Ok(());
  }
  match std::fs::remove_dir_all(&resolved) {
    Ok(()) => {
      warn!(install_root = %resolved.display(), "removed existing installation");
      Ok(())
    }
    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
    Err(source) => Err(InstallError::RemoveRoot { path: resolved, source }),
  }
}

fn copy_file(from: &Path, to: &Path) -> Result<(), InstallError> {
  if !from.is_file() {
    return Err(InstallError::MissingFile(from.to_path_buf()));
  }
  if let Some(parent) = to.parent() {
    std::fs::create_dir_all(parent).map_err(|source| InstallError::CreateDir {
      path: parent.to_path_buf(),
      source,
    })?;
  }
  std::fs::copy(from, to).map_err(|source| InstallError::Copy {
    from: from.to_path_buf(),
    to: to.to_path_buf(),
    source,
  })?;
  Ok(())
}
