//! Build graph persistence.
//!
//! The graph of one project is stored as pretty JSON in
//! `{build_dir}/{project}.bg.json`, wrapped in an envelope carrying the
//! format version.
//!
//! ```text
//! build/
//! ├── .brick.lock
//! ├── myproject.bg.json
//! └── <product>/          # product build directories
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::consts::{BUILD_GRAPH_SUFFIX, BUILD_GRAPH_VERSION};
use crate::graph::BuildGraph;

#[derive(Debug, Error)]
pub enum PersistError {
  #[error("failed to create build directory: {0}")]
  CreateDir(#[source] io::Error),

  #[error("failed to read build graph: {0}")]
  Read(#[source] io::Error),

  #[error("failed to write build graph: {0}")]
  Write(#[source] io::Error),

  #[error("failed to parse build graph: {0}")]
  Parse(#[source] serde_json::Error),

  #[error("failed to serialize build graph: {0}")]
  Serialize(#[source] serde_json::Error),

  #[error("unsupported build graph version {found} (expected {expected})")]
  UnsupportedVersion { found: u32, expected: u32 },

  #[error("build directory {} holds graphs of several projects: {}", dir.display(), projects.join(", "))]
  Ambiguous { dir: PathBuf, projects: Vec<String> },
}

#[derive(Serialize)]
struct EnvelopeRef<'a> {
  version: u32,
  graph: &'a BuildGraph,
}

#[derive(Deserialize)]
struct Header {
  version: u32,
}

#[derive(Deserialize)]
struct Envelope {
  graph: BuildGraph,
}

/// Reads and writes build graphs inside one build directory.
#[derive(Debug, Clone)]
pub struct BuildGraphStore {
  build_directory: PathBuf,
}

impl BuildGraphStore {
  pub fn new(build_directory: impl Into<PathBuf>) -> Self {
    Self {
      build_directory: build_directory.into(),
    }
  }

  pub fn build_directory(&self) -> &Path {
    &self.build_directory
  }

  pub fn graph_path(&self, project: &str) -> PathBuf {
    self.build_directory.join(format!("{project}{BUILD_GRAPH_SUFFIX}"))
  }

  /// Loads the stored graph of `project`.
  ///
  /// Returns `Ok(None)` if nothing has been stored yet.
  pub fn load(&self, project: &str) -> Result<Option<BuildGraph>, PersistError> {
    let path = self.graph_path(project);
    let content = match fs::read_to_string(&path) {
      Ok(content) => content,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
      Err(e) => return Err(PersistError::Read(e)),
    };

    let header: Header = serde_json::from_str(&content).map_err(PersistError::Parse)?;
    if header.version != BUILD_GRAPH_VERSION {
      return Err(PersistError::UnsupportedVersion {
        found: header.version,
        expected: BUILD_GRAPH_VERSION,
      });
    }

    let envelope: Envelope = serde_json::from_str(&content).map_err(PersistError::Parse)?;
    let mut graph = envelope.graph;
    graph.rebuild_indexes();
    debug!(
      path = %path.display(),
      artifacts = graph.artifact_count(),
      transformers = graph.transformer_count(),
      "build graph loaded"
    );
    Ok(Some(graph))
  }

  /// Loads the only graph stored in the build directory, if any.
  pub fn load_any(&self) -> Result<Option<BuildGraph>, PersistError> {
    let projects = self.stored_projects()?;
    match projects.as_slice() {
      [] => Ok(None),
      [project] => self.load(project),
      _ => Err(PersistError::Ambiguous {
        dir: self.build_directory.clone(),
        projects,
      }),
    }
  }

  /// Projects with a stored graph, sorted by name.
  pub fn stored_projects(&self) -> Result<Vec<String>, PersistError> {
    let entries = match fs::read_dir(&self.build_directory) {
      Ok(entries) => entries,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
      Err(e) => return Err(PersistError::Read(e)),
    };

    let mut projects = Vec::new();
    for entry in entries {
      let entry = entry.map_err(PersistError::Read)?;
      if let Some(name) = entry.file_name().to_str()
        && let Some(project) = name.strip_suffix(BUILD_GRAPH_SUFFIX)
      {
        projects.push(project.to_string());
      }
    }
    projects.sort();
    Ok(projects)
  }

  /// Stores `graph`, replacing the previous file atomically.
  pub fn save(&self, graph: &BuildGraph) -> Result<PathBuf, PersistError> {
    fs::create_dir_all(&self.build_directory).map_err(PersistError::CreateDir)?;

    let path = self.graph_path(&graph.project);
    let temp_path = self
      .build_directory
      .join(format!("{}{BUILD_GRAPH_SUFFIX}.tmp", graph.project));

    let envelope = EnvelopeRef {
      version: BUILD_GRAPH_VERSION,
      graph,
    };
    let content = serde_json::to_string_pretty(&envelope).map_err(PersistError::Serialize)?;
    fs::write(&temp_path, &content).map_err(PersistError::Write)?;
    fs::rename(&temp_path, &path).map_err(PersistError::Write)?;

    info!(path = %path.display(), "build graph saved");
    Ok(path)
  }

  /// Deletes the stored graph of `project`; a missing file is not an error.
  pub fn remove(&self, project: &str) -> Result<(), PersistError> {
    match fs::remove_file(self.graph_path(project)) {
      Ok(()) => Ok(()),
      Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
      Err(e) => Err(PersistError::Write(e)),
    }
  }
}
