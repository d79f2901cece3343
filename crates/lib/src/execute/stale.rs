//! Deciding whether a transformer has to run.

use std::collections::{BTreeSet, HashSet};

use crate::file::FileTime;
use crate::graph::{BuildGraph, Transformer, TransformerId};

use super::dag::ExecutionDag;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleReason {
  Flagged,
  AlwaysRun,
  OutputMissing,
  InputRebuilt,
  InputNewer,
}

impl std::fmt::Display for StaleReason {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let text = match self {
      StaleReason::Flagged => "flagged for re-run",
      StaleReason::AlwaysRun => "always runs",
      StaleReason::OutputMissing => "output missing",
      StaleReason::InputRebuilt => "input was rebuilt",
      StaleReason::InputNewer => "input newer than output",
    };
    f.write_str(text)
  }
}

/// Why `t` must run, or `None` when it is up to date.
///
/// `rebuilt` holds the transformers that ran (or would run, in a dry run)
/// earlier in this build.
pub fn staleness(graph: &BuildGraph, t: &Transformer, rebuilt: &HashSet<TransformerId>) -> Option<StaleReason> {
  if t.needs_rerun {
    return Some(StaleReason::Flagged);
  }
  if t.always_run {
    return Some(StaleReason::AlwaysRun);
  }

  let mut oldest_output: Option<FileTime> = None;
  for artifact in t.outputs.iter().filter_map(|id| graph.artifact(*id)) {
    let Some(timestamp) = artifact.file.timestamp() else {
      return Some(StaleReason::OutputMissing);
    };
    if artifact.always_updated && !artifact.file.exists() {
      return Some(StaleReason::OutputMissing);
    }
    oldest_output = Some(oldest_output.map_or(timestamp, |o| o.min(timestamp)));
  }

  let mut newest_input: Option<FileTime> = None;
  for artifact in t.dependencies().filter_map(|id| graph.artifact(id)) {
    if artifact.producer.is_some_and(|p| rebuilt.contains(&p)) {
      return Some(StaleReason::InputRebuilt);
    }
    let timestamps = std::iter::once(artifact.file.timestamp())
      .chain(artifact.dependencies.iter().map(|d| d.timestamp()))
      .flatten();
    newest_input = newest_input.into_iter().chain(timestamps).max();
  }

  match (newest_input, oldest_output) {
    (Some(input), Some(output)) if input > output => Some(StaleReason::InputNewer),
    _ => None,
  }
}

/// Re-reads timestamps of the files the DAG's transformers read.
///
/// Generated outputs keep their recorded timestamps unless `force` is set.
pub fn refresh_timestamps(graph: &mut BuildGraph, dag: &ExecutionDag, force: bool) {
  let mut ids = BTreeSet::new();
  for id in dag.transformers() {
    if let Some(t) = graph.transformer(id) {
      ids.extend(t.dependencies());
      ids.extend(t.outputs.iter().copied());
    }
  }

  for id in ids {
    let Some(artifact) = graph.artifact_mut(id) else {
      continue;
    };
    if !artifact.is_generated() || force {
      artifact.file.refresh_timestamp();
    }
    for dependency in &mut artifact.dependencies {
      dependency.refresh_timestamp();
    }
  }
}
