use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::debug;

use super::ResolveError;
use crate::file::FileResource;
use crate::graph::{ArtifactId, BuildGraph, GraphError, NewArtifact};
use crate::resolved::SourceArtifact;
use crate::scan::{ScanResultCache, Scanner};

/// Makes the source artifacts of `product` match `sources`.
///
/// Existing source artifacts keep their id and build state; their tags and
/// properties are replaced with the declared ones. Sources no longer
/// declared leave the graph; their files are never touched.
pub(super) fn sync_sources(graph: &mut BuildGraph, product: &str, sources: &[SourceArtifact]) -> Result<(), ResolveError> {
  let mut declared = BTreeSet::new();

  for source in sources {
    if !source.may_not_exist && !source.path.exists() {
      return Err(ResolveError::SourceMissing {
        product: product.to_string(),
        path: source.path.clone(),
      });
    }
    if !declared.insert(source.path.clone()) {
      return Err(GraphError::DuplicateArtifact(source.path.clone()).into());
    }

    match graph.artifact_by_path(&source.path) {
      Some(id) => {
        let artifact = graph
          .artifact_mut(id)
          .ok_or_else(|| ResolveError::Internal(format!("stale path index for {}", source.path.display())))?;
        if artifact.is_generated() || artifact.product != product {
          return Err(GraphError::DuplicateArtifact(source.path.clone()).into());
        }
        artifact.file_tags = source.file_tags.clone();
        artifact.properties = source.properties.clone();
        artifact.install = source.install.clone();
        artifact.may_not_exist = source.may_not_exist;
      }
      None => {
        let mut new = NewArtifact::source(product, &source.path, source.file_tags.clone());
        new.properties = source.properties.clone();
        new.install = source.install.clone();
        new.may_not_exist = source.may_not_exist;
        graph.add_artifact(new)?;
        debug!(product = %product, source = %source.path.display(), "added source artifact");
      }
    }
  }

  let stale: Vec<ArtifactId> = graph
    .product(product)
    .map(|data| {
      data
        .artifacts
        .iter()
        .filter_map(|id| graph.artifact(*id))
        .filter(|a| !a.is_generated() && !declared.contains(a.path()))
        .map(|a| a.id)
        .collect()
    })
    .unwrap_or_default();
  for id in stale {
    if let Some(artifact) = graph.remove_artifact(id) {
      debug!(product = %product, source = %artifact.path().display(), "source artifact no longer declared");
    }
  }
  Ok(())
}

/// Runs matching scanners over the existing source files of `product`.
///
/// Scanner tags are added to the artifact and the files it was found to
/// depend on replace its previous dependency list.
pub(super) fn scan_sources(
  graph: &mut BuildGraph,
  product: &str,
  scanners: &[Arc<dyn Scanner>],
  cache: &ScanResultCache,
) -> Result<(), ResolveError> {
  if scanners.is_empty() {
    return Ok(());
  }

  let ids: Vec<ArtifactId> = graph
    .product(product)
    .map(|data| data.artifacts.iter().copied().collect())
    .unwrap_or_default();

  for id in ids {
    let Some(artifact) = graph.artifact(id) else {
      continue;
    };
    if artifact.is_generated() || !artifact.file.exists() {
      continue;
    }
    let path = artifact.path().to_path_buf();
    let matching: Vec<&Arc<dyn Scanner>> = scanners
      .iter()
      .filter(|s| artifact.has_any_tag(s.input_tags()))
      .collect();
    if matching.is_empty() {
      continue;
    }

    let mut tags = BTreeSet::new();
    let mut dependencies: Vec<PathBuf> = Vec::new();
    for scanner in matching {
      let result = cache.scan(scanner.as_ref(), &path)?;
      tags.extend(result.additional_file_tags);
      for dep in result.dependencies {
        if !dependencies.contains(&dep) {
          dependencies.push(dep);
        }
      }
    }

    if let Some(artifact) = graph.artifact_mut(id) {
      artifact.file_tags.extend(tags);
      artifact.dependencies = dependencies.into_iter().map(FileResource::dependency).collect();
    }
  }
  Ok(())
}
