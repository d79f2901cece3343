use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use super::{ScanResult, Scanner, ScannerId};
use crate::resolved::FileTag;

/// Finds `#include "..."` dependencies in C-family sources.
///
/// Quoted includes are resolved against the including file's directory and
/// then the configured search paths; only files that exist are reported.
/// Angle-bracket includes are ignored. A file containing one of the marker
/// strings gets the associated tag.
#[derive(Debug, Clone)]
pub struct IncludeScanner {
  input_tags: BTreeSet<FileTag>,
  search_paths: Vec<PathBuf>,
  markers: Vec<(String, FileTag)>,
}

impl Default for IncludeScanner {
  fn default() -> Self {
    Self {
      input_tags: ["c", "cpp", "hpp", "h"].into_iter().map(FileTag::from).collect(),
      search_paths: Vec::new(),
      markers: Vec::new(),
    }
  }
}

impl IncludeScanner {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_search_path(mut self, path: impl Into<PathBuf>) -> Self {
    self.search_paths.push(path.into());
    self
  }

  /// Adds `tag` to every scanned file whose content contains `marker`.
  pub fn with_marker(mut self, marker: impl Into<String>, tag: impl Into<FileTag>) -> Self {
    self.markers.push((marker.into(), tag.into()));
    self
  }

  fn resolve(&self, including: &Path, name: &str) -> Option<PathBuf> {
    let local = including.parent().map(|dir| dir.join(name));
    local
      .into_iter()
      .chain(self.search_paths.iter().map(|dir| dir.join(name)))
      .find(|candidate| candidate.is_file())
  }
}

impl Scanner for IncludeScanner {
  fn id(&self) -> ScannerId {
    ScannerId("include".to_string())
  }

  fn input_tags(&self) -> &BTreeSet<FileTag> {
    &self.input_tags
  }

  fn scan(&self, path: &Path, content: &[u8]) -> ScanResult {
    let text = String::from_utf8_lossy(content);
    let mut dependencies = Vec::new();

    for line in text.lines() {
      let Some(rest) = line.trim_start().strip_prefix('#') else {
        continue;
      };
      let Some(rest) = rest.trim_start().strip_prefix("include") else {
        continue;
      };
      let Some((name, _)) = rest.trim_start().strip_prefix('"').and_then(|r| r.split_once('"')) else {
        continue;
      };
      if let Some(found) = self.resolve(path, name)
        && !dependencies.contains(&found)
      {
        dependencies.push(found);
      }
    }

    let additional_file_tags = self
      .markers
      .iter()
      .filter(|(marker, _)| text.contains(marker.as_str()))
      .map(|(_, tag)| tag.clone())
      .collect();

    ScanResult {
      dependencies,
      additional_file_tags,
      valid: true,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::resolved::tags;
  use tempfile::TempDir;

  #[test]
  fn finds_local_and_search_path_includes() {
    let temp = TempDir::new().unwrap();
    let src = temp.path().join("src");
    let inc = temp.path().join("include");
    std::fs::create_dir_all(&src).unwrap();
    std::fs::create_dir_all(&inc).unwrap();
    std::fs::write(src.join("local.h"), "").unwrap();
    std::fs::write(inc.join("api.h"), "").unwrap();

    let main = src.join("main.c");
    let content = "#include \"local.h\"\n  #  include \"api.h\"\n#include <stdio.h>\n#include \"missing.h\"\n";
    let scanner = IncludeScanner::new().with_search_path(&inc);
    let result = scanner.scan(&main, content.as_bytes());

    assert!(result.valid);
    assert_eq!(result.dependencies, vec![src.join("local.h"), inc.join("api.h")]);
  }

  #[test]
  fn marker_adds_tag() {
    let scanner = IncludeScanner::new().with_marker("Q_OBJECT", "moc_hpp");
    let result = scanner.scan(Path::new("/src/widget.h"), b"class W { Q_OBJECT };");
    assert_eq!(result.additional_file_tags, tags(["moc_hpp"]));

    let plain = scanner.scan(Path::new("/src/plain.h"), b"struct P {};");
    assert!(plain.additional_file_tags.is_empty());
  }

  #[test]
  fn default_input_tags() {
    let scanner = IncludeScanner::new();
    assert!(scanner.input_tags().contains(&FileTag::from("cpp")));
    assert_eq!(scanner.id(), ScannerId("include".to_string()));
  }
}
