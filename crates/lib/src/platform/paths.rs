use std::path::{Component, Path, PathBuf};

/// Returns the user's home directory, if the environment names one.
#[cfg(windows)]
pub fn home_dir() -> Option<PathBuf> {
  std::env::var_os("USERPROFILE").filter(|v| !v.is_empty()).map(PathBuf::from)
}

/// Returns the user's home directory, if the environment names one.
#[cfg(not(windows))]
pub fn home_dir() -> Option<PathBuf> {
  std::env::var_os("HOME").filter(|v| !v.is_empty()).map(PathBuf::from)
}

/// True when `path` has no parent, i.e. `/` or a bare drive root like `C:\`.
pub fn is_filesystem_root(path: &Path) -> bool {
  path.has_root() && path.parent().is_none()
}

/// Strips root and prefix components so the path can be joined under another directory.
///
/// `/usr/local/bin` becomes `usr/local/bin`. `..` removes the preceding
/// component and never climbs above the start, so `bin/../lib` is `lib`
/// and `../../etc` is `etc`.
pub fn relative_components(path: &Path) -> PathBuf {
  let mut parts = Vec::new();
  for component in path.components() {
    match component {
      Component::Normal(part) => parts.push(part),
      Component::ParentDir => {
        parts.pop();
      }
      Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
    }
  }
  parts.into_iter().collect()
}
