//! Build directory ownership and stored graph handling.

use brick_lib::Error;
use brick_lib::lock::{LockError, Operation};
use brick_lib::persist::BuildGraphStore;
use brick_lib::{BuildProject, execute::Canceler};
use serde_json::json;

use super::common::*;

#[test]
fn fresh_build_directory_is_unresolved() {
  let env = TestEnv::new();
  let project = env.open();
  assert!(!project.is_resolved());
  assert_eq!(project.graph().transformer_count(), 0);
}

#[tokio::test]
async fn building_before_resolving_is_an_error() {
  let env = TestEnv::new();
  let mut project = env.open();
  let err = project.build(&[], &config(), &Canceler::new()).await.unwrap_err();
  assert!(matches!(err, Error::NotResolved(_)));
}

#[cfg(unix)]
#[test]
fn second_writer_is_refused() {
  let env = TestEnv::new();
  let _held = env.open();
  let err = BuildProject::open(env.build_dir(), Operation::Clean).err().unwrap();
  assert!(matches!(err, Error::Lock(LockError::Writing { .. })));
}

#[test]
fn readers_share_the_build_directory() {
  let env = TestEnv::new();
  let _a = BuildProject::open(env.build_dir(), Operation::List).unwrap();
  let _b = BuildProject::open(env.build_dir(), Operation::List).unwrap();
}

#[cfg(unix)]
#[test]
fn reader_keeps_writers_out() {
  let env = TestEnv::new();
  let _reader = BuildProject::open(env.build_dir(), Operation::List).unwrap();
  let err = BuildProject::open(env.build_dir(), Operation::Resolve).err().unwrap();
  assert!(matches!(err, Error::Lock(LockError::InUse { .. })));
}

#[test]
fn unsupported_graph_version_starts_fresh() {
  let env = TestEnv::new();
  let store = BuildGraphStore::new(env.build_dir());
  std::fs::create_dir_all(env.build_dir()).unwrap();
  std::fs::write(store.graph_path("demo"), r#"{"version": 0, "graph": {}}"#).unwrap();

  let project = env.open();
  assert!(!project.is_resolved());
}

#[test]
fn resolve_is_saved_under_the_project_name() {
  let env = TestEnv::new();
  let input = env.write_source("a.txt", "a");
  let model = model(json!({
    "name": "demo",
    "products": [{
      "name": "app",
      "sources": [source(&input, "txt")],
      "rules": [per_input_rule("copy", "txt", "out", COPY)]
    }]
  }));

  let mut project = env.open();
  project.resolve(&model).unwrap();
  let path = project.save().unwrap();
  assert_eq!(path, env.build_dir().join("demo.bg.json"));

  let store = BuildGraphStore::new(env.build_dir());
  let stored = store.load("demo").unwrap().unwrap();
  assert_eq!(stored.transformer_count(), 1);
  assert_eq!(project.transformers_of("app")[0].commands.len(), 1);
}
