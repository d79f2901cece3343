//! Install and clean through [`BuildProject`].

use serde_json::json;

use brick_lib::install::InstallOptions;
use brick_lib::resolved::ResolvedProject;

use super::common::*;

/// A tool whose binary goes to `bin/` and whose headers keep their layout under `include/`.
fn tool(env: &TestEnv) -> ResolvedProject {
  let main = env.write_source("main.txt", "main\n");
  let header = env.write_source("include/tool/api.h", "api\n");
  model(json!({
    "name": "demo",
    "products": [{
      "name": "tool",
      "file_tags": ["exe"],
      "sources": [
        source(&main, "txt"),
        {
          "path": header,
          "file_tags": ["hpp"],
          "install": { "dir": "include", "source_base": env.src("include") }
        }
      ],
      "rules": [{
        "name": "copy",
        "inputs": ["txt"],
        "artifacts": [{
          "file_path": "$${input.baseName}.exe",
          "file_tags": ["exe"],
          "install": { "prefix": "usr", "dir": "bin" }
        }],
        "prepare": { "source": COPY }
      }]
    }]
  }))
}

fn options(env: &TestEnv) -> InstallOptions {
  InstallOptions {
    install_root: env.temp.path().join("root"),
    ..Default::default()
  }
}

#[tokio::test]
async fn install_copies_built_and_source_artifacts() {
  let env = TestEnv::new();
  let mut project = env.open();
  project.resolve(&tool(&env)).unwrap();
  assert!(build(&mut project).await.is_success());

  let root = env.temp.path().join("root");
  let listed = project.installable_artifacts(&root).unwrap();
  assert_eq!(
    listed,
    vec![
      (env.src("include/tool/api.h"), root.join("include/tool/api.h")),
      (env.out("tool", "main.exe"), root.join("usr/bin/main.exe")),
    ]
  );

  let report = project.install(&[], &options(&env)).unwrap();
  assert!(report.is_success());
  assert_eq!(report.installed, listed);
  assert_eq!(std::fs::read_to_string(root.join("usr/bin/main.exe")).unwrap(), "main\n");
  assert_eq!(std::fs::read_to_string(root.join("include/tool/api.h")).unwrap(), "api\n");
}

#[tokio::test]
async fn clean_install_root_drops_stale_files() {
  let env = TestEnv::new();
  let mut project = env.open();
  project.resolve(&tool(&env)).unwrap();
  build(&mut project).await;

  let root = env.temp.path().join("root");
  std::fs::create_dir_all(&root).unwrap();
  std::fs::write(root.join("stale"), "old").unwrap();

  let options = InstallOptions {
    remove_existing_installation: true,
    ..options(&env)
  };
  project.install(&[], &options).unwrap();
  assert!(!root.join("stale").exists());
  assert!(root.join("usr/bin/main.exe").exists());
}

#[tokio::test]
async fn clean_deletes_generated_files_only() {
  let env = TestEnv::new();
  let mut project = env.open();
  project.resolve(&tool(&env)).unwrap();
  build(&mut project).await;
  assert!(env.out("tool", "main.exe").exists());

  let removed = project.clean().unwrap();
  assert_eq!(removed, vec![env.out("tool", "main.exe")]);
  assert!(!env.out("tool", "main.exe").exists());
  assert!(env.src("main.txt").exists());

  let err = project.install(&[], &options(&env)).unwrap_err();
  assert!(err.to_string().contains("does not exist"));

  let report = build(&mut project).await;
  assert_eq!(report.executed.len(), 1);
  assert!(env.out("tool", "main.exe").exists());
}
