//! Resolve and build cycles through [`BuildProject`].

use serde_json::json;

use brick_lib::resolved::ResolvedProject;

use super::common::*;

/// `x.txt` and `y.txt` are copied to `.mid` files and linked into `app.exe`.
fn two_source_app(env: &TestEnv) -> ResolvedProject {
  let x = env.write_source("x.txt", "x\n");
  let y = env.write_source("y.txt", "y\n");
  app_with_sources(&[&x, &y])
}

fn app_with_sources(sources: &[&std::path::Path]) -> ResolvedProject {
  let sources: Vec<_> = sources.iter().map(|p| source(p, "txt")).collect();
  model(json!({
    "name": "demo",
    "products": [{
      "name": "app",
      "file_tags": ["exe"],
      "sources": sources,
      "rules": [per_input_rule("copy", "txt", "mid", COPY), link_rule("exe")]
    }]
  }))
}

#[tokio::test]
async fn first_build_runs_everything_second_build_nothing() {
  let env = TestEnv::new();
  let mut project = env.open();
  let summary = project.resolve(&two_source_app(&env)).unwrap();
  assert_eq!(summary.transformers_created, 3);

  let report = build(&mut project).await;
  assert!(report.is_success(), "{:?}", report.failures);
  assert_eq!(report.executed.len(), 3);
  assert_eq!(std::fs::read_to_string(env.out("app", "app.exe")).unwrap(), "x\ny\n");

  let summary = project.resolve(&two_source_app(&env)).unwrap();
  assert_eq!(summary.transformers_created, 0);
  assert_eq!(summary.prepare_runs, 0);

  let report = build(&mut project).await;
  assert!(report.executed.is_empty());
  assert_eq!(report.up_to_date.len(), 3);
}

#[tokio::test]
async fn edited_source_rebuilds_only_its_chain() {
  let env = TestEnv::new();
  let model = two_source_app(&env);
  let mut project = env.open();
  project.resolve(&model).unwrap();
  build(&mut project).await;

  std::fs::write(env.src("x.txt"), "x2\n").unwrap();
  touch_later(&env.src("x.txt"));

  let report = build(&mut project).await;
  assert!(report.is_success());
  assert_eq!(report.executed.len(), 2);
  assert_eq!(report.up_to_date.len(), 1);
  assert_eq!(std::fs::read_to_string(env.out("app", "app.exe")).unwrap(), "x2\ny\n");
}

#[tokio::test]
async fn graph_survives_reopening_the_build_directory() {
  let env = TestEnv::new();
  let model = two_source_app(&env);
  {
    let mut project = env.open();
    project.resolve(&model).unwrap();
    build(&mut project).await;
  }

  let mut project = env.open();
  assert!(project.is_resolved());
  assert_eq!(project.graph().transformer_count(), 3);

  let summary = project.resolve(&model).unwrap();
  assert_eq!(summary.prepare_runs, 0);
  let report = build(&mut project).await;
  assert!(report.executed.is_empty());
}

#[tokio::test]
async fn product_property_change_reruns_the_reading_transformer() {
  let env = TestEnv::new();
  let input = env.write_source("greeting.txt", "");
  let model_with = |greeting: &str| {
    model(json!({
      "name": "demo",
      "products": [{
        "name": "app",
        "file_tags": ["msg"],
        "properties": { "greeting": greeting },
        "sources": [source(&input, "txt")],
        "rules": [per_input_rule(
          "greet",
          "txt",
          "msg",
          r#"return { program = "sh", arguments = { "-c", 'echo "$1" > "$0"', output.filePath, product.greeting } }"#,
        )]
      }]
    }))
  };

  let mut project = env.open();
  project.resolve(&model_with("hello")).unwrap();
  build(&mut project).await;
  assert_eq!(std::fs::read_to_string(env.out("app", "greeting.msg")).unwrap(), "hello\n");

  let summary = project.resolve(&model_with("hello")).unwrap();
  assert_eq!(summary.invalidated, 0);

  let summary = project.resolve(&model_with("howdy")).unwrap();
  assert_eq!(summary.prepare_runs, 1);
  let report = build(&mut project).await;
  assert_eq!(report.executed.len(), 1);
  assert_eq!(std::fs::read_to_string(env.out("app", "greeting.msg")).unwrap(), "howdy\n");
}

#[tokio::test]
async fn property_read_by_script_command_reruns_it() {
  let env = TestEnv::new();
  let input = env.write_source("stamp.txt", "");
  let model_with = |version: &str| {
    model(json!({
      "name": "demo",
      "products": [{
        "name": "app",
        "file_tags": ["stamp"],
        "properties": { "version": version },
        "sources": [source(&input, "txt")],
        "rules": [per_input_rule(
          "stamp",
          "txt",
          "stamp",
          r#"return { sourceCode = "local f = assert(io.open(output.filePath, 'w')); f:write(product.version); f:close()", description = "stamping" }"#,
        )]
      }]
    }))
  };

  let mut project = env.open();
  project.resolve(&model_with("1.0")).unwrap();
  let report = build(&mut project).await;
  assert!(report.is_success(), "{:?}", report.failures);
  assert_eq!(std::fs::read_to_string(env.out("app", "stamp.stamp")).unwrap(), "1.0");

  let summary = project.resolve(&model_with("1.0")).unwrap();
  assert_eq!(summary.invalidated, 0);

  let summary = project.resolve(&model_with("2.0")).unwrap();
  assert_eq!(summary.invalidated, 1);
  let report = build(&mut project).await;
  assert_eq!(report.executed.len(), 1);
  assert_eq!(std::fs::read_to_string(env.out("app", "stamp.stamp")).unwrap(), "2.0");
}

#[tokio::test]
async fn removed_source_deletes_its_outputs() {
  let env = TestEnv::new();
  let mut project = env.open();
  project.resolve(&two_source_app(&env)).unwrap();
  build(&mut project).await;
  assert!(env.out("app", "y.mid").exists());

  let summary = project.resolve(&app_with_sources(&[&env.src("x.txt")])).unwrap();
  assert_eq!(summary.removed_files, vec![env.out("app", "y.mid")]);
  assert!(!env.out("app", "y.mid").exists());

  let report = build(&mut project).await;
  assert!(report.is_success());
  assert_eq!(report.executed.len(), 1);
  assert_eq!(std::fs::read_to_string(env.out("app", "app.exe")).unwrap(), "x\n");
}

#[tokio::test]
async fn dependent_product_consumes_dependency_targets() {
  let env = TestEnv::new();
  let part = env.write_source("part.txt", "part\n");
  let model = model(json!({
    "name": "demo",
    "products": [
      {
        "name": "app",
        "file_tags": ["exe"],
        "dependencies": ["lib"],
        "rules": [{
          "name": "link",
          "inputs_from_dependencies": ["mid"],
          "multiplex": true,
          "artifacts": [{ "file_path": "$${product.name}.exe", "file_tags": ["exe"] }],
          "prepare": { "source": CONCAT }
        }]
      },
      {
        "name": "lib",
        "file_tags": ["mid"],
        "sources": [source(&part, "txt")],
        "rules": [per_input_rule("copy", "txt", "mid", COPY)]
      }
    ]
  }));

  let mut project = env.open();
  project.resolve(&model).unwrap();
  assert_eq!(project.target_artifacts("lib"), vec![env.out("lib", "part.mid")]);

  let report = build(&mut project).await;
  assert!(report.is_success(), "{:?}", report.failures);
  assert_eq!(report.executed.len(), 2);
  assert_eq!(std::fs::read_to_string(env.out("app", "app.exe")).unwrap(), "part\n");

  touch_later(&part);
  let report = build(&mut project).await;
  assert_eq!(report.executed.len(), 2);
}

#[tokio::test]
async fn failed_build_is_retried_next_time() {
  let env = TestEnv::new();
  let input = env.write_source("a.txt", "a\n");
  let flaky = env.temp.path().join("fail");
  std::fs::write(&flaky, "").unwrap();
  let script = format!(
    r#"return {{ program = "sh", arguments = {{ "-c", 'test ! -e "$1" && cp "$2" "$0"', output.filePath, "{}", input.filePath }} }}"#,
    flaky.display()
  );
  let model = model(json!({
    "name": "demo",
    "products": [{
      "name": "app",
      "file_tags": ["out"],
      "sources": [source(&input, "txt")],
      "rules": [per_input_rule("copy", "txt", "out", &script)]
    }]
  }));

  let mut project = env.open();
  project.resolve(&model).unwrap();
  let report = build(&mut project).await;
  assert_eq!(report.failures.len(), 1);
  assert!(!report.is_success());

  std::fs::remove_file(&flaky).unwrap();
  let report = build(&mut project).await;
  assert!(report.is_success());
  assert_eq!(report.executed.len(), 1);
  assert!(env.out("app", "a.out").exists());
}

#[tokio::test]
async fn dry_run_leaves_graph_and_disk_alone() {
  let env = TestEnv::new();
  let mut project = env.open();
  project.resolve(&two_source_app(&env)).unwrap();

  let config = brick_lib::execute::ExecuteConfig {
    dry_run: true,
    ..config()
  };
  let report = project
    .build(&[], &config, &brick_lib::execute::Canceler::new())
    .await
    .unwrap();
  assert_eq!(report.dry_run_commands.len(), 3);
  assert_eq!(report.dry_run_commands.last().unwrap(), "linking app.exe");
  assert!(!env.out("app", "x.mid").exists());

  let report = build(&mut project).await;
  assert_eq!(report.executed.len(), 3);
}
