use std::path::{Path, PathBuf};

use serde_json::json;
use tempfile::TempDir;

use super::*;
use crate::command::Command;
use crate::resolved::{ArtifactTemplate, FileTag, ResolvedModule, Rule, Script, SourceArtifact, tags};
use crate::script::LuaScriptEngine;

const COPY: &str = r#"return { program = "cp", arguments = { input.filePath, output.filePath } }"#;

fn rule(name: &str, from: &str, to: &str, prepare: &str) -> Rule {
  Rule {
    name: name.to_string(),
    inputs: tags([from]),
    requires_inputs: true,
    artifacts: vec![ArtifactTemplate::new(format!("$${{input.baseName}}.{to}"), tags([to]))],
    prepare: Script::new(prepare),
    ..Default::default()
  }
}

fn source(path: &str, tag: &str) -> SourceArtifact {
  SourceArtifact {
    may_not_exist: true,
    ..SourceArtifact::new(path, tags([tag]))
  }
}

fn product(name: &str, rules: Vec<Rule>, sources: Vec<SourceArtifact>) -> ResolvedProduct {
  ResolvedProduct {
    name: name.to_string(),
    enabled: true,
    rules,
    sources,
    ..Default::default()
  }
}

fn project(products: Vec<ResolvedProduct>) -> ResolvedProject {
  ResolvedProject {
    name: "proj".to_string(),
    products,
    ..Default::default()
  }
}

fn config(build: &Path) -> ResolveConfig {
  ResolveConfig {
    build_directory: build.to_path_buf(),
    force_prepare: false,
    environment: Environment::new(),
  }
}

fn resolve(graph: &mut BuildGraph, project: &ResolvedProject, config: &ResolveConfig) -> Result<ResolveSummary, ResolveError> {
  let cache = ScanResultCache::new();
  Resolver::new(graph, &LuaScriptEngine, &[], &cache, config).resolve(project)
}

/// Pretends every transformer ran.
fn mark_built(graph: &mut BuildGraph) {
  let ids: Vec<TransformerId> = graph.transformers().map(|t| t.id).collect();
  for id in ids {
    if let Some(t) = graph.transformer_mut(id) {
      t.needs_rerun = false;
    }
  }
}

fn only_transformer(graph: &BuildGraph) -> &crate::graph::Transformer {
  let all: Vec<_> = graph.transformers().collect();
  assert_eq!(all.len(), 1);
  all[0]
}

fn arguments(graph: &BuildGraph) -> Vec<String> {
  match &only_transformer(graph).commands[..] {
    [Command::Process(cmd)] => cmd.arguments.clone(),
    other => panic!("unexpected commands {other:?}"),
  }
}

#[test]
fn rule_chain_fires_to_fixpoint() {
  let temp = TempDir::new().unwrap();
  let rules = vec![
    rule("c_to_d", "c", "d", COPY),
    rule("a_to_b", "a", "b", COPY),
    rule("b_to_c", "b", "c", COPY),
  ];
  let project = project(vec![ResolvedProduct {
    file_tags: tags(["d"]),
    ..product("app", rules, vec![source("/src/x.a", "a")])
  }]);

  let mut graph = BuildGraph::default();
  let summary = resolve(&mut graph, &project, &config(temp.path())).unwrap();

  assert_eq!(summary.transformers_created, 3);
  assert_eq!(graph.transformer_count(), 3);
  assert_eq!(graph.artifact_count(), 4);
  for tag in ["a", "b", "c", "d"] {
    assert_eq!(graph.artifacts_by_file_tag("app", &FileTag::from(tag)).len(), 1, "tag {tag}");
  }

  let input = graph.artifact(graph.artifact_by_path(Path::new("/src/x.a")).unwrap()).unwrap();
  assert_eq!(input.file_tags, tags(["a"]));

  let target = graph.target_artifacts("app");
  assert_eq!(graph.sorted_paths(&target), vec![temp.path().join("app").join("x.d")]);
  graph.check_consistency().unwrap();
}

#[test]
fn self_consuming_rule_is_rejected() {
  let temp = TempDir::new().unwrap();
  let project = project(vec![product(
    "app",
    vec![rule("loop", "a", "a", COPY)],
    vec![source("/src/x.a", "a")],
  )]);

  let err = resolve(&mut BuildGraph::default(), &project, &config(temp.path())).unwrap_err();
  assert!(matches!(err, ResolveError::RuleCycle { ref rule, .. } if rule == "loop"));
}

#[test]
fn unchanged_project_rescues_everything() {
  let temp = TempDir::new().unwrap();
  let project = project(vec![product(
    "app",
    vec![rule("a_to_b", "a", "b", COPY), rule("b_to_c", "b", "c", COPY)],
    vec![source("/src/x.a", "a"), source("/src/y.a", "a")],
  )]);
  let config = config(temp.path());

  let mut graph = BuildGraph::default();
  resolve(&mut graph, &project, &config).unwrap();
  let before: Vec<_> = graph.transformers().map(|t| (t.id, t.key_inputs.clone())).collect();

  let summary = resolve(&mut graph, &project, &config).unwrap();
  assert_eq!(summary.transformers_created, 0);
  assert_eq!(summary.transformers_rescued, 4);
  assert_eq!(summary.prepare_runs, 0);
  assert_eq!(summary.invalidated, 0);
  assert!(summary.changed_products.is_empty());

  let after: Vec<_> = graph.transformers().map(|t| (t.id, t.key_inputs.clone())).collect();
  assert_eq!(before, after);
}

#[test]
fn changed_module_property_reruns_prepare() {
  let temp = TempDir::new().unwrap();
  let prepare = r#"return { program = "cc", arguments = { product.modules.cpp.optimization, input.filePath } }"#;
  let make = |optimization: &str, unrelated: &str| {
    let module = ResolvedModule {
      name: "cpp".to_string(),
      properties: json!({ "optimization": optimization, "warnings": unrelated })
        .as_object()
        .cloned()
        .unwrap(),
      ..Default::default()
    };
    project(vec![ResolvedProduct {
      modules: vec![module],
      ..product("app", vec![rule("compiler", "a", "b", prepare)], vec![source("/src/x.a", "a")])
    }])
  };
  let config = config(temp.path());

  let mut graph = BuildGraph::default();
  resolve(&mut graph, &make("fast", "all"), &config).unwrap();
  mark_built(&mut graph);

  let summary = resolve(&mut graph, &make("fast", "none"), &config).unwrap();
  assert_eq!(summary.invalidated, 0);
  assert_eq!(summary.prepare_runs, 0);
  assert!(!only_transformer(&graph).needs_rerun);

  let summary = resolve(&mut graph, &make("small", "none"), &config).unwrap();
  assert_eq!(summary.invalidated, 1);
  assert_eq!(summary.prepare_runs, 1);
  assert!(only_transformer(&graph).needs_rerun);
  assert_eq!(arguments(&graph), vec!["small".to_string(), "/src/x.a".to_string()]);
}

#[test]
fn edited_prepare_script_reruns_prepare() {
  let temp = TempDir::new().unwrap();
  let make = |prepare: &str| project(vec![product("app", vec![rule("copy", "a", "b", prepare)], vec![source("/src/x.a", "a")])]);
  let config = config(temp.path());

  let mut graph = BuildGraph::default();
  resolve(&mut graph, &make(COPY), &config).unwrap();
  mark_built(&mut graph);

  let summary = resolve(&mut graph, &make(COPY), &config).unwrap();
  assert_eq!(summary.prepare_runs, 0);
  assert!(!only_transformer(&graph).needs_rerun);

  let verbose = r#"return { program = "cp", arguments = { "-v", input.filePath, output.filePath } }"#;
  let summary = resolve(&mut graph, &make(verbose), &config).unwrap();
  assert_eq!(summary.transformers_created, 0);
  assert_eq!(summary.prepare_runs, 1);
  assert!(only_transformer(&graph).needs_rerun);
  assert_eq!(arguments(&graph)[0], "-v");
}

#[test]
fn moved_rule_keeps_its_commands() {
  let temp = TempDir::new().unwrap();
  let make = |line: u32| {
    let mut copy = rule("copy", "a", "b", COPY);
    copy.location = CodeLocation::new("project.lua", line, 1);
    project(vec![product("app", vec![copy], vec![source("/src/x.a", "a")])])
  };
  let config = config(temp.path());

  let mut graph = BuildGraph::default();
  resolve(&mut graph, &make(3), &config).unwrap();
  mark_built(&mut graph);

  let summary = resolve(&mut graph, &make(30), &config).unwrap();
  assert_eq!(summary.prepare_runs, 0);
  assert!(!only_transformer(&graph).needs_rerun);
}

#[test]
fn relevant_environment_change_forces_rerun_without_prepare() {
  let temp = TempDir::new().unwrap();
  let prepare = r#"return { program = "cc", arguments = { input.filePath }, relevantEnvironmentVariables = { "CC" } }"#;
  let project = project(vec![product(
    "app",
    vec![rule("compiler", "a", "b", prepare)],
    vec![source("/src/x.a", "a")],
  )]);

  let mut config = config(temp.path());
  config.environment.insert("CC".to_string(), "gcc".to_string());
  config.environment.insert("UNRELATED".to_string(), "1".to_string());

  let mut graph = BuildGraph::default();
  resolve(&mut graph, &project, &config).unwrap();
  mark_built(&mut graph);

  config.environment.insert("UNRELATED".to_string(), "2".to_string());
  resolve(&mut graph, &project, &config).unwrap();
  assert!(!only_transformer(&graph).needs_rerun);

  config.environment.insert("CC".to_string(), "clang".to_string());
  let summary = resolve(&mut graph, &project, &config).unwrap();
  assert_eq!(summary.prepare_runs, 0);
  assert!(only_transformer(&graph).needs_rerun);
}

#[test]
fn removed_source_drops_its_chain_and_files() {
  let temp = TempDir::new().unwrap();
  let config = config(temp.path());
  let rules = || vec![rule("a_to_b", "a", "b", COPY)];

  let mut graph = BuildGraph::default();
  let two = project(vec![product(
    "app",
    rules(),
    vec![source("/src/x.a", "a"), source("/src/y.a", "a")],
  )]);
  resolve(&mut graph, &two, &config).unwrap();

  let stale_output = temp.path().join("app").join("y.b");
  std::fs::create_dir_all(stale_output.parent().unwrap()).unwrap();
  std::fs::write(&stale_output, "old").unwrap();

  let one = project(vec![product("app", rules(), vec![source("/src/x.a", "a")])]);
  let summary = resolve(&mut graph, &one, &config).unwrap();

  assert_eq!(summary.transformers_removed, 1);
  assert_eq!(summary.artifacts_removed, 1);
  assert_eq!(summary.removed_files, vec![stale_output.clone()]);
  assert!(!stale_output.exists());
  assert_eq!(graph.transformer_count(), 1);
  graph.check_consistency().unwrap();
}

#[test]
fn two_rules_declaring_one_output_is_an_error() {
  let temp = TempDir::new().unwrap();
  let fixed = |name: &str, tag: &str| Rule {
    name: name.to_string(),
    inputs: tags(["a"]),
    requires_inputs: true,
    artifacts: vec![ArtifactTemplate::new("same.out", tags([tag]))],
    prepare: Script::new(COPY),
    ..Default::default()
  };
  let project = project(vec![product(
    "app",
    vec![fixed("first", "b"), fixed("second", "c")],
    vec![source("/src/x.a", "a")],
  )]);

  let err = resolve(&mut BuildGraph::default(), &project, &config(temp.path())).unwrap_err();
  assert!(matches!(err, ResolveError::DuplicateOutput { .. }));
}

#[test]
fn dynamic_output_with_undeclared_tag_is_rejected() {
  let temp = TempDir::new().unwrap();
  let generator = Rule {
    name: "generator".to_string(),
    inputs: tags(["a"]),
    requires_inputs: true,
    output_file_tags: tags(["cpp"]),
    output_artifacts: Some(Script::new(
      r#"return { { filePath = input.baseName .. ".cpp" }, { filePath = input.baseName .. ".h", fileTags = { "hpp" } } }"#,
    )),
    prepare: Script::new(COPY),
    location: CodeLocation::new("gen.lua", 7, 1),
    ..Default::default()
  };
  let project = project(vec![product("app", vec![generator], vec![source("/src/x.a", "a")])]);

  let err = resolve(&mut BuildGraph::default(), &project, &config(temp.path())).unwrap_err();
  match &err {
    ResolveError::UndeclaredOutputTag { rule, tag, .. } => {
      assert_eq!(rule, "generator");
      assert_eq!(tag, &FileTag::from("hpp"));
    }
    other => panic!("unexpected error {other:?}"),
  }
  assert!(err.to_string().contains("gen.lua:"), "{err}");
}

#[test]
fn dynamic_outputs_inherit_declared_tags() {
  let temp = TempDir::new().unwrap();
  let generator = Rule {
    name: "generator".to_string(),
    inputs: tags(["a"]),
    requires_inputs: true,
    output_file_tags: tags(["cpp", "hpp"]),
    output_artifacts: Some(Script::new(
      r#"return { { filePath = input.baseName .. ".h", fileTags = { "hpp" } } }"#,
    )),
    prepare: Script::new(COPY),
    ..Default::default()
  };
  let project = project(vec![product("app", vec![generator], vec![source("/src/x.a", "a")])]);

  let mut graph = BuildGraph::default();
  resolve(&mut graph, &project, &config(temp.path())).unwrap();
  assert_eq!(graph.artifacts_by_file_tag("app", &FileTag::from("hpp")).len(), 1);
}

#[test]
fn prepare_failure_names_rule_and_location() {
  let temp = TempDir::new().unwrap();
  let mut broken = rule("compiler", "a", "b", "error('no compiler')");
  broken.prepare = broken.prepare.at(CodeLocation::new("cpp.lua", 10, 3));
  let project = project(vec![product("app", vec![broken], vec![source("/src/x.a", "a")])]);

  let err = resolve(&mut BuildGraph::default(), &project, &config(temp.path())).unwrap_err();
  let message = err.to_string();
  assert!(message.contains("rule 'compiler'"), "{message}");
  assert!(message.contains("cpp.lua:"), "{message}");
}

#[test]
fn zero_outputs_needs_permission() {
  let temp = TempDir::new().unwrap();
  let mut silent = rule("checker", "a", "b", "return {}");
  silent.artifacts.clear();
  let make = |rule: Rule| project(vec![product("app", vec![rule], vec![source("/src/x.a", "a")])]);

  let err = resolve(&mut BuildGraph::default(), &make(silent.clone()), &config(temp.path())).unwrap_err();
  assert!(matches!(err, ResolveError::NoOutputs { .. }));

  silent.allow_empty_outputs = true;
  let mut graph = BuildGraph::default();
  resolve(&mut graph, &make(silent), &config(temp.path())).unwrap();
  assert_eq!(graph.transformer_count(), 1);
}

#[test]
fn consulted_artifact_set_change_reruns_prepare() {
  let temp = TempDir::new().unwrap();
  let prepare = r#"return { program = "cc", arguments = { tostring(#product.artifacts.h) } }"#;
  let make = |headers: &[&str]| {
    let mut sources = vec![source("/src/x.a", "a")];
    sources.extend(headers.iter().map(|h| source(h, "h")));
    project(vec![product("app", vec![rule("compiler", "a", "b", prepare)], sources)])
  };
  let config = config(temp.path());

  let mut graph = BuildGraph::default();
  resolve(&mut graph, &make(&["/src/one.h"]), &config).unwrap();
  assert_eq!(arguments(&graph), vec!["1".to_string()]);

  let summary = resolve(&mut graph, &make(&["/src/one.h"]), &config).unwrap();
  assert_eq!(summary.prepare_runs, 0);

  let summary = resolve(&mut graph, &make(&["/src/one.h", "/src/two.h"]), &config).unwrap();
  assert_eq!(summary.prepare_runs, 1);
  assert_eq!(arguments(&graph), vec!["2".to_string()]);
}

#[test]
fn dependency_targets_feed_dependent_rules() {
  let temp = TempDir::new().unwrap();
  let library = ResolvedProduct {
    file_tags: tags(["staticlib"]),
    ..product(
      "lib",
      vec![rule("archiver", "a", "staticlib", COPY)],
      vec![source("/src/lib.a", "a")],
    )
  };
  let linker = Rule {
    name: "linker".to_string(),
    inputs_from_dependencies: tags(["staticlib"]),
    requires_inputs: true,
    multiplex: true,
    artifacts: vec![ArtifactTemplate::new("$${product.name}.exe", tags(["application"]))],
    prepare: Script::new(r#"return { program = "ld", arguments = { inputs.staticlib[1].filePath } }"#),
    ..Default::default()
  };
  let app = ResolvedProduct {
    dependencies: vec!["lib".to_string()],
    file_tags: tags(["application"]),
    ..product("app", vec![linker], Vec::new())
  };

  let mut graph = BuildGraph::default();
  resolve(&mut graph, &project(vec![app, library]), &config(temp.path())).unwrap();

  let link = graph.transformers_of("app");
  assert_eq!(link.len(), 1);
  let expected: PathBuf = temp.path().join("lib").join("lib.staticlib");
  assert_eq!(link[0].key_inputs, vec![expected.clone()]);
  assert_eq!(
    graph.sorted_paths(&graph.target_artifacts("app")),
    vec![temp.path().join("app").join("app.exe")]
  );
  graph.verify_acyclic().unwrap();
}

#[test]
fn removed_product_is_dropped() {
  let temp = TempDir::new().unwrap();
  let config = config(temp.path());
  let app = || product("app", vec![rule("a_to_b", "a", "b", COPY)], vec![source("/src/x.a", "a")]);
  let tool = product("tool", vec![rule("a_to_b", "a", "b", COPY)], vec![source("/src/t.a", "a")]);

  let mut graph = BuildGraph::default();
  resolve(&mut graph, &project(vec![app(), tool]), &config).unwrap();
  assert_eq!(graph.transformer_count(), 2);

  let summary = resolve(&mut graph, &project(vec![app()]), &config).unwrap();
  assert_eq!(summary.removed_files, vec![temp.path().join("tool").join("t.b")]);
  assert!(graph.product("tool").is_none());
  assert_eq!(graph.transformer_count(), 1);
}
