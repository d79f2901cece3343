//! Transformer execution.
//!
//! This module runs the commands of stale transformers. It handles:
//! - dependency ordering over artifact and product edges
//! - bounded parallelism of independent transformers
//! - failure propagation, keep-going and cancellation
//! - output timestamp bookkeeping for the next incremental build

mod cancel;
pub mod dag;
pub mod stale;
pub mod types;

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::change::PropertyReads;
use crate::command::Command;
use crate::command::process::run_process;
use crate::command::script::run_script;
use crate::env::{EnvironmentCache, EnvironmentKind, PendingEnvironment};
use crate::file::FileTime;
use crate::graph::{ArtifactId, BuildGraph, ProductContext, TransformerId};
use crate::script::{ArtifactView, ArtifactViewsByTag, Environment, PropertyRecorder, ScriptEngine, ScriptScope};

pub use cancel::Canceler;
pub use dag::ExecutionDag;
pub use stale::StaleReason;
pub use types::{BuildReport, ExecuteConfig, ExecuteError, SkipReason, TransformerFailure};

/// Runs every stale transformer of `products` and their dependencies.
///
/// An empty product list builds the whole graph. The graph is updated in
/// place: output timestamps of successful transformers are refreshed and
/// failed ones are flagged for re-run.
pub async fn execute(
  graph: &mut BuildGraph,
  products: &[String],
  engine: Arc<dyn ScriptEngine>,
  environments: &EnvironmentCache,
  base_env: &Environment,
  config: &ExecuteConfig,
  canceler: &Canceler,
) -> Result<BuildReport, ExecuteError> {
  let dag = ExecutionDag::from_graph(graph, products)?;
  info!(transformers = dag.len(), jobs = config.jobs, "starting build execution");

  stale::refresh_timestamps(graph, &dag, config.force_timestamp_check);

  let mut scheduler = Scheduler::new(&dag, config);
  let mut scopes = ScopeSource::default();
  let base_env = Arc::new(base_env.clone());
  let semaphore = Arc::new(Semaphore::new(config.jobs.max(1)));
  let mut tasks: JoinSet<JobResult> = JoinSet::new();

  loop {
    if canceler.is_canceled() && !scheduler.report.canceled {
      warn!("build canceled");
      scheduler.report.canceled = true;
    }

    while scheduler.may_dispatch()
      && let Some(id) = scheduler.next_ready()
    {
      let t = graph
        .transformer(id)
        .ok_or_else(|| ExecuteError::Internal(format!("transformer {id} vanished")))?;

      let Some(reason) = stale::staleness(graph, t, &scheduler.rebuilt) else {
        debug!(transformer = %id, "up to date");
        scheduler.take_ready(id);
        scheduler.report.up_to_date.push(id);
        scheduler.complete(id);
        continue;
      };

      if config.dry_run {
        scheduler.take_ready(id);
        for command in &t.commands {
          scheduler.report.dry_run_commands.push(command.describe());
        }
        scheduler.rebuilt.insert(id);
        scheduler.complete(id);
        continue;
      }

      let Ok(permit) = semaphore.clone().try_acquire_owned() else {
        break;
      };
      scheduler.take_ready(id);

      let job = match prepare_job(graph, id, engine.clone(), environments, &base_env, canceler, &mut scopes, permit) {
        Ok(job) => job,
        Err(error) => {
          scheduler.fail(graph, id, None, error);
          continue;
        }
      };
      debug!(transformer = %id, %reason, "dispatching transformer");
      tasks.spawn(job.supervise());
    }

    let Some(joined) = tasks.join_next().await else {
      break;
    };
    match joined {
      Ok(result) => scheduler.finish(graph, result),
      Err(e) => error!(error = %e, "worker task failed"),
    }
  }

  let report = scheduler.into_report();
  info!(
    executed = report.executed.len(),
    up_to_date = report.up_to_date.len(),
    failed = report.failures.len(),
    skipped = report.skipped.len(),
    "build execution complete"
  );
  Ok(report)
}

/// Ready queue and bookkeeping for one build.
struct Scheduler<'a> {
  dag: &'a ExecutionDag,
  keep_going: bool,
  /// Unfinished dependencies per transformer.
  waiting: HashMap<TransformerId, usize>,
  ready: BTreeSet<TransformerId>,
  settled: HashSet<TransformerId>,
  rebuilt: HashSet<TransformerId>,
  aborted: bool,
  report: BuildReport,
}

impl<'a> Scheduler<'a> {
  fn new(dag: &'a ExecutionDag, config: &ExecuteConfig) -> Self {
    let waiting: HashMap<TransformerId, usize> = dag
      .transformers()
      .into_iter()
      .map(|id| (id, dag.dependencies(id).len()))
      .collect();
    let ready = waiting.iter().filter(|(_, n)| **n == 0).map(|(id, _)| *id).collect();
    Self {
      dag,
      keep_going: config.keep_going,
      waiting,
      ready,
      settled: HashSet::new(),
      rebuilt: HashSet::new(),
      aborted: false,
      report: BuildReport::default(),
    }
  }

  fn may_dispatch(&self) -> bool {
    !self.aborted && !self.report.canceled
  }

  fn next_ready(&self) -> Option<TransformerId> {
    self.ready.first().copied()
  }

  fn take_ready(&mut self, id: TransformerId) {
    self.ready.remove(&id);
  }

  /// Marks `id` as done and releases the transformers waiting on it.
  fn complete(&mut self, id: TransformerId) {
    self.settled.insert(id);
    for dependent in self.dag.dependents(id) {
      if let Some(n) = self.waiting.get_mut(&dependent) {
        *n = n.saturating_sub(1);
        if *n == 0 && !self.settled.contains(&dependent) {
          self.ready.insert(dependent);
        }
      }
    }
  }

  fn finish(&mut self, graph: &mut BuildGraph, result: JobResult) {
    let id = result.id;
    match result.outcome {
      Ok(()) => match settle_outputs(graph, id, &result.previous) {
        Ok(()) => {
          info!(transformer = %id, "transformer succeeded");
          if let Some(t) = graph.transformer_mut(id) {
            t.needs_rerun = false;
            t.reads_in_commands.merge(result.reads);
          }
          self.rebuilt.insert(id);
          self.report.executed.push(id);
          self.complete(id);
        }
        Err(error) => self.fail(graph, id, None, error),
      },
      Err((_, ExecuteError::Canceled)) => {
        debug!(transformer = %id, "transformer canceled");
        if let Some(t) = graph.transformer_mut(id) {
          t.needs_rerun = true;
        }
        self.settled.insert(id);
        self.report.canceled = true;
        self.report.skipped.push((id, SkipReason::Canceled));
      }
      Err((command, error)) => self.fail(graph, id, command, error),
    }
  }

  fn fail(&mut self, graph: &mut BuildGraph, id: TransformerId, command: Option<String>, error: ExecuteError) {
    error!(transformer = %id, error = %error, "transformer failed");
    self.settled.insert(id);

    let Some(t) = graph.transformer_mut(id) else {
      return;
    };
    t.needs_rerun = true;
    let (product, rule) = (t.product.clone(), t.rule.clone());
    let (inputs, outputs) = (t.inputs.clone(), t.outputs.clone());
    self.report.failures.push(TransformerFailure {
      transformer: id,
      product,
      rule,
      inputs: graph.sorted_paths(&inputs),
      outputs: graph.sorted_paths(&outputs),
      command,
      error,
    });

    for dependent in self.dag.transitive_dependents(id) {
      if self.settled.insert(dependent) {
        warn!(transformer = %dependent, failed_dep = %id, "skipping transformer due to failed dependency");
        self.ready.remove(&dependent);
        self.report.skipped.push((dependent, SkipReason::FailedDependency(id)));
      }
    }

    if !self.keep_going {
      self.aborted = true;
    }
  }

  fn into_report(mut self) -> BuildReport {
    let reason = if self.report.canceled {
      SkipReason::Canceled
    } else {
      SkipReason::BuildAborted
    };
    for id in self.dag.transformers() {
      if !self.settled.contains(&id) {
        self.report.skipped.push((id, reason));
      }
    }
    self.report
  }
}

/// Checks and records the outputs of a successful transformer.
///
/// `previous` holds the output timestamps from before the run.
fn settle_outputs(
  graph: &mut BuildGraph,
  id: TransformerId,
  previous: &[(ArtifactId, Option<FileTime>)],
) -> Result<(), ExecuteError> {
  let now = FileTime::now();
  for (artifact_id, before) in previous {
    let Some(artifact) = graph.artifact_mut(*artifact_id) else {
      continue;
    };
    match artifact.file.refresh_timestamp() {
      Some(after) => {
        if Some(after) == *before {
          debug!(transformer = %id, output = %artifact.path().display(), "output not touched");
        }
      }
      None if artifact.always_updated => {
        return Err(ExecuteError::OutputNotCreated(artifact.path().to_path_buf()));
      }
      None => artifact.file.set_timestamp(now),
    }
  }
  Ok(())
}

/// Product-level views shared by every job of a product.
#[derive(Default)]
struct ScopeSource {
  products: HashMap<String, (Arc<ProductContext>, Arc<ArtifactViewsByTag>)>,
}

impl ScopeSource {
  fn product(&mut self, graph: &BuildGraph, name: &str) -> Result<(Arc<ProductContext>, Arc<ArtifactViewsByTag>), ExecuteError> {
    if let Some(entry) = self.products.get(name) {
      return Ok(entry.clone());
    }
    let data = graph
      .product(name)
      .ok_or_else(|| ExecuteError::UnknownProduct(name.to_string()))?;

    let mut by_tag = ArtifactViewsByTag::new();
    for artifact in data.artifacts.iter().filter_map(|id| graph.artifact(*id)) {
      let view = ArtifactView::from_artifact(artifact);
      for tag in &artifact.file_tags {
        by_tag.entry(tag.clone()).or_default().push(view.clone());
      }
    }
    for views in by_tag.values_mut() {
      views.sort_by(|a, b| a.file_path.cmp(&b.file_path));
    }

    let entry = (Arc::new(data.context.clone()), Arc::new(by_tag));
    self.products.insert(name.to_string(), entry.clone());
    Ok(entry)
  }
}

fn views(graph: &BuildGraph, ids: &BTreeSet<ArtifactId>) -> Vec<ArtifactView> {
  let mut views: Vec<ArtifactView> = ids
    .iter()
    .filter_map(|id| graph.artifact(*id))
    .map(ArtifactView::from_artifact)
    .collect();
  views.sort_by(|a, b| a.file_path.cmp(&b.file_path));
  views
}

#[allow(clippy::too_many_arguments)]
fn prepare_job(
  graph: &BuildGraph,
  id: TransformerId,
  engine: Arc<dyn ScriptEngine>,
  environments: &EnvironmentCache,
  base_env: &Arc<Environment>,
  canceler: &Canceler,
  scopes: &mut ScopeSource,
  permit: OwnedSemaphorePermit,
) -> Result<Job, ExecuteError> {
  let t = graph
    .transformer(id)
    .ok_or_else(|| ExecuteError::Internal(format!("transformer {id} vanished")))?;
  let (product, product_artifacts) = scopes.product(graph, &t.product)?;
  let env = environments.pending(&product, EnvironmentKind::Build);

  let scope = ScriptScope {
    product: product.clone(),
    project_properties: Arc::new(graph.project_properties(&product.project).cloned().unwrap_or_default()),
    product_artifacts,
    inputs: views(graph, &t.inputs),
    outputs: views(graph, &t.outputs),
    explicitly_depends_on: views(graph, &t.explicit_dependencies),
    auxiliary_inputs: views(graph, &t.auxiliary_inputs),
  };

  for output in t.outputs.iter().filter_map(|o| graph.artifact(*o)) {
    if let Some(parent) = output.path().parent() {
      std::fs::create_dir_all(parent)?;
    }
  }

  Ok(Job {
    id,
    commands: t.commands.clone(),
    previous: t
      .outputs
      .iter()
      .map(|o| (*o, graph.artifact(*o).and_then(|a| a.file.timestamp())))
      .collect(),
    default_dir: product.build_directory.clone(),
    env,
    base_env: base_env.clone(),
    scope,
    engine,
    recorder: Arc::new(PropertyRecorder::new()),
    canceler: canceler.clone(),
    _permit: permit,
  })
}

/// Everything a worker task needs to run one transformer.
struct Job {
  id: TransformerId,
  commands: Vec<Command>,
  previous: Vec<(ArtifactId, Option<FileTime>)>,
  default_dir: PathBuf,
  /// Computed on first use, off the runtime threads.
  env: PendingEnvironment,
  base_env: Arc<Environment>,
  scope: ScriptScope,
  engine: Arc<dyn ScriptEngine>,
  recorder: Arc<PropertyRecorder>,
  canceler: Canceler,
  _permit: OwnedSemaphorePermit,
}

struct JobResult {
  id: TransformerId,
  previous: Vec<(ArtifactId, Option<FileTime>)>,
  /// Properties read by the script commands of the job.
  reads: PropertyReads,
  /// On failure, the description of the failing command and the error.
  outcome: Result<(), (Option<String>, ExecuteError)>,
}

impl Job {
  /// Runs the job on its own task so a panic still yields a result.
  async fn supervise(self) -> JobResult {
    let (id, previous) = (self.id, self.previous.clone());
    match tokio::spawn(self.run()).await {
      Ok(result) => result,
      Err(e) => {
        error!(transformer = %id, error = %e, "transformer task panicked");
        JobResult {
          id,
          previous,
          reads: PropertyReads::default(),
          outcome: Err((None, ExecuteError::Join(e.to_string()))),
        }
      }
    }
  }

  async fn run(self) -> JobResult {
    let outcome = self.run_commands().await;
    JobResult {
      id: self.id,
      previous: self.previous,
      reads: self.recorder.take().reads,
      outcome,
    }
  }

  async fn run_commands(&self) -> Result<(), (Option<String>, ExecuteError)> {
    let env = self
      .env
      .get(self.engine.clone(), self.base_env.clone())
      .await
      .map_err(|e| (None, ExecuteError::from(e)))?;
    for command in &self.commands {
      if self.canceler.is_canceled() {
        return Err((None, ExecuteError::Canceled));
      }
      let description = command.describe();
      let result = match command {
        Command::Process(cmd) => run_process(
          cmd,
          &env,
          &self.default_dir,
          self.engine.as_ref(),
          &self.canceler,
        )
        .await
        .map(|_| ()),
        Command::Script(cmd) => {
          run_script(
            cmd,
            self.scope.clone(),
            self.engine.clone(),
            self.recorder.clone(),
            &self.canceler,
          )
          .await
        }
      };
      result.map_err(|e| (Some(description), e))?;
    }
    Ok(())
  }
}
