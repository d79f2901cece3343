//! Lua implementation of the scripting collaborator.
//!
//! Every evaluation runs in a fresh Lua state. Product, module, project and
//! artifact property tables are empty proxies whose `__index` metamethod
//! looks the value up and reports the read to the observer.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;

use mlua::prelude::*;
use serde_json::Value;

use crate::change::{ArtifactsByTag, Property, PropertyKind};
use crate::command::{Command, ProcessCommand, ScriptCommand};
use crate::graph::ProductContext;
use crate::resolved::{CodeLocation, FileTag, InstallSpec, PropertyMap, Script};

use super::{
  ArtifactView, ArtifactViewsByTag, Environment, EnvironmentScope, NullObserver, OutputArtifactSpec, PropertyObserver,
  ScriptEngine, ScriptError, ScriptScope,
};

/// Script engine backed by Lua 5.4.
#[derive(Debug, Default, Clone, Copy)]
pub struct LuaScriptEngine;

impl LuaScriptEngine {
  pub fn new() -> Self {
    Self
  }
}

impl ScriptEngine for LuaScriptEngine {
  fn prepare(
    &self,
    script: &Script,
    scope: &ScriptScope,
    observer: Arc<dyn PropertyObserver>,
  ) -> Result<Vec<Command>, ScriptError> {
    let lua = Lua::new();
    install_scope(&lua, scope, &observer).map_err(|e| eval_error(&script.location, e))?;
    load_imports(&lua, &script.imports, observer.as_ref(), &script.location)?;

    let value = eval(&lua, script)?;
    commands_from_lua(&lua, value).map_err(|e| invalid_result(&script.location, e))
  }

  fn output_artifacts(
    &self,
    script: &Script,
    scope: &ScriptScope,
    observer: Arc<dyn PropertyObserver>,
  ) -> Result<Vec<OutputArtifactSpec>, ScriptError> {
    let lua = Lua::new();
    install_scope(&lua, scope, &observer).map_err(|e| eval_error(&script.location, e))?;
    load_imports(&lua, &script.imports, observer.as_ref(), &script.location)?;

    let value = eval(&lua, script)?;
    output_specs_from_lua(&lua, value).map_err(|e| invalid_result(&script.location, e))
  }

  fn setup_environment(
    &self,
    script: &Script,
    scope: &EnvironmentScope,
    environment: &mut Environment,
  ) -> Result<(), ScriptError> {
    let lua = Lua::new();
    let observer: Arc<dyn PropertyObserver> = Arc::new(NullObserver);
    let env = Rc::new(RefCell::new(std::mem::take(environment)));

    let installed = install_environment(&lua, scope, &observer, env.clone());
    if let Err(e) = installed {
      *environment = env.take();
      return Err(eval_error(&script.location, e));
    }
    let loaded = load_imports(&lua, &script.imports, observer.as_ref(), &script.location);
    let result = loaded.and_then(|()| eval(&lua, script).map(|_| ()));

    // Hand back whatever the script managed to do, even on failure.
    drop(lua);
    *environment = env.take();
    result
  }

  fn run_command(
    &self,
    command: &ScriptCommand,
    scope: &ScriptScope,
    observer: Arc<dyn PropertyObserver>,
  ) -> Result<(), ScriptError> {
    let location = CodeLocation::default();
    let lua = Lua::new();
    install_scope(&lua, scope, &observer).map_err(|e| eval_error(&location, e))?;
    let properties = json_to_lua(&lua, &Value::Object(command.properties.clone())).map_err(|e| eval_error(&location, e))?;
    lua
      .globals()
      .set("properties", properties)
      .map_err(|e| eval_error(&location, e))?;
    load_imports(&lua, &command.imports, observer.as_ref(), &location)?;

    lua
      .load(command.source_code.as_str())
      .set_name("=script command")
      .exec()
      .map_err(|e| eval_error(&location, e))
  }

  fn filter_output(&self, filter: &Script, output: &str) -> Result<String, ScriptError> {
    let lua = Lua::new();
    lua
      .globals()
      .set("output", output)
      .map_err(|e| eval_error(&filter.location, e))?;

    match eval(&lua, filter)? {
      LuaValue::Nil => Ok(output.to_string()),
      LuaValue::String(s) => Ok(s.to_string_lossy()),
      other => Err(ScriptError::InvalidResult {
        location: filter.location.clone(),
        message: format!("filter must return a string, got {}", other.type_name()),
      }),
    }
  }
}

fn eval_error(location: &CodeLocation, error: LuaError) -> ScriptError {
  ScriptError::Evaluation {
    location: location.clone(),
    message: error.to_string(),
  }
}

fn invalid_result(location: &CodeLocation, error: LuaError) -> ScriptError {
  ScriptError::InvalidResult {
    location: location.clone(),
    message: error.to_string(),
  }
}

fn chunk_name(location: &CodeLocation) -> String {
  if location.file.as_os_str().is_empty() {
    "=script".to_string()
  } else {
    format!("@{location}")
  }
}

fn eval(lua: &Lua, script: &Script) -> Result<LuaValue, ScriptError> {
  lua
    .load(script.source.as_str())
    .set_name(chunk_name(&script.location))
    .eval::<LuaValue>()
    .map_err(|e| eval_error(&script.location, e))
}

/// Runs library files before the script body and records them as imported.
fn load_imports(
  lua: &Lua,
  imports: &[PathBuf],
  observer: &dyn PropertyObserver,
  location: &CodeLocation,
) -> Result<(), ScriptError> {
  for path in imports {
    let content = std::fs::read_to_string(path).map_err(|source| ScriptError::Import {
      path: path.clone(),
      source,
    })?;
    observer.file_imported(path);
    lua
      .load(content.as_str())
      .set_name(format!("@{}", path.display()))
      .exec()
      .map_err(|e| eval_error(location, e))?;
  }
  Ok(())
}

// -- value conversion -------------------------------------------------------

fn json_to_lua(lua: &Lua, value: &Value) -> LuaResult<LuaValue> {
  let options = LuaSerializeOptions::new()
    .serialize_none_to_null(false)
    .serialize_unit_to_null(false);
  lua.to_value_with(value, options)
}

fn lua_to_json(lua: &Lua, value: LuaValue) -> LuaResult<Value> {
  lua.from_value(value)
}

fn lua_to_property_map(lua: &Lua, value: Option<LuaValue>) -> LuaResult<PropertyMap> {
  match value {
    None | Some(LuaValue::Nil) => Ok(PropertyMap::new()),
    Some(value) => match lua_to_json(lua, value)? {
      Value::Object(map) => Ok(map),
      // An empty Lua table has no keys to tell a map from a list.
      Value::Array(items) if items.is_empty() => Ok(PropertyMap::new()),
      other => Err(LuaError::external(format!("expected a table of properties, got {other}"))),
    },
  }
}

fn string_list(lua: &Lua, items: impl IntoIterator<Item = String>) -> LuaResult<LuaTable> {
  lua.create_sequence_from(items)
}

// -- proxies ----------------------------------------------------------------

/// Creates an empty table whose field reads are answered by `reader`.
fn proxy<F>(lua: &Lua, reader: F) -> LuaResult<LuaTable>
where
  F: Fn(&Lua, String) -> LuaResult<LuaValue> + 'static,
{
  let table = lua.create_table()?;
  let mt = lua.create_table()?;
  let index = lua.create_function(move |lua, (_table, key): (LuaTable, String)| reader(lua, key))?;
  mt.set("__index", index)?;
  mt.set(
    "__newindex",
    lua.create_function(|_, (_table, key, _value): (LuaTable, String, LuaValue)| {
      Err::<(), _>(LuaError::external(format!("property '{key}' is read-only")))
    })?,
  )?;
  table.set_metatable(Some(mt))?;
  Ok(table)
}

fn install_scope(lua: &Lua, scope: &ScriptScope, observer: &Arc<dyn PropertyObserver>) -> LuaResult<()> {
  let globals = lua.globals();

  globals.set(
    "product",
    product_proxy(lua, scope.product.clone(), scope.product_artifacts.clone(), observer.clone())?,
  )?;
  globals.set(
    "project",
    project_proxy(lua, &scope.product.project, scope.project_properties.clone(), observer.clone())?,
  )?;

  let groups = [
    ("inputs", "input", &scope.inputs),
    ("outputs", "output", &scope.outputs),
    ("explicitlyDependsOn", "", &scope.explicitly_depends_on),
    ("auxiliaryInputs", "", &scope.auxiliary_inputs),
  ];
  for (plural, singular, views) in groups {
    globals.set(plural, artifacts_by_tag_table(lua, views, observer)?)?;
    if !singular.is_empty()
      && let Some(first) = views.first()
    {
      globals.set(singular, artifact_table(lua, first, observer.clone())?)?;
    }
  }

  Ok(())
}

fn install_environment(
  lua: &Lua,
  scope: &EnvironmentScope,
  observer: &Arc<dyn PropertyObserver>,
  env: Rc<RefCell<Environment>>,
) -> LuaResult<()> {
  let globals = lua.globals();
  let empty = Arc::new(ArtifactViewsByTag::new());
  globals.set(
    "product",
    product_proxy(lua, scope.product.clone(), empty, observer.clone())?,
  )?;
  globals.set(
    "module",
    module_proxy(lua, scope.product.clone(), scope.module.clone(), observer.clone())?,
  )?;

  let get_env = env.clone();
  globals.set(
    "getEnv",
    lua.create_function(move |_, name: String| Ok(get_env.borrow().get(&name).cloned()))?,
  )?;

  let put_env = env.clone();
  globals.set(
    "putEnv",
    lua.create_function(move |_, (name, value): (String, String)| {
      put_env.borrow_mut().insert(name, value);
      Ok(())
    })?,
  )?;

  let unset_env = env;
  globals.set(
    "unsetEnv",
    lua.create_function(move |_, name: String| {
      unset_env.borrow_mut().remove(&name);
      Ok(())
    })?,
  )?;

  Ok(())
}

fn product_proxy(
  lua: &Lua,
  product: Arc<ProductContext>,
  artifacts: Arc<ArtifactViewsByTag>,
  observer: Arc<dyn PropertyObserver>,
) -> LuaResult<LuaTable> {
  proxy(lua, move |lua, key| match key.as_str() {
    "name" => Ok(LuaValue::String(lua.create_string(&product.name)?)),
    "buildDirectory" => Ok(LuaValue::String(
      lua.create_string(product.build_directory.to_string_lossy().as_ref())?,
    )),
    "dependencies" => {
      observer.dependencies_read(&product.dependencies);
      Ok(LuaValue::Table(string_list(lua, product.dependencies.iter().cloned())?))
    }
    "modules" => Ok(LuaValue::Table(modules_proxy(lua, product.clone(), observer.clone())?)),
    "parameters" => Ok(LuaValue::Table(parameters_proxy(lua, product.clone(), observer.clone())?)),
    "artifacts" => Ok(LuaValue::Table(product_artifacts_proxy(
      lua,
      artifacts.clone(),
      observer.clone(),
    )?)),
    _ => {
      let value = product.product_property(&key);
      observer.property_read(Property::new(PropertyKind::Product, &product.name, "", &key, value.clone()));
      json_to_lua(lua, &value)
    }
  })
}

fn modules_proxy(lua: &Lua, product: Arc<ProductContext>, observer: Arc<dyn PropertyObserver>) -> LuaResult<LuaTable> {
  proxy(lua, move |lua, module| {
    if product.module(&module).is_none() {
      return Ok(LuaValue::Nil);
    }
    Ok(LuaValue::Table(module_proxy(lua, product.clone(), module, observer.clone())?))
  })
}

fn module_proxy(
  lua: &Lua,
  product: Arc<ProductContext>,
  module: String,
  observer: Arc<dyn PropertyObserver>,
) -> LuaResult<LuaTable> {
  proxy(lua, move |lua, name| {
    let value = product.module_property(&module, &name).unwrap_or(Value::Null);
    observer.property_read(Property::new(
      PropertyKind::Module,
      &product.name,
      &module,
      &name,
      value.clone(),
    ));
    json_to_lua(lua, &value)
  })
}

fn parameters_proxy(
  lua: &Lua,
  product: Arc<ProductContext>,
  observer: Arc<dyn PropertyObserver>,
) -> LuaResult<LuaTable> {
  proxy(lua, move |lua, dependency| {
    let present = product.dependencies.contains(&dependency);
    observer.dependency_requested(&dependency, present);
    if !present && !product.module_parameters.contains_key(&dependency) {
      return Ok(LuaValue::Nil);
    }

    let product = product.clone();
    let observer = observer.clone();
    let table = proxy(lua, move |lua, name| {
      let value = product.parameter(&dependency, &name).unwrap_or(Value::Null);
      observer.property_read(Property::new(
        PropertyKind::Parameters,
        &product.name,
        &dependency,
        &name,
        value.clone(),
      ));
      json_to_lua(lua, &value)
    })?;
    Ok(LuaValue::Table(table))
  })
}

fn product_artifacts_proxy(
  lua: &Lua,
  artifacts: Arc<ArtifactViewsByTag>,
  observer: Arc<dyn PropertyObserver>,
) -> LuaResult<LuaTable> {
  let lookup = artifacts.clone();
  let lookup_observer = observer.clone();
  let table = proxy(lua, move |lua, tag| {
    let tag = FileTag(tag);
    let views: &[ArtifactView] = lookup.get(&tag).map(Vec::as_slice).unwrap_or_default();
    let paths: BTreeSet<PathBuf> = views.iter().map(|v| v.file_path.clone()).collect();
    lookup_observer.artifacts_requested(&tag, paths);
    Ok(LuaValue::Table(artifact_list(lua, views, &lookup_observer)?))
  })?;

  let pairs = lua.create_function(move |lua, _table: LuaTable| {
    let current: ArtifactsByTag = artifacts
      .iter()
      .map(|(tag, views)| (tag.clone(), views.iter().map(|v| v.file_path.clone()).collect()))
      .collect();
    observer.artifacts_enumerated(&current);

    let full = lua.create_table()?;
    for (tag, views) in artifacts.iter() {
      full.set(tag.as_str(), artifact_list(lua, views, &observer)?)?;
    }
    let next: LuaFunction = lua.globals().get("next")?;
    Ok((next, full, LuaValue::Nil))
  })?;
  if let Some(mt) = table.metatable() {
    mt.set("__pairs", pairs)?;
  }

  Ok(table)
}

fn project_proxy(
  lua: &Lua,
  project: &str,
  properties: Arc<PropertyMap>,
  observer: Arc<dyn PropertyObserver>,
) -> LuaResult<LuaTable> {
  let project = project.to_string();
  proxy(lua, move |lua, key| {
    if key == "name" {
      return Ok(LuaValue::String(lua.create_string(&project)?));
    }
    let value = properties.get(&key).cloned().unwrap_or(Value::Null);
    observer.property_read(Property::new(PropertyKind::Project, &project, "", &key, value.clone()));
    json_to_lua(lua, &value)
  })
}

fn artifact_list(lua: &Lua, views: &[ArtifactView], observer: &Arc<dyn PropertyObserver>) -> LuaResult<LuaTable> {
  let list = lua.create_table()?;
  for (i, view) in views.iter().enumerate() {
    list.set(i + 1, artifact_table(lua, view, observer.clone())?)?;
  }
  Ok(list)
}

/// `inputs.cpp`, `outputs.obj`: tag to list of artifacts.
fn artifacts_by_tag_table(
  lua: &Lua,
  views: &[ArtifactView],
  observer: &Arc<dyn PropertyObserver>,
) -> LuaResult<LuaTable> {
  let table = lua.create_table()?;
  let mut by_tag: ArtifactViewsByTag = ArtifactViewsByTag::new();
  for view in views {
    for tag in &view.file_tags {
      by_tag.entry(tag.clone()).or_default().push(view.clone());
    }
  }
  for (tag, tagged) in &by_tag {
    table.set(tag.as_str(), artifact_list(lua, tagged, observer)?)?;
  }
  Ok(table)
}

fn artifact_table(lua: &Lua, view: &ArtifactView, observer: Arc<dyn PropertyObserver>) -> LuaResult<LuaTable> {
  let view = Arc::new(view.clone());
  let plain_view = view.clone();
  let plain_observer = observer.clone();
  let table = proxy(lua, move |lua, key| {
    if key == "modules" {
      return Ok(LuaValue::Table(artifact_modules_proxy(
        lua,
        plain_view.clone(),
        plain_observer.clone(),
      )?));
    }
    let value = plain_view.property("", &key);
    plain_observer.artifact_property_read(
      &plain_view.file_path,
      Property::new(PropertyKind::Artifact, &plain_view.product, "", &key, value.clone()),
    );
    json_to_lua(lua, &value)
  })?;

  table.raw_set("filePath", path_string(&view.file_path))?;
  table.raw_set("fileName", view.file_name.as_str())?;
  table.raw_set("baseName", view.base_name.as_str())?;
  table.raw_set("completeBaseName", view.complete_base_name.as_str())?;
  table.raw_set("suffix", view.suffix.as_str())?;
  table.raw_set("fileDir", path_string(&view.file_dir))?;
  table.raw_set(
    "fileTags",
    string_list(lua, view.file_tags.iter().map(|t| t.0.clone()))?,
  )?;
  Ok(table)
}

fn artifact_modules_proxy(
  lua: &Lua,
  view: Arc<ArtifactView>,
  observer: Arc<dyn PropertyObserver>,
) -> LuaResult<LuaTable> {
  proxy(lua, move |lua, module| {
    let view = view.clone();
    let observer = observer.clone();
    let table = proxy(lua, move |lua, name| {
      let value = view.property(&module, &name);
      observer.artifact_property_read(
        &view.file_path,
        Property::new(PropertyKind::Artifact, &view.product, &module, &name, value.clone()),
      );
      json_to_lua(lua, &value)
    })?;
    Ok(LuaValue::Table(table))
  })
}

fn path_string(path: &Path) -> String {
  path.to_string_lossy().into_owned()
}

// -- results ----------------------------------------------------------------

/// A prepare script returns one command table or a list of them.
fn commands_from_lua(lua: &Lua, value: LuaValue) -> LuaResult<Vec<Command>> {
  match value {
    LuaValue::Nil => Ok(Vec::new()),
    LuaValue::Table(t) if is_command_table(&t)? => Ok(vec![command_from_table(lua, &t)?]),
    LuaValue::Table(t) => {
      let mut commands = Vec::new();
      for i in 1..=t.raw_len() {
        let entry: LuaTable = t.get(i)?;
        commands.push(command_from_table(lua, &entry)?);
      }
      Ok(commands)
    }
    other => Err(LuaError::external(format!(
      "prepare script must return a command or a list of commands, got {}",
      other.type_name()
    ))),
  }
}

fn is_command_table(t: &LuaTable) -> LuaResult<bool> {
  Ok(t.contains_key("program")? || t.contains_key("sourceCode")?)
}

fn command_from_table(lua: &Lua, t: &LuaTable) -> LuaResult<Command> {
  if t.contains_key("program")? {
    let mut cmd = ProcessCommand::new(t.get::<String>("program")?);
    cmd.arguments = t.get::<Option<Vec<String>>>("arguments")?.unwrap_or_default();
    cmd.working_directory = t.get::<Option<String>>("workingDirectory")?.map(PathBuf::from);
    if let Some(env) = t.get::<Option<LuaTable>>("environment")? {
      for pair in env.pairs::<String, String>() {
        let (k, v) = pair?;
        cmd.environment.insert(k, v);
      }
    }
    if let Some(code) = t.get::<Option<i32>>("maxExitCode")? {
      cmd.max_exit_code = code;
    }
    cmd.response_file_threshold = t.get::<Option<usize>>("responseFileThreshold")?.unwrap_or(0);
    cmd.response_file_argument_index = t.get::<Option<usize>>("responseFileArgumentIndex")?.unwrap_or(0);
    if let Some(prefix) = t.get::<Option<String>>("responseFileUsagePrefix")? {
      cmd.response_file_usage_prefix = prefix;
    }
    cmd.stdout_filter = t.get::<Option<String>>("stdoutFilterFunction")?.map(Script::new);
    cmd.stderr_filter = t.get::<Option<String>>("stderrFilterFunction")?.map(Script::new);
    cmd.stdout_file_path = t.get::<Option<String>>("stdoutFilePath")?.map(PathBuf::from);
    cmd.stderr_file_path = t.get::<Option<String>>("stderrFilePath")?.map(PathBuf::from);
    cmd.relevant_environment_variables = t
      .get::<Option<Vec<String>>>("relevantEnvironmentVariables")?
      .unwrap_or_default()
      .into_iter()
      .collect();
    cmd.description = t.get::<Option<String>>("description")?.unwrap_or_default();
    cmd.highlight = t.get::<Option<String>>("highlight")?.unwrap_or_default();
    cmd.silent = t.get::<Option<bool>>("silent")?.unwrap_or(false);
    return Ok(Command::Process(cmd));
  }

  if t.contains_key("sourceCode")? {
    let mut cmd = ScriptCommand::new(t.get::<String>("sourceCode")?);
    cmd.properties = lua_to_property_map(lua, t.get::<Option<LuaValue>>("properties")?)?;
    cmd.imports = t
      .get::<Option<Vec<String>>>("imports")?
      .unwrap_or_default()
      .into_iter()
      .map(PathBuf::from)
      .collect();
    cmd.description = t.get::<Option<String>>("description")?.unwrap_or_default();
    cmd.silent = t.get::<Option<bool>>("silent")?.unwrap_or(false);
    return Ok(Command::Script(cmd));
  }

  Err(LuaError::external("command table needs either 'program' or 'sourceCode'"))
}

fn output_specs_from_lua(lua: &Lua, value: LuaValue) -> LuaResult<Vec<OutputArtifactSpec>> {
  let LuaValue::Table(list) = value else {
    return Err(LuaError::external(format!(
      "output artifacts script must return a list, got {}",
      value.type_name()
    )));
  };

  let mut specs = Vec::new();
  for i in 1..=list.raw_len() {
    let t: LuaTable = list.get(i)?;
    let install = match t.get::<Option<LuaTable>>("install")? {
      Some(install) => Some(InstallSpec {
        prefix: install.get::<Option<String>>("prefix")?.map(PathBuf::from).unwrap_or_default(),
        dir: install.get::<Option<String>>("dir")?.map(PathBuf::from).unwrap_or_default(),
        source_base: install.get::<Option<String>>("sourceBase")?.map(PathBuf::from),
      }),
      None => None,
    };
    specs.push(OutputArtifactSpec {
      file_path: PathBuf::from(t.get::<String>("filePath")?),
      file_tags: t
        .get::<Option<Vec<String>>>("fileTags")?
        .unwrap_or_default()
        .into_iter()
        .map(FileTag)
        .collect(),
      always_updated: t.get::<Option<bool>>("alwaysUpdated")?.unwrap_or(true),
      properties: lua_to_property_map(lua, t.get::<Option<LuaValue>>("properties")?)?,
      install,
    });
  }
  Ok(specs)
}
