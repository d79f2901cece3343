//! Implementation of the `brick list` command.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Serialize;

use brick_lib::BuildProject;
use brick_lib::lock::Operation;

use super::build_directory;
use crate::output::{OutputFormat, print_info, print_item, print_json, print_stat};

#[derive(Debug, Serialize)]
struct ProductListing {
  name: String,
  targets: Vec<PathBuf>,
  transformers: Vec<TransformerListing>,
}

#[derive(Debug, Serialize)]
struct TransformerListing {
  id: u32,
  rule: String,
  inputs: Vec<PathBuf>,
  outputs: Vec<PathBuf>,
  commands: Vec<String>,
}

pub fn cmd_list(build_dir: &Path, product: Option<&str>, output: OutputFormat) -> Result<()> {
  let build_dir = build_directory(build_dir)?;
  let project = BuildProject::open(&build_dir, Operation::List).context("Failed to open build directory")?;

  if !project.is_resolved() {
    if output.is_json() {
      return print_json(&Vec::<ProductListing>::new());
    }
    print_info("No build graph; run `brick resolve` first");
    return Ok(());
  }

  let names = match product {
    Some(name) if project.graph().product(name).is_none() => bail!("unknown product: {name}"),
    Some(name) => vec![name.to_string()],
    None => project.graph().product_names(),
  };

  let listings: Vec<ProductListing> = names
    .into_iter()
    .map(|name| ProductListing {
      targets: project.target_artifacts(&name),
      transformers: project
        .transformers_of(&name)
        .into_iter()
        .map(|t| TransformerListing {
          id: t.id.0,
          rule: t.rule,
          inputs: t.inputs,
          outputs: t.outputs,
          commands: t.commands,
        })
        .collect(),
      name,
    })
    .collect();

  if output.is_json() {
    return print_json(&listings);
  }

  for listing in &listings {
    println!("{}", listing.name);
    for target in &listing.targets {
      print_stat("Target", &target.display().to_string());
    }
    for transformer in &listing.transformers {
      println!("  #{} {}", transformer.id, transformer.rule);
      for command in &transformer.commands {
        print_item(command);
      }
    }
  }
  Ok(())
}
