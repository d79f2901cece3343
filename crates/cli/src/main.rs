mod cmd;
mod output;

use std::num::NonZeroUsize;
use std::path::PathBuf;

use anyhow::Result;
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::cmd::{BuildArgs, InstallArgs};
use crate::output::OutputFormat;

/// brick - build graph engine
#[derive(Parser)]
#[command(name = "brick")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Increase log verbosity (-v info, -vv debug)
  #[arg(short, long, action = ArgAction::Count, global = true)]
  verbose: u8,

  /// Build directory holding the build graph and generated files
  #[arg(long, default_value = "build", global = true)]
  build_dir: PathBuf,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Resolve a project into the build graph without building
  Resolve {
    /// Resolved project model (JSON)
    project: PathBuf,

    /// Re-run every prepare script
    #[arg(long)]
    force_prepare: bool,
  },

  /// Resolve a project and build its products
  Build {
    /// Resolved project model (JSON)
    project: PathBuf,

    #[command(flatten)]
    options: BuildOptions,
  },

  /// Resolve a project and install its installable artifacts
  Install {
    /// Resolved project model (JSON)
    project: PathBuf,

    #[command(flatten)]
    options: InstallOptions,
  },

  /// Delete all generated files of the stored build graph
  Clean,

  /// List products, target artifacts and transformer commands
  List {
    /// Only list this product
    #[arg(short, long)]
    product: Option<String>,

    /// Output format
    #[arg(short = 'o', long, value_enum, default_value = "text")]
    output: OutputFormat,
  },
}

#[derive(Args)]
struct BuildOptions {
  /// Number of transformers to run in parallel
  #[arg(short, long)]
  jobs: Option<NonZeroUsize>,

  /// Keep building independent transformers after a failure
  #[arg(short, long)]
  keep_going: bool,

  /// Print the commands that would run without running them
  #[arg(short = 'n', long)]
  dry_run: bool,

  /// Read output timestamps from disk instead of trusting the stored ones
  #[arg(long)]
  check_outputs: bool,

  /// Only build these products (and what they depend on)
  #[arg(short, long = "product")]
  products: Vec<String>,
}

#[derive(Args)]
struct InstallOptions {
  /// Install root (default: <build-dir>/install-root)
  #[arg(long)]
  install_root: Option<PathBuf>,

  /// Remove the install root before installing
  #[arg(long)]
  clean_install_root: bool,

  /// Print what would be installed without copying
  #[arg(short = 'n', long)]
  dry_run: bool,

  /// Keep installing after a failed copy
  #[arg(short, long)]
  keep_going: bool,

  /// Only install artifacts of these products
  #[arg(short, long = "product")]
  products: Vec<String>,
}

fn init_tracing(verbose: u8) {
  let level = match verbose {
    0 => "warn",
    1 => "info",
    _ => "debug",
  };
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .without_time()
    .init();
}

fn main() -> Result<()> {
  let cli = Cli::parse();
  init_tracing(cli.verbose);

  match cli.command {
    Commands::Resolve { project, force_prepare } => cmd::cmd_resolve(&project, &cli.build_dir, force_prepare),
    Commands::Build { project, options } => cmd::cmd_build(
      &project,
      &cli.build_dir,
      BuildArgs {
        jobs: options.jobs.map(NonZeroUsize::get),
        keep_going: options.keep_going,
        dry_run: options.dry_run,
        check_outputs: options.check_outputs,
        products: options.products,
      },
    ),
    Commands::Install { project, options } => cmd::cmd_install(
      &project,
      &cli.build_dir,
      InstallArgs {
        install_root: options.install_root,
        clean_install_root: options.clean_install_root,
        dry_run: options.dry_run,
        keep_going: options.keep_going,
        products: options.products,
      },
    ),
    Commands::Clean => cmd::cmd_clean(&cli.build_dir),
    Commands::List { product, output } => cmd::cmd_list(&cli.build_dir, product.as_deref(), output),
  }
}
