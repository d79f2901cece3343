//! brick-lib: the build graph engine behind brick.
//!
//! A resolved project model goes through these stages:
//! - `resolve`: rules fire over tagged artifacts and produce transformers in
//!   a persistent `BuildGraph`, rescuing whatever is unchanged since the
//!   last run (`change`)
//! - `execute`: stale transformers run their commands in dependency order
//!   with bounded parallelism
//! - `install`: installable artifacts are copied into an install root
//!
//! `project::BuildProject` wraps the stages into one session per build
//! directory.

pub mod change;
pub mod command;
pub mod consts;
pub mod env;
pub mod error;
pub mod execute;
pub mod file;
pub mod graph;
pub mod install;
pub mod lock;
pub mod persist;
pub mod platform;
pub mod project;
pub mod resolve;
pub mod resolved;
pub mod rules;
pub mod scan;
pub mod script;
pub mod util;

pub use error::{Error, Result};
pub use project::BuildProject;
