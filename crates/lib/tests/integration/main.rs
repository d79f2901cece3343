//! Integration tests for the build session: resolve, build, install and clean
//! against real files in a temp directory.

mod common;

#[cfg(unix)]
mod build_tests;
#[cfg(unix)]
mod install_tests;
mod persist_tests;
