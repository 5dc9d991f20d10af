//! kiln engine: microarchitectures, fetching, compilers, recipe repositories,
//! concretization and the installer.
//!
//! A typical session:
//!
//! 1. [`KilnPaths::from_env`] locates state, repositories and config scopes.
//! 2. [`repo::Registry`] opens the repositories.
//! 3. [`concretize::Concretizer`] turns an `AbstractSpec` into a concrete graph
//!    using compilers from [`compiler::CompilerRegistry`].
//! 4. [`installer::Installer`] fetches and builds every node.

pub mod compiler;
pub mod concretize;
pub mod config;
pub mod fetch;
pub mod installer;
pub mod microarch;
pub mod paths;
pub mod process;
pub mod repo;
pub mod reporter;

pub use paths::KilnPaths;
pub use reporter::{NullReporter, Reporter};

/// User agent sent with every download.
pub const USER_AGENT: &str = concat!("kiln/", env!("CARGO_PKG_VERSION"));
