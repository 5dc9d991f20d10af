//! One module per subcommand.

pub mod arch;
pub mod compilers;
pub mod completions;
pub mod fetch;
pub mod find;
pub mod find_compilers;
pub mod install;
pub mod list_repos;
pub mod spec;
pub mod uninstall;
