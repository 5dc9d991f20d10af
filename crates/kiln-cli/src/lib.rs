//! kiln - build software from source against a concrete dependency graph.
#![allow(missing_docs)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::doc_markdown)]
//!
//! The command-line front end over `kiln-core`. Every command resolves the
//! state layout from the environment:
//!
//! ```text
//! $KILN_HOME/               (default ~/.kiln)
//! ├── opt/                  install prefixes
//! │   └── .kiln-db/         install database and prefix locks
//! ├── var/stage/            stage directories ($KILN_STAGE_ROOT)
//! ├── repos/builtin/        default recipe repository ($KILN_REPO_PATH)
//! └── etc/                  site configuration scope ($KILN_CONFIG_PATH)
//! ```

pub mod cmd;
pub mod ops;
pub mod ui;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "kiln")]
#[command(author, version, about = "kiln - build software from source against a concrete dependency graph")]
pub struct Cli {
    /// Suppress progress output
    #[arg(short, long, global = true, env = "KILN_QUIET")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Concretize, build and install specs with their dependencies
    Install {
        /// Spec constraints, e.g. zlib@1.3 or hdf5+mpi %gcc ^zlib
        #[arg(required = true)]
        specs: Vec<String>,
        /// Nodes built concurrently
        #[arg(short, long, env = "KILN_JOBS")]
        jobs: Option<usize>,
        /// Cancel the batch after the first failure
        #[arg(long)]
        fail_fast: bool,
        /// Keep stage directories after a successful build
        #[arg(long)]
        keep_stage: bool,
    },
    /// Remove installed specs
    Uninstall {
        /// Spec constraint matched against installed records
        spec: String,
        /// Remove every match instead of requiring a unique one
        #[arg(short, long)]
        all: bool,
        /// Remove even while installed dependents remain
        #[arg(short, long)]
        force: bool,
    },
    /// Fetch, verify and expand sources without building
    Fetch {
        /// Spec constraints
        #[arg(required = true)]
        specs: Vec<String>,
        /// Also fetch every dependency
        #[arg(long)]
        deps: bool,
    },
    /// Detect compilers and add new ones to a configuration scope
    #[command(name = "find-compilers")]
    FindCompilers {
        /// Directories to search (default: PATH)
        paths: Vec<PathBuf>,
        /// Scope to write to (default: highest precedence)
        #[arg(long)]
        scope: Option<String>,
    },
    /// List configured compilers
    Compilers {
        /// Only list one scope's own entries
        #[arg(long)]
        scope: Option<String>,
    },
    /// List recipe repositories in search order
    #[command(name = "list-repos")]
    ListRepos,
    /// Show the concretized dependency graph of a spec
    Spec {
        /// Spec constraint
        spec: String,
    },
    /// List install records
    Find {
        /// Only records satisfying this constraint
        spec: Option<String>,
    },
    /// Show the host platform, operating system and target
    Arch {
        /// Also print the target's features and ancestors
        #[arg(short, long)]
        verbose: bool,
    },
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

/// Dispatch a parsed command line.
pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let quiet = cli.quiet;
    match cli.command {
        Commands::Install {
            specs,
            jobs,
            fail_fast,
            keep_stage,
        } => {
            let options = cmd::install::Options {
                jobs,
                fail_fast,
                keep_stage,
            };
            cmd::install::install(&specs, &options, quiet).await
        }
        Commands::Uninstall { spec, all, force } => cmd::uninstall::uninstall(&spec, all, force, quiet).await,
        Commands::Fetch { specs, deps } => cmd::fetch::fetch(&specs, deps, quiet).await,
        Commands::FindCompilers { paths, scope } => cmd::find_compilers::find_compilers(&paths, scope.as_deref()),
        Commands::Compilers { scope } => cmd::compilers::compilers(scope.as_deref()),
        Commands::ListRepos => cmd::list_repos::list_repos(),
        Commands::Spec { spec } => cmd::spec::spec(&spec).await,
        Commands::Find { spec } => cmd::find::find(spec.as_deref()).await,
        Commands::Arch { verbose } => {
            cmd::arch::arch(verbose);
            Ok(())
        }
        Commands::Completions { shell } => {
            cmd::completions::completions(shell);
            Ok(())
        }
    }
}
