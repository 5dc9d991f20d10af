//! The environment a recipe phase runs in.
//!
//! Every step gets a [`BuildContext`] describing one node: its install
//! prefix, the stage it builds in, the prefixes of its dependencies, and the
//! compiler it must use. Commands started through the context inherit the
//! caller's environment minus library search paths left over from the host,
//! plus the variables below.
//!
//! | Variable | Value |
//! |---|---|
//! | `PREFIX`, `KILN_PREFIX` | install prefix |
//! | `JOBS` | parallel build jobs |
//! | `CC`, `CXX`, `F77`, `FC` | compiler drivers |
//! | `CFLAGS` .. `LDFLAGS` | configured compiler flags |
//! | `KILN_TARGET_FLAGS` | microarchitecture optimization flags |
//! | `DEP_<NAME>` | each dependency's prefix |
//! | `PATH`, `CMAKE_PREFIX_PATH`, `PKG_CONFIG_PATH` | dependency prefixes prepended |

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use kiln_schema::ConcreteSpec;
use thiserror::Error;

use crate::compiler::CompilerDescriptor;
use crate::fetch::Stage;
use crate::process::{self, ProcessError, RunLimits};

/// Host variables removed before every build command.
pub const SCRUBBED_VARS: [&str; 5] = [
    "LD_LIBRARY_PATH",
    "LIBRARY_PATH",
    "CPATH",
    "LD_RUN_PATH",
    "DYLD_LIBRARY_PATH",
];

/// Errors raised by a phase step.
#[derive(Debug, Error)]
pub enum BuildError {
    /// A command failed, timed out or was cancelled.
    #[error(transparent)]
    Process(#[from] ProcessError),
    /// Filesystem error inside the stage or prefix.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// The recipe has no step for the phase.
    #[error("no step for phase '{0}'")]
    UnknownPhase(String),
    /// A programmatic recipe rejected the build.
    #[error("{0}")]
    Step(String),
}

impl BuildError {
    /// Taxonomy name.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Process(ProcessError::TimedOut { .. }) => "Timeout",
            Self::Process(ProcessError::Cancelled { .. }) => "Cancelled",
            Self::Process(_) => "CommandFailed",
            Self::Io(_) => "Io",
            Self::UnknownPhase(_) => "UnknownPhase",
            Self::Step(_) => "StepFailed",
        }
    }
}

/// Inputs for one node's phases.
#[derive(Debug, Clone)]
pub struct BuildContext {
    spec: Arc<ConcreteSpec>,
    prefix: PathBuf,
    stage: Stage,
    dependencies: BTreeMap<String, PathBuf>,
    compiler: Option<CompilerDescriptor>,
    target_flags: String,
    jobs: usize,
    limits: RunLimits,
    extra_env: BTreeMap<String, String>,
}

fn dep_var(name: &str) -> String {
    let mut var = String::from("DEP_");
    var.extend(
        name.chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' }),
    );
    var
}

fn prepend_paths(dirs: &[PathBuf], current: Option<OsString>) -> Option<OsString> {
    let existing = current.map(|c| std::env::split_paths(&c).collect::<Vec<_>>());
    let all = dirs.iter().cloned().chain(existing.into_iter().flatten());
    std::env::join_paths(all).ok()
}

impl BuildContext {
    /// Context for building `spec` into `prefix` from `stage`.
    pub fn new(spec: Arc<ConcreteSpec>, prefix: PathBuf, stage: Stage) -> Self {
        Self {
            spec,
            prefix,
            stage,
            dependencies: BTreeMap::new(),
            compiler: None,
            target_flags: String::new(),
            jobs: num_cpus::get(),
            limits: RunLimits::default(),
            extra_env: BTreeMap::new(),
        }
    }

    /// Expose a dependency prefix.
    pub fn with_dependency(mut self, name: impl Into<String>, prefix: PathBuf) -> Self {
        self.dependencies.insert(name.into(), prefix);
        self
    }

    /// Compiler whose drivers and flags are exported.
    pub fn with_compiler(mut self, compiler: CompilerDescriptor) -> Self {
        self.compiler = Some(compiler);
        self
    }

    /// Optimization flags for the target.
    pub fn with_target_flags(mut self, flags: impl Into<String>) -> Self {
        self.target_flags = flags.into();
        self
    }

    /// Parallel build jobs, at least 1.
    pub fn with_jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs.max(1);
        self
    }

    /// Timeout and cancellation applied to every command.
    pub fn with_limits(mut self, limits: RunLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Export `key=value` as well.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_env.insert(key.into(), value.into());
        self
    }

    /// Spec being built.
    pub fn spec(&self) -> &Arc<ConcreteSpec> {
        &self.spec
    }

    /// Install prefix.
    pub fn prefix(&self) -> &Path {
        &self.prefix
    }

    /// Stage directory.
    pub fn stage(&self) -> &Stage {
        &self.stage
    }

    /// Directory holding the expanded sources; commands start here.
    pub fn source_dir(&self) -> PathBuf {
        self.stage.source_path()
    }

    /// Build log inside the stage.
    pub fn log_path(&self) -> PathBuf {
        self.stage.build_log()
    }

    /// Prefix of dependency `name`.
    pub fn dependency_prefix(&self, name: &str) -> Option<&Path> {
        self.dependencies.get(name).map(PathBuf::as_path)
    }

    /// Compiler, if one was bound.
    pub fn compiler(&self) -> Option<&CompilerDescriptor> {
        self.compiler.as_ref()
    }

    /// Subprocess limits.
    pub fn limits(&self) -> &RunLimits {
        &self.limits
    }

    /// Variables set on every command, in name order.
    pub fn env_vars(&self) -> BTreeMap<String, OsString> {
        let mut vars: BTreeMap<String, OsString> = BTreeMap::new();
        vars.insert("PREFIX".into(), self.prefix.clone().into_os_string());
        vars.insert("KILN_PREFIX".into(), self.prefix.clone().into_os_string());
        vars.insert("JOBS".into(), self.jobs.to_string().into());
        vars.insert("KILN_TARGET_FLAGS".into(), self.target_flags.clone().into());

        if let Some(compiler) = &self.compiler {
            let drivers = [
                ("CC", &compiler.paths.cc),
                ("CXX", &compiler.paths.cxx),
                ("F77", &compiler.paths.f77),
                ("FC", &compiler.paths.fc),
            ];
            for (var, path) in drivers {
                if let Some(path) = path {
                    vars.insert(var.into(), path.clone().into_os_string());
                }
            }
            for (var, value) in compiler.flags.env_pairs() {
                vars.insert(var.into(), value.into());
            }
        }

        let prefixes: Vec<PathBuf> = self.dependencies.values().cloned().collect();
        for (name, prefix) in &self.dependencies {
            vars.insert(dep_var(name), prefix.clone().into_os_string());
        }
        if !prefixes.is_empty() {
            let bins: Vec<PathBuf> = prefixes.iter().map(|p| p.join("bin")).collect();
            let pkgconfig: Vec<PathBuf> = prefixes
                .iter()
                .flat_map(|p| [p.join("lib").join("pkgconfig"), p.join("share").join("pkgconfig")])
                .collect();
            let lookups = [
                ("PATH", bins),
                ("CMAKE_PREFIX_PATH", prefixes),
                ("PKG_CONFIG_PATH", pkgconfig),
            ];
            for (var, dirs) in lookups {
                if let Some(joined) = prepend_paths(&dirs, std::env::var_os(var)) {
                    vars.insert(var.into(), joined);
                }
            }
        }

        for (k, v) in &self.extra_env {
            vars.insert(k.clone(), v.into());
        }
        vars
    }

    /// A command already wired to the build environment and source directory.
    pub fn command(&self, program: impl AsRef<std::ffi::OsStr>) -> Command {
        let mut cmd = Command::new(program);
        cmd.current_dir(self.source_dir());
        for var in SCRUBBED_VARS {
            cmd.env_remove(var);
        }
        cmd.envs(self.env_vars());
        cmd
    }

    /// Run `program` with `args`, logging to the stage build log.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::Process`] when the command fails.
    pub async fn run<I, S>(&self, program: &str, args: I) -> Result<(), BuildError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut cmd = self.command(program);
        cmd.args(args);
        process::run(cmd, Some(&self.log_path()), &self.limits).await?;
        Ok(())
    }

    /// Run a shell script with `sh -e`.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::Process`] when the script fails.
    pub async fn run_script(&self, script: &str) -> Result<(), BuildError> {
        tracing::debug!(spec = %self.spec.short_form(), "running step script");
        self.run("/bin/sh", ["-e", "-c", script]).await
    }
}
