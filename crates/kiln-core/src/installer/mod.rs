//! Dependency-ordered installation.
//!
//! The [`Installer`] plans every unique node reachable from the requested
//! roots, then runs up to `jobs` nodes at a time, starting a node only once
//! all of its dependencies are installed. Each node goes through
//!
//! ```text
//! absent -> staged -> built -> installed
//!    \________\________\______> failed
//! ```
//!
//! A failure removes the node's prefix, leaves its record `failed`, and
//! marks every dependent failed without building it.

pub mod build_env;
pub mod db;
pub mod layout;

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use kiln_schema::{AbstractSpec, CompilerConstraint, ConcreteSpec, DagHash, DepTypes, Order, VersionList};
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::compiler::{CompilerDescriptor, CompilerError, CompilerRegistry};
use crate::config::InstallSettings;
use crate::fetch::{FetchContext, FetchError, Stage};
use crate::microarch::TargetTable;
use crate::paths::{KilnPaths, is_populated_dir};
use crate::process::RunLimits;
use crate::repo::{RepoError, Registry};
use crate::reporter::Reporter;

pub use build_env::{BuildContext, BuildError};
pub use db::{Database, DbError, FileLock, InstallRecord, InstallState, Removal};
pub use layout::Layout;

/// Errors from installing or removing nodes.
#[derive(Debug, Error)]
pub enum InstallError {
    /// The last phase finished but the prefix does not exist.
    #[error("{spec}: prefix {} does not exist after the last phase", prefix.display())]
    InstallVerificationFailed {
        /// Node being installed.
        spec: String,
        /// Expected prefix.
        prefix: PathBuf,
    },
    /// Installed nodes still depend on the one being removed.
    #[error("cannot uninstall {spec}: required by {}", names.join(", "))]
    DependentsExist {
        /// Node being removed.
        spec: String,
        /// Installed dependents.
        names: Vec<String>,
    },
    /// A database or prefix lock stayed held past the configured wait.
    #[error("timed out after {}s waiting for lock {}", waited.as_secs(), path.display())]
    LockTimeout {
        /// Lock file.
        path: PathBuf,
        /// Time spent waiting.
        waited: Duration,
    },
    /// A node failed and was rolled back.
    #[error("failed to install {spec}")]
    InstallFailed {
        /// Node that failed.
        spec: String,
        /// What went wrong.
        #[source]
        cause: Box<InstallError>,
    },
    /// A node was not built because a dependency failed.
    #[error("{spec} not built: dependency {dependency} failed")]
    DependencyFailed {
        /// Skipped node.
        spec: String,
        /// Failed dependency.
        dependency: String,
    },
    /// Uninstall target has no record.
    #[error("{0} is not installed")]
    NotInstalled(String),
    /// The recipe does not declare the concrete version.
    #[error("{name} declares no version {version}")]
    UnknownVersion {
        /// Package.
        name: String,
        /// Missing version.
        version: String,
    },
    /// A phase step failed.
    #[error("phase '{phase}' failed")]
    Phase {
        /// Phase name.
        phase: String,
        /// Step failure.
        #[source]
        source: BuildError,
    },
    /// Fetching, verifying or expanding the source failed.
    #[error(transparent)]
    Fetch(#[from] FetchError),
    /// Recipe lookup or construction failed.
    #[error(transparent)]
    Repo(#[from] RepoError),
    /// No usable compiler.
    #[error(transparent)]
    Compiler(#[from] CompilerError),
    /// Install database failure.
    #[error(transparent)]
    Database(DbError),
    /// Filesystem failure in a stage or prefix.
    #[error("cannot access {}", path.display())]
    Io {
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// Cancellation was requested before the node finished.
    #[error("installation cancelled")]
    Cancelled,
    /// A worker task panicked.
    #[error("worker for {0} panicked")]
    Panicked(String),
}

impl From<DbError> for InstallError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::LockTimeout { path, waited } => Self::LockTimeout { path, waited },
            DbError::Io { path, source } => Self::Io { path, source },
            other => Self::Database(other),
        }
    }
}

impl InstallError {
    /// Taxonomy name.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InstallVerificationFailed { .. } => "InstallVerificationFailed",
            Self::DependentsExist { .. } => "DependentsExist",
            Self::LockTimeout { .. } => "LockTimeout",
            Self::InstallFailed { .. } => "InstallFailed",
            Self::DependencyFailed { .. } => "DependencyFailed",
            Self::NotInstalled(_) => "NotInstalled",
            Self::UnknownVersion { .. } => "UnknownVersion",
            Self::Phase { source, .. } => source.kind(),
            Self::Fetch(e) => e.kind(),
            Self::Repo(e) => e.kind(),
            Self::Compiler(e) => e.kind(),
            Self::Database(_) => "Database",
            Self::Io { .. } => "Io",
            Self::Cancelled => "Cancelled",
            Self::Panicked(_) => "Internal",
        }
    }

    /// The error a rolled-back node failed with.
    pub fn root_cause(&self) -> &InstallError {
        match self {
            Self::InstallFailed { cause, .. } => cause.root_cause(),
            other => other,
        }
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> InstallError + '_ {
    move |source| InstallError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// What a batch does with each node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Mode {
    /// Full install.
    #[default]
    Install,
    /// Fetch, verify and expand only.
    Fetch {
        /// Also fetch every dependency.
        dependencies: bool,
    },
}

/// Per-batch options.
#[derive(Debug, Clone, Default)]
pub struct InstallOptions {
    /// Cancel running and pending nodes after the first failure.
    pub fail_fast: bool,
    /// Install or fetch only.
    pub mode: Mode,
}

/// Result for one node.
#[derive(Debug)]
pub enum Outcome {
    /// Built and installed now.
    Installed(PathBuf),
    /// Was already installed.
    AlreadyInstalled(PathBuf),
    /// Source fetched and expanded.
    Fetched,
    /// Failed, skipped because of a dependency, or cancelled.
    Failed(InstallError),
}

impl Outcome {
    /// Whether the node ended without error.
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Failed(_))
    }
}

/// Outcomes of a batch, in install order.
#[derive(Debug)]
pub struct BatchReport {
    /// Every planned node with its outcome.
    pub nodes: Vec<(Arc<ConcreteSpec>, Outcome)>,
    /// Wall-clock time of the batch.
    pub elapsed: Duration,
}

impl BatchReport {
    /// Outcome for the node with `hash`.
    pub fn outcome(&self, hash: &DagHash) -> Option<&Outcome> {
        self.nodes.iter().find(|(s, _)| s.hash() == hash).map(|(_, o)| o)
    }

    /// Remove and return the outcome for `hash`.
    pub fn take(&mut self, hash: &DagHash) -> Option<Outcome> {
        let pos = self.nodes.iter().position(|(s, _)| s.hash() == hash)?;
        Some(self.nodes.remove(pos).1)
    }

    /// Whether every node succeeded.
    pub fn is_success(&self) -> bool {
        self.nodes.iter().all(|(_, o)| o.is_success())
    }

    /// Failed nodes with their errors.
    pub fn failures(&self) -> impl Iterator<Item = (&Arc<ConcreteSpec>, &InstallError)> {
        self.nodes.iter().filter_map(|(s, o)| match o {
            Outcome::Failed(e) => Some((s, e)),
            _ => None,
        })
    }

    /// Nodes built in this batch.
    pub fn built(&self) -> usize {
        self.nodes
            .iter()
            .filter(|(_, o)| matches!(o, Outcome::Installed(_)))
            .count()
    }
}

struct Plan {
    nodes: Vec<Arc<ConcreteSpec>>,
    deps: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
}

impl Plan {
    /// Unique nodes in post-order; edges only when `ordered`.
    fn new(roots: &[Arc<ConcreteSpec>], with_dependencies: bool, ordered: bool) -> Self {
        let mut index: HashMap<DagHash, usize> = HashMap::new();
        let mut nodes = Vec::new();
        for root in roots {
            let reach: Vec<Arc<ConcreteSpec>> = if with_dependencies {
                root.traverse(Order::Post, DepTypes::ALL).collect()
            } else {
                vec![Arc::clone(root)]
            };
            for node in reach {
                if !index.contains_key(node.hash()) {
                    index.insert(node.hash().clone(), nodes.len());
                    nodes.push(node);
                }
            }
        }

        let mut deps = vec![Vec::new(); nodes.len()];
        let mut dependents = vec![Vec::new(); nodes.len()];
        if ordered {
            for (i, node) in nodes.iter().enumerate() {
                for edge in node.dependencies() {
                    if let Some(&j) = index.get(edge.spec.hash()) {
                        if !deps[i].contains(&j) {
                            deps[i].push(j);
                            dependents[j].push(i);
                        }
                    }
                }
            }
        }
        Self {
            nodes,
            deps,
            dependents,
        }
    }
}

/// Installs and removes concrete specs.
#[derive(Clone)]
pub struct Installer {
    registry: Arc<Registry>,
    compilers: Arc<CompilerRegistry>,
    layout: Layout,
    db: Database,
    stage_root: PathBuf,
    settings: InstallSettings,
    fetch: FetchContext,
    reporter: Arc<dyn Reporter>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Installer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Installer")
            .field("layout", &self.layout)
            .field("db", &self.db)
            .field("stage_root", &self.stage_root)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Installer {
    /// Installer over the locations in `paths`.
    pub fn new(
        paths: &KilnPaths,
        registry: Arc<Registry>,
        compilers: Arc<CompilerRegistry>,
        settings: InstallSettings,
        reporter: Arc<dyn Reporter>,
    ) -> Self {
        let fetch = FetchContext {
            client: reqwest::Client::new(),
            limits: RunLimits::default(),
            retries: settings.fetch_retries,
            reporter: Arc::clone(&reporter),
        };
        Self {
            registry,
            compilers,
            layout: Layout::new(&paths.install_root),
            db: Database::new(paths.db_path(), paths.lock_dir(), settings.lock_timeout),
            stage_root: paths.stage_root.clone(),
            settings,
            fetch,
            reporter,
            cancel: CancellationToken::new(),
        }
    }

    /// Use `token` to cancel every running subprocess.
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Prefix layout.
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Install database.
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Stage directory for `spec`.
    pub fn stage_for(&self, spec: &ConcreteSpec) -> Stage {
        Stage::new(self.stage_root.join(format!(
            "{}-{}-{}",
            spec.name(),
            spec.version(),
            spec.hash().prefix_component()
        )))
    }

    async fn db_call<T, F>(&self, f: F) -> Result<T, InstallError>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<T, DbError> + Send + 'static,
    {
        let db = self.db.clone();
        match tokio::task::spawn_blocking(move || f(&db)).await {
            Ok(result) => Ok(result?),
            Err(e) => Err(InstallError::Panicked(format!("database task: {e}"))),
        }
    }

    async fn record(&self, spec: &Arc<ConcreteSpec>, prefix: &Path, state: InstallState) -> Result<(), InstallError> {
        let (spec, prefix) = (Arc::clone(spec), prefix.to_path_buf());
        self.db_call(move |db| db.set_state(&spec, &prefix, state)).await
    }

    async fn lock(&self, spec: &ConcreteSpec) -> Result<FileLock, InstallError> {
        let hash = spec.hash().clone();
        self.db_call(move |db| db.lock_prefix(&hash)).await
    }

    /// Installed records satisfying `constraint`; `None` lists all records.
    ///
    /// # Errors
    ///
    /// Database failures.
    pub async fn records(&self, constraint: Option<&AbstractSpec>) -> Result<Vec<InstallRecord>, InstallError> {
        let constraint = constraint.cloned();
        self.db_call(move |db| db.query(constraint.as_ref())).await
    }

    /// Install `spec` and its dependencies; returns the prefix.
    ///
    /// # Errors
    ///
    /// The root's failure, or [`InstallError::DependencyFailed`] when a
    /// dependency failed first.
    pub async fn install(&self, spec: &Arc<ConcreteSpec>) -> Result<PathBuf, InstallError> {
        let mut report = self
            .install_all(std::slice::from_ref(spec), &InstallOptions::default())
            .await;
        match report.take(spec.hash()) {
            Some(Outcome::Installed(p) | Outcome::AlreadyInstalled(p)) => Ok(p),
            Some(Outcome::Failed(e)) => Err(e),
            Some(Outcome::Fetched) | None => Err(InstallError::NotInstalled(spec.short_form())),
        }
    }

    /// Run a batch over `roots`. Each unique node is handled at most once.
    pub async fn install_all(&self, roots: &[Arc<ConcreteSpec>], options: &InstallOptions) -> BatchReport {
        let started = Instant::now();
        let (with_deps, fetch_only) = match options.mode {
            Mode::Install => (true, false),
            Mode::Fetch { dependencies } => (dependencies, true),
        };
        let plan = Plan::new(roots, with_deps, !fetch_only);
        let n = plan.nodes.len();
        let token = self.cancel.child_token();
        let jobs = self.settings.jobs.max(1);
        tracing::info!(nodes = n, jobs, fetch_only, "starting batch");

        let mut waiting: Vec<usize> = plan.deps.iter().map(Vec::len).collect();
        let mut outcomes: Vec<Option<Outcome>> = (0..n).map(|_| None).collect();
        let mut ready: VecDeque<usize> = (0..n).filter(|&i| waiting[i] == 0).collect();
        let mut set: JoinSet<(usize, Result<Outcome, InstallError>)> = JoinSet::new();
        let mut stopped = false;

        loop {
            while !stopped && set.len() < jobs {
                let Some(i) = ready.pop_front() else { break };
                let this = self.clone();
                let spec = Arc::clone(&plan.nodes[i]);
                let token = token.clone();
                set.spawn(async move {
                    let label = spec.short_form();
                    let work = async { this.install_node(&spec, fetch_only, &token).await };
                    let result = AssertUnwindSafe(work)
                        .catch_unwind()
                        .await
                        .unwrap_or(Err(InstallError::Panicked(label)));
                    (i, result)
                });
            }

            let Some(joined) = set.join_next().await else { break };
            let (i, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    tracing::error!(error = %e, "install worker aborted");
                    continue;
                }
            };

            match result {
                Ok(outcome) => {
                    outcomes[i] = Some(outcome);
                    for &d in &plan.dependents[i] {
                        waiting[d] -= 1;
                        if waiting[d] == 0 && outcomes[d].is_none() {
                            ready.push_back(d);
                        }
                    }
                }
                Err(err) => {
                    let failed = plan.nodes[i].short_form();
                    outcomes[i] = Some(Outcome::Failed(err));
                    let mut pending = plan.dependents[i].clone();
                    while let Some(d) = pending.pop() {
                        if outcomes[d].is_some() {
                            continue;
                        }
                        let spec = plan.nodes[d].short_form();
                        self.reporter.failed(&plan.nodes[d], &format!("dependency {failed} failed"));
                        outcomes[d] = Some(Outcome::Failed(InstallError::DependencyFailed {
                            spec,
                            dependency: failed.clone(),
                        }));
                        pending.extend(plan.dependents[d].iter().copied());
                    }
                    if options.fail_fast && !stopped {
                        tracing::warn!(spec = %failed, "stopping batch after failure");
                        stopped = true;
                        token.cancel();
                    }
                }
            }
        }

        let nodes: Vec<(Arc<ConcreteSpec>, Outcome)> = plan
            .nodes
            .into_iter()
            .zip(outcomes)
            .map(|(spec, o)| (spec, o.unwrap_or(Outcome::Failed(InstallError::Cancelled))))
            .collect();
        let report = BatchReport {
            nodes,
            elapsed: started.elapsed(),
        };
        let (count, action) = if fetch_only {
            (report.nodes.iter().filter(|(_, o)| matches!(o, Outcome::Fetched)).count(), "fetched")
        } else {
            (report.built(), "installed")
        };
        self.reporter.summary(count, action, report.elapsed.as_secs_f64());
        report
    }

    async fn install_node(
        &self,
        spec: &Arc<ConcreteSpec>,
        fetch_only: bool,
        token: &CancellationToken,
    ) -> Result<Outcome, InstallError> {
        if token.is_cancelled() {
            return Err(InstallError::Cancelled);
        }
        let prefix = self.layout.prefix(spec);
        let _lock = self.lock(spec).await?;

        if !fetch_only {
            let hash = spec.hash().clone();
            let existing = self.db_call(move |db| db.get(&hash)).await?;
            if existing.is_some_and(|r| r.is_live()) {
                tracing::debug!(spec = %spec.short_form(), "already installed");
                self.reporter.already_installed(spec, &prefix);
                return Ok(Outcome::AlreadyInstalled(prefix));
            }
        }

        let built = AssertUnwindSafe(self.build_node(spec, &prefix, fetch_only, token))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| {
                tracing::error!(spec = %spec.short_form(), panic = panic_message(payload.as_ref()), "build panicked");
                Err(InstallError::Panicked(spec.short_form()))
            });
        match built {
            Ok(outcome) => Ok(outcome),
            Err(cause) => {
                if !fetch_only {
                    self.rollback(spec, &prefix).await;
                }
                self.reporter.failed(spec, &cause.to_string());
                Err(InstallError::InstallFailed {
                    spec: spec.short_form(),
                    cause: Box::new(cause),
                })
            }
        }
    }

    async fn build_node(
        &self,
        spec: &Arc<ConcreteSpec>,
        prefix: &Path,
        fetch_only: bool,
        token: &CancellationToken,
    ) -> Result<Outcome, InstallError> {
        let instance = self.registry.load(spec, false)?;
        let decl = instance.recipe.decl();
        let version = decl.version(spec.version()).ok_or_else(|| InstallError::UnknownVersion {
            name: spec.name().to_string(),
            version: spec.version().to_string(),
        })?;

        if !fetch_only {
            self.record(spec, prefix, InstallState::Staged).await?;
        }
        let stage = self.stage_for(spec);
        stage.create().map_err(io_err(stage.path()))?;

        let fetcher = version.fetch.strategy();
        let fetch_ctx = FetchContext {
            limits: RunLimits {
                timeout: Some(self.settings.fetch_timeout),
                cancel: token.clone(),
            },
            ..self.fetch.clone()
        };
        self.reporter.fetching(spec, fetcher.source());
        fetcher.fetch(&stage, &fetch_ctx).await?;
        fetcher.verify(&stage).await?;
        if is_populated_dir(&stage.source_path()) {
            fetcher.reset(&stage, &fetch_ctx).await?;
        } else {
            fetcher.expand(&stage).await?;
        }
        if fetch_only {
            return Ok(Outcome::Fetched);
        }

        if prefix.exists() {
            tracing::warn!(prefix = %prefix.display(), "removing stale prefix");
            self.layout.remove_prefix(prefix).map_err(io_err(prefix))?;
        }

        let ctx = self.build_context(spec, prefix, stage.clone(), token)?;
        for phase in &decl.phases {
            if token.is_cancelled() {
                return Err(InstallError::Cancelled);
            }
            tracing::info!(spec = %spec.short_form(), phase = %phase, "running phase");
            self.reporter.phase(spec, phase);
            instance
                .recipe
                .run_phase(phase, &ctx)
                .await
                .map_err(|source| InstallError::Phase {
                    phase: phase.clone(),
                    source,
                })?;
        }
        self.record(spec, prefix, InstallState::Built).await?;

        if !prefix.is_dir() {
            return Err(InstallError::InstallVerificationFailed {
                spec: spec.short_form(),
                prefix: prefix.to_path_buf(),
            });
        }
        self.layout.write_metadata(spec, prefix).map_err(io_err(prefix))?;
        self.record(spec, prefix, InstallState::Installed).await?;
        self.reporter.installed(spec, prefix);

        if !self.settings.keep_stage {
            if let Err(e) = stage.destroy() {
                tracing::warn!(stage = %stage.path().display(), error = %e, "failed to remove stage");
            }
        }
        Ok(Outcome::Installed(prefix.to_path_buf()))
    }

    fn compiler_for(&self, spec: &ConcreteSpec) -> Result<CompilerDescriptor, CompilerError> {
        let constraint = CompilerConstraint {
            name: spec.compiler().name.clone(),
            versions: VersionList::exact(spec.compiler().version.clone()),
        };
        let os = &spec.arch().os;
        self.compilers
            .find(&constraint, None)?
            .into_iter()
            .find(|d| &d.operating_system == os)
            .ok_or_else(|| CompilerError::NoCompilerForConstraint {
                constraint,
                os: os.clone(),
            })
    }

    fn build_context(
        &self,
        spec: &Arc<ConcreteSpec>,
        prefix: &Path,
        stage: Stage,
        token: &CancellationToken,
    ) -> Result<BuildContext, InstallError> {
        let compiler = self.compiler_for(spec)?;
        let target_flags = TargetTable::builtin()
            .get(&spec.arch().target)
            .and_then(|t| t.optimization_flags(&compiler.name, &compiler.version))
            .unwrap_or_else(|e| {
                tracing::debug!(error = %e, "no optimization flags for target");
                String::new()
            });

        let mut ctx = BuildContext::new(Arc::clone(spec), prefix.to_path_buf(), stage)
            .with_jobs(self.settings.build_jobs)
            .with_limits(RunLimits {
                timeout: self.settings.phase_timeout,
                cancel: token.clone(),
            })
            .with_target_flags(target_flags)
            .with_compiler(compiler);
        for edge in spec.dependencies() {
            ctx = ctx.with_dependency(edge.spec.name(), self.layout.prefix(&edge.spec));
        }
        Ok(ctx)
    }

    async fn rollback(&self, spec: &Arc<ConcreteSpec>, prefix: &Path) {
        tracing::info!(spec = %spec.short_form(), "rolling back");
        if let Err(e) = self.layout.remove_prefix(prefix) {
            tracing::warn!(prefix = %prefix.display(), error = %e, "failed to remove prefix");
        }
        if let Err(e) = self.record(spec, prefix, InstallState::Failed).await {
            tracing::warn!(spec = %spec.short_form(), error = %e, "failed to record failure");
        }
    }

    /// Remove an installed node; returns its former prefix.
    ///
    /// # Errors
    ///
    /// [`InstallError::NotInstalled`] without a record,
    /// [`InstallError::DependentsExist`] while installed dependents remain
    /// and `force` is false.
    pub async fn uninstall(&self, spec: &Arc<ConcreteSpec>, force: bool) -> Result<PathBuf, InstallError> {
        let _lock = self.lock(spec).await?;
        let hash = spec.hash().clone();
        let layout = self.layout.clone();
        let removal = self
            .db_call(move |db| db.remove_checked(&hash, force, |prefix| layout.remove_prefix(prefix)))
            .await?;
        match removal {
            Removal::Removed(record) => {
                self.reporter.removing(spec);
                tracing::info!(spec = %spec.short_form(), "uninstalled");
                Ok(record.prefix)
            }
            Removal::Missing => Err(InstallError::NotInstalled(spec.short_form())),
            Removal::Blocked(dependents) => Err(InstallError::DependentsExist {
                spec: spec.short_form(),
                names: dependents.iter().map(|r| r.spec.short_form()).collect(),
            }),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string payload")
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::installer::build_env::tests::node;
    use kiln_schema::DependencyEdge;

    fn chain() -> (Arc<ConcreteSpec>, Arc<ConcreteSpec>, Arc<ConcreteSpec>) {
        let zlib = ConcreteSpec::new(node("zlib", "1.3.1"), Vec::new()).unwrap();
        let edge = |s: &Arc<ConcreteSpec>| DependencyEdge {
            spec: Arc::clone(s),
            types: DepTypes::default(),
        };
        let libpng = ConcreteSpec::new(node("libpng", "1.6.43"), vec![edge(&zlib)]).unwrap();
        let freetype = ConcreteSpec::new(node("freetype", "2.13.2"), vec![edge(&zlib), edge(&libpng)]).unwrap();
        (zlib, libpng, freetype)
    }

    #[test]
    fn plan_dedups_and_orders() {
        let (_, libpng, freetype) = chain();
        let plan = Plan::new(&[Arc::clone(&libpng), Arc::clone(&freetype)], true, true);
        let names: Vec<&str> = plan.nodes.iter().map(|n| n.name()).collect();
        assert_eq!(names, ["zlib", "libpng", "freetype"]);
        assert_eq!(plan.deps[2].len(), 2);
        assert_eq!(plan.dependents[0], [1, 2]);

        let fetch = Plan::new(&[Arc::clone(&freetype)], false, false);
        assert_eq!(fetch.nodes.len(), 1);
        assert!(fetch.deps[0].is_empty());
    }

    #[test]
    fn root_cause_unwraps_failures() {
        let err = InstallError::InstallFailed {
            spec: "zlib".into(),
            cause: Box::new(InstallError::InstallVerificationFailed {
                spec: "zlib".into(),
                prefix: PathBuf::from("/nowhere"),
            }),
        };
        assert_eq!(err.kind(), "InstallFailed");
        assert_eq!(err.root_cause().kind(), "InstallVerificationFailed");

        let lock: InstallError = DbError::LockTimeout {
            path: PathBuf::from("/l"),
            waited: Duration::from_secs(1),
        }
        .into();
        assert_eq!(lock.kind(), "LockTimeout");
    }
}
