//! Shared command context.
//!
//! Groups the resolved paths, repositories, compilers and settings every
//! command needs, so commands don't rebuild them piecemeal.

use std::fmt;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use kiln_core::compiler::CompilerRegistry;
use kiln_core::concretize::{Concretizer, HostArch};
use kiln_core::config::InstallSettings;
use kiln_core::installer::Installer;
use kiln_core::repo::{Registry, Repository};
use kiln_core::{KilnPaths, Reporter};
use kiln_schema::{AbstractSpec, ConcreteSpec};
use tokio_util::sync::CancellationToken;

/// Namespace of the repository created under a fresh `KILN_HOME`.
const DEFAULT_NAMESPACE: &str = "builtin";

/// State shared by one command invocation.
pub struct Context {
    pub paths: KilnPaths,
    pub registry: Arc<Registry>,
    pub compilers: Arc<CompilerRegistry>,
    pub settings: InstallSettings,
    pub host: HostArch,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("paths", &self.paths)
            .field("host", &self.host)
            .finish_non_exhaustive()
    }
}

impl Context {
    /// Resolve everything from the environment.
    pub fn load() -> Result<Self> {
        let paths = KilnPaths::from_env()?;
        Self::with_paths(paths)
    }

    pub fn with_paths(paths: KilnPaths) -> Result<Self> {
        ensure_default_repo(&paths)?;
        let registry = Registry::new(&paths.repo_roots).context("Failed to open recipe repositories")?;
        let settings = InstallSettings::load(&paths.scopes).context("Failed to read configuration")?;
        let compilers = CompilerRegistry::new(paths.scopes.clone());
        Ok(Self {
            registry: Arc::new(registry),
            compilers: Arc::new(compilers),
            settings,
            host: HostArch::detect(),
            paths,
        })
    }

    /// Concretize each request; the first failure aborts.
    pub fn concretize(&self, requests: &[String]) -> Result<Vec<Arc<ConcreteSpec>>> {
        let specs = parse_specs(requests)?;
        let compilers = self.compilers.all(None).context("Failed to load compilers")?;
        let concretizer = Concretizer::new(&self.registry, compilers, self.host.clone());
        specs
            .iter()
            .map(|spec| {
                concretizer
                    .concretize(spec)
                    .with_context(|| format!("Failed to concretize '{spec}'"))
            })
            .collect()
    }

    /// Installer that cancels its subprocesses on Ctrl-C.
    pub fn installer(&self, reporter: Arc<dyn Reporter>) -> Installer {
        let token = CancellationToken::new();
        let on_signal = token.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, cancelling");
                on_signal.cancel();
            }
        });
        Installer::new(
            &self.paths,
            Arc::clone(&self.registry),
            Arc::clone(&self.compilers),
            self.settings.clone(),
            reporter,
        )
        .with_cancel(token)
    }
}

/// Parse spec strings, naming the offending one on error.
pub fn parse_specs(requests: &[String]) -> Result<Vec<AbstractSpec>> {
    requests
        .iter()
        .map(|text| AbstractSpec::parse(text).with_context(|| format!("Invalid spec '{text}'")))
        .collect()
}

/// Create `repos/builtin` under the home when the default search path is in
/// use and nothing exists there yet.
fn ensure_default_repo(paths: &KilnPaths) -> Result<()> {
    let default = paths.home.join("repos").join(DEFAULT_NAMESPACE);
    if paths.repo_roots == [default.clone()] && !default.exists() {
        tracing::info!(root = %default.display(), "creating default repository");
        Repository::create(&default, DEFAULT_NAMESPACE)?;
    }
    Ok(())
}
