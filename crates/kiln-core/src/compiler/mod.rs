//! Compiler discovery, persistence and constraint matching.
//!
//! Every configuration scope may hold a `compilers.toml`:
//!
//! ```toml
//! [compilers."gcc@11.4.0"]
//! spec = "gcc@11.4.0"
//! operating_system = "ubuntu22.04"
//! modules = []
//! paths = { cc = "/usr/bin/gcc", cxx = "/usr/bin/g++", fc = "/usr/bin/gfortran" }
//! flags = { cflags = "-O2" }
//! ```
//!
//! The merged view lists the highest-precedence scope first, and an alias in
//! a higher scope shadows the same alias below it.

pub mod detect;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use kiln_schema::{CompilerConstraint, Version};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{self, ConfigError, ConfigScope};

/// Name of the compiler file inside a scope.
pub const COMPILERS_FILE: &str = "compilers.toml";

/// Executable paths per language.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompilerPaths {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cc: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cxx: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub f77: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fc: Option<PathBuf>,
}

/// Per-language flag overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompilerFlags {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cflags: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cxxflags: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fflags: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cppflags: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ldflags: Option<String>,
}

impl CompilerFlags {
    fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// `(VARIABLE, value)` pairs for the flags that are set.
    pub fn env_pairs(&self) -> Vec<(&'static str, &str)> {
        [
            ("CFLAGS", &self.cflags),
            ("CXXFLAGS", &self.cxxflags),
            ("FFLAGS", &self.fflags),
            ("CPPFLAGS", &self.cppflags),
            ("LDFLAGS", &self.ldflags),
        ]
        .into_iter()
        .filter_map(|(k, v)| v.as_deref().map(|v| (k, v)))
        .collect()
    }
}

/// One configured toolchain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilerDescriptor {
    /// Table key in `compilers.toml`.
    pub alias: String,
    /// Toolchain family (`gcc`, `clang`, `apple-clang`, `oneapi`).
    pub name: String,
    /// Toolchain version.
    pub version: Version,
    /// Operating system the binaries run on.
    pub operating_system: String,
    /// Executables.
    pub paths: CompilerPaths,
    /// Environment modules to load before use.
    pub modules: Vec<String>,
    /// Flag overrides.
    pub flags: CompilerFlags,
}

impl CompilerDescriptor {
    /// Whether this toolchain matches `constraint` by name and version.
    pub fn satisfies(&self, constraint: &CompilerConstraint) -> bool {
        self.name == constraint.name && constraint.versions.contains(&self.version)
    }

    /// Default alias: `name@version`.
    pub fn default_alias(name: &str, version: &Version) -> String {
        format!("{name}@{version}")
    }
}

impl fmt::Display for CompilerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{} ({})", self.name, self.version, self.operating_system)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CompilersFile {
    #[serde(default)]
    compilers: BTreeMap<String, CompilerEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct CompilerEntry {
    spec: String,
    operating_system: String,
    #[serde(default)]
    modules: Vec<String>,
    #[serde(default)]
    paths: CompilerPaths,
    #[serde(default, skip_serializing_if = "CompilerFlags::is_empty")]
    flags: CompilerFlags,
}

impl CompilerEntry {
    fn from_descriptor(d: &CompilerDescriptor) -> Self {
        Self {
            spec: format!("{}@{}", d.name, d.version),
            operating_system: d.operating_system.clone(),
            modules: d.modules.clone(),
            paths: d.paths.clone(),
            flags: d.flags.clone(),
        }
    }

    fn into_descriptor(self, alias: String, scope: &ConfigScope) -> Result<CompilerDescriptor, CompilerError> {
        let invalid = |reason: String| CompilerError::InvalidEntry {
            alias: alias.clone(),
            path: scope.file(COMPILERS_FILE),
            reason,
        };
        let (name, version) = self
            .spec
            .split_once('@')
            .ok_or_else(|| invalid(format!("spec '{}' has no version", self.spec)))?;
        let version = Version::parse(version).map_err(|e| invalid(e.to_string()))?;
        Ok(CompilerDescriptor {
            name: name.to_string(),
            version,
            operating_system: self.operating_system,
            paths: self.paths,
            modules: self.modules,
            flags: self.flags,
            alias,
        })
    }
}

/// Errors from the compiler registry.
#[derive(Debug, Error)]
pub enum CompilerError {
    /// Nothing configured matches.
    #[error("no compiler matches %{constraint} on {os}")]
    NoCompilerForConstraint {
        /// Requested compiler.
        constraint: CompilerConstraint,
        /// Operating system searched.
        os: String,
    },
    /// More than one configured compiler matches.
    #[error("%{constraint} is ambiguous: {}", candidates.join(", "))]
    AmbiguousCompiler {
        /// Requested compiler.
        constraint: CompilerConstraint,
        /// Aliases of every match.
        candidates: Vec<String>,
    },
    /// A `compilers.toml` entry is malformed.
    #[error("invalid compiler '{alias}' in {}: {reason}", path.display())]
    InvalidEntry {
        /// Table key.
        alias: String,
        /// File path.
        path: PathBuf,
        /// What is wrong.
        reason: String,
    },
    /// Reading or writing a scope failed.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl CompilerError {
    /// Taxonomy name.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NoCompilerForConstraint { .. } => "NoCompilerForConstraint",
            Self::AmbiguousCompiler { .. } => "AmbiguousCompiler",
            Self::InvalidEntry { .. } | Self::Config(_) => "Config",
        }
    }
}

/// Process-wide merged view of every scope.
///
/// Rebuilt lazily after [`CompilerCache::invalidate`]; never patched in place.
#[derive(Debug, Default)]
pub struct CompilerCache {
    merged: Mutex<Option<Arc<Vec<CompilerDescriptor>>>>,
}

impl CompilerCache {
    fn slot(&self) -> MutexGuard<'_, Option<Arc<Vec<CompilerDescriptor>>>> {
        self.merged.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cached view, computing it with `load` on a miss.
    ///
    /// # Errors
    ///
    /// Propagates `load` failures; nothing is cached then.
    pub fn get<E>(
        &self,
        load: impl FnOnce() -> Result<Vec<CompilerDescriptor>, E>,
    ) -> Result<Arc<Vec<CompilerDescriptor>>, E> {
        let mut slot = self.slot();
        if let Some(view) = slot.as_ref() {
            return Ok(Arc::clone(view));
        }
        let view = Arc::new(load()?);
        *slot = Some(Arc::clone(&view));
        Ok(view)
    }

    /// Drop the cached view.
    pub fn invalidate(&self) {
        *self.slot() = None;
    }

    /// Whether a view is cached.
    pub fn is_warm(&self) -> bool {
        self.slot().is_some()
    }
}

type Detector = Arc<dyn Fn() -> Vec<CompilerDescriptor> + Send + Sync>;

/// Compilers configured across scopes.
pub struct CompilerRegistry {
    scopes: Vec<ConfigScope>,
    cache: CompilerCache,
    detector: Detector,
    /// Set once implicit detection has run in this process.
    detected: AtomicBool,
}

impl fmt::Debug for CompilerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompilerRegistry")
            .field("scopes", &self.scopes)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl CompilerRegistry {
    /// Registry over `scopes` (lowest precedence first) using host detection.
    pub fn new(scopes: Vec<ConfigScope>) -> Self {
        Self::with_detector(scopes, || detect::detect(&detect::search_path()))
    }

    /// Registry with a custom detection function.
    pub fn with_detector(
        scopes: Vec<ConfigScope>,
        detector: impl Fn() -> Vec<CompilerDescriptor> + Send + Sync + 'static,
    ) -> Self {
        Self {
            scopes,
            cache: CompilerCache::default(),
            detector: Arc::new(detector),
            detected: AtomicBool::new(false),
        }
    }

    /// The merged-view cache.
    pub fn cache(&self) -> &CompilerCache {
        &self.cache
    }

    fn scope(&self, name: &str) -> Result<&ConfigScope, CompilerError> {
        self.scopes
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| ConfigError::UnknownScope(name.to_string()).into())
    }

    fn highest_scope(&self) -> Result<&ConfigScope, CompilerError> {
        self.scopes
            .last()
            .ok_or_else(|| ConfigError::UnknownScope("<none>".to_string()).into())
    }

    fn read_file(scope: &ConfigScope) -> Result<CompilersFile, CompilerError> {
        Ok(config::read_toml(&scope.file(COMPILERS_FILE))?.unwrap_or_default())
    }

    fn read_scope(scope: &ConfigScope) -> Result<Vec<CompilerDescriptor>, CompilerError> {
        Self::read_file(scope)?
            .compilers
            .into_iter()
            .map(|(alias, entry)| entry.into_descriptor(alias, scope))
            .collect()
    }

    fn load_merged(&self) -> Result<Vec<CompilerDescriptor>, CompilerError> {
        let mut seen = BTreeSet::new();
        let mut merged = Vec::new();
        for scope in self.scopes.iter().rev() {
            for d in Self::read_scope(scope)? {
                if seen.insert(d.alias.clone()) {
                    merged.push(d);
                }
            }
        }
        Ok(merged)
    }

    fn merged(&self) -> Result<Arc<Vec<CompilerDescriptor>>, CompilerError> {
        self.cache.get(|| self.load_merged())
    }

    /// Run detection once per registry and persist its result into `scope`.
    fn initialize(&self, scope: &ConfigScope) -> Result<(), CompilerError> {
        if self.detected.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let found = (self.detector)();
        tracing::info!(scope = %scope.name, count = found.len(), "detected compilers");
        if !found.is_empty() {
            self.write_into(scope, &found)?;
        }
        Ok(())
    }

    /// Configured compilers: the merged view, or one scope's own entries.
    ///
    /// The first query that finds its scope empty while the merged view is
    /// also empty triggers detection and persists the result there.
    ///
    /// # Errors
    ///
    /// Returns [`CompilerError::Config`] or [`CompilerError::InvalidEntry`].
    pub fn all(&self, scope: Option<&str>) -> Result<Vec<CompilerDescriptor>, CompilerError> {
        let merged = self.merged()?;
        match scope {
            None => {
                if merged.is_empty() {
                    self.initialize(self.highest_scope()?)?;
                    return Ok(self.merged()?.to_vec());
                }
                Ok(merged.to_vec())
            }
            Some(name) => {
                let scope = self.scope(name)?;
                let own = Self::read_scope(scope)?;
                if own.is_empty() && merged.is_empty() {
                    self.initialize(scope)?;
                    return Self::read_scope(scope);
                }
                Ok(own)
            }
        }
    }

    /// Compilers matching `constraint` by name and version.
    ///
    /// # Errors
    ///
    /// Same as [`CompilerRegistry::all`].
    pub fn find(
        &self,
        constraint: &CompilerConstraint,
        scope: Option<&str>,
    ) -> Result<Vec<CompilerDescriptor>, CompilerError> {
        Ok(self
            .all(scope)?
            .into_iter()
            .filter(|d| d.satisfies(constraint))
            .collect())
    }

    /// The single compiler matching `constraint` on `os`.
    ///
    /// # Errors
    ///
    /// [`CompilerError::NoCompilerForConstraint`] when nothing matches,
    /// [`CompilerError::AmbiguousCompiler`] when several do.
    pub fn resolve(&self, constraint: &CompilerConstraint, os: &str) -> Result<CompilerDescriptor, CompilerError> {
        let mut matches: Vec<_> = self
            .find(constraint, None)?
            .into_iter()
            .filter(|d| d.operating_system == os)
            .collect();
        match matches.len() {
            0 => Err(CompilerError::NoCompilerForConstraint {
                constraint: constraint.clone(),
                os: os.to_string(),
            }),
            1 => Ok(matches.remove(0)),
            _ => Err(CompilerError::AmbiguousCompiler {
                constraint: constraint.clone(),
                candidates: matches.into_iter().map(|d| d.alias).collect(),
            }),
        }
    }

    fn write_into(&self, scope: &ConfigScope, descriptors: &[CompilerDescriptor]) -> Result<usize, CompilerError> {
        let mut file = Self::read_file(scope)?;
        let mut added = 0;
        for d in descriptors {
            if file
                .compilers
                .insert(d.alias.clone(), CompilerEntry::from_descriptor(d))
                .is_none()
            {
                added += 1;
            }
        }
        let written = config::write_toml(&scope.file(COMPILERS_FILE), &file);
        self.cache.invalidate();
        written?;
        Ok(added)
    }

    /// Add or replace `descriptors` in `scope`. Returns how many aliases were new.
    ///
    /// # Errors
    ///
    /// Returns [`CompilerError::Config`].
    pub fn add(&self, descriptors: &[CompilerDescriptor], scope: &str) -> Result<usize, CompilerError> {
        let scope = self.scope(scope)?;
        self.write_into(scope, descriptors)
    }

    /// Remove compilers matching `constraint` from `scope`, or from every
    /// scope. Returns the removed entries.
    ///
    /// # Errors
    ///
    /// Returns [`CompilerError::Config`] or [`CompilerError::InvalidEntry`].
    pub fn remove(
        &self,
        constraint: &CompilerConstraint,
        scope: Option<&str>,
    ) -> Result<Vec<CompilerDescriptor>, CompilerError> {
        let targets: Vec<&ConfigScope> = match scope {
            Some(name) => vec![self.scope(name)?],
            None => self.scopes.iter().collect(),
        };
        let mut removed = Vec::new();
        for scope in targets {
            let matching: Vec<_> = Self::read_scope(scope)?
                .into_iter()
                .filter(|d| d.satisfies(constraint))
                .collect();
            if matching.is_empty() {
                continue;
            }
            let mut file = Self::read_file(scope)?;
            for d in &matching {
                file.compilers.remove(&d.alias);
            }
            // Invalidate per scope: a later scope may still fail to read.
            let written = config::write_toml(&scope.file(COMPILERS_FILE), &file);
            self.cache.invalidate();
            written?;
            removed.extend(matching);
        }
        Ok(removed)
    }

    /// Detect host compilers and add the ones not yet configured to `scope`.
    ///
    /// # Errors
    ///
    /// Returns [`CompilerError::Config`].
    pub fn find_new(&self, scope: Option<&str>) -> Result<Vec<CompilerDescriptor>, CompilerError> {
        let scope = match scope {
            Some(name) => self.scope(name)?,
            None => self.highest_scope()?,
        };
        let known = self.merged()?;
        let fresh: Vec<_> = (self.detector)()
            .into_iter()
            .filter(|d| {
                !known.iter().any(|k| {
                    k.name == d.name
                        && k.version == d.version
                        && k.operating_system == d.operating_system
                        && k.paths.cc == d.paths.cc
                })
            })
            .collect();
        if !fresh.is_empty() {
            self.write_into(scope, &fresh)?;
        }
        Ok(fresh)
    }
}
