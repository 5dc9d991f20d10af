//! Recipe repositories and the package registry.
//!
//! A repository root holds `repo.toml`:
//!
//! ```toml
//! [repo]
//! namespace = "builtin"
//! ```
//!
//! and one `packages/<name>/package.toml` per recipe. The [`Registry`]
//! searches repositories in order; the first one containing a package wins.

pub mod recipe;
pub mod toml_recipe;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use fuzzy_matcher::FuzzyMatcher;
use fuzzy_matcher::skim::SkimMatcherV2;
use kiln_schema::{ConcreteSpec, DagHash};
use serde::Deserialize;
use thiserror::Error;

pub use recipe::{ConflictDecl, DependencyDecl, Recipe, RecipeDecl, VariantDecl, VersionDecl};
pub use toml_recipe::{RECIPE_FILE, TomlRecipe};

/// Name of the repository description file.
pub const REPO_FILE: &str = "repo.toml";
/// Directory holding one subdirectory per package.
pub const PACKAGES_DIR: &str = "packages";

const MAX_SUGGESTIONS: usize = 3;

/// Error type recipe loaders return.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Builds a recipe for a package.
pub type Loader = Arc<dyn Fn(&RecipeHandle) -> Result<Arc<dyn Recipe>, BoxError> + Send + Sync>;

/// Errors from repositories and the registry.
#[derive(Debug, Error)]
pub enum RepoError {
    /// No repository provides the package.
    #[error("unknown package '{name}'{}", suggestion_suffix(suggestions))]
    UnknownPackage {
        /// Requested name.
        name: String,
        /// Close matches.
        suggestions: Vec<String>,
    },
    /// No repository has the namespace.
    #[error("unknown repository namespace '{0}'")]
    UnknownNamespace(String),
    /// Two roots are the same directory or declare the same namespace.
    #[error("repository {} duplicates {} (namespace '{namespace}')", second.display(), first.display())]
    DuplicateRepository {
        /// Root registered first.
        first: PathBuf,
        /// Conflicting root.
        second: PathBuf,
        /// Namespace involved.
        namespace: String,
    },
    /// The root is missing or its `repo.toml` is invalid.
    #[error("bad repository at {}: {reason}", path.display())]
    BadRepository {
        /// Repository root.
        path: PathBuf,
        /// What is wrong.
        reason: String,
    },
    /// A loader failed to build the recipe.
    #[error("failed to construct recipe '{name}'")]
    RecipeConstructionError {
        /// Package name.
        name: String,
        /// Loader failure.
        #[source]
        cause: BoxError,
    },
}

fn suggestion_suffix(suggestions: &[String]) -> String {
    if suggestions.is_empty() {
        String::new()
    } else {
        format!("; did you mean {}?", suggestions.join(", "))
    }
}

impl RepoError {
    /// Taxonomy name.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnknownPackage { .. } => "UnknownPackage",
            Self::UnknownNamespace(_) => "UnknownNamespace",
            Self::DuplicateRepository { .. } => "DuplicateRepository",
            Self::BadRepository { .. } => "BadRepository",
            Self::RecipeConstructionError { .. } => "RecipeConstructionError",
        }
    }
}

#[derive(Debug, Deserialize)]
struct RepoFile {
    repo: RepoSection,
}

#[derive(Debug, Deserialize)]
struct RepoSection {
    namespace: String,
}

/// One opened repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repository {
    root: PathBuf,
    namespace: String,
}

impl Repository {
    /// Open the repository at `root`.
    ///
    /// # Errors
    ///
    /// Returns [`RepoError::BadRepository`] if the root or its `repo.toml`
    /// is missing or invalid.
    pub fn open(root: &Path) -> Result<Self, RepoError> {
        let bad = |reason: String| RepoError::BadRepository {
            path: root.to_path_buf(),
            reason,
        };
        let root = std::fs::canonicalize(root).map_err(|e| bad(e.to_string()))?;
        let text = std::fs::read_to_string(root.join(REPO_FILE)).map_err(|e| bad(format!("{REPO_FILE}: {e}")))?;
        let file: RepoFile = toml::from_str(&text).map_err(|e| bad(format!("{REPO_FILE}: {e}")))?;
        let namespace = file.repo.namespace;
        let valid = !namespace.is_empty()
            && namespace
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(bad(format!("invalid namespace '{namespace}'")));
        }
        Ok(Self { root, namespace })
    }

    /// Create a repository skeleton at `root` declaring `namespace`.
    ///
    /// # Errors
    ///
    /// Returns [`RepoError::BadRepository`] on filesystem errors.
    pub fn create(root: &Path, namespace: &str) -> Result<Self, RepoError> {
        let bad = |e: std::io::Error| RepoError::BadRepository {
            path: root.to_path_buf(),
            reason: e.to_string(),
        };
        std::fs::create_dir_all(root.join(PACKAGES_DIR)).map_err(bad)?;
        std::fs::write(root.join(REPO_FILE), format!("[repo]\nnamespace = \"{namespace}\"\n")).map_err(bad)?;
        Self::open(root)
    }

    /// Canonical root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Declared namespace.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Where the recipe for `name` lives or would be created.
    pub fn recipe_path(&self, name: &str) -> PathBuf {
        self.root.join(PACKAGES_DIR).join(name).join(RECIPE_FILE)
    }

    /// Package names with a recipe file, sorted.
    pub fn package_names(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(self.root.join(PACKAGES_DIR)) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .filter_map(Result::ok)
            .filter(|e| e.path().join(RECIPE_FILE).is_file())
            .filter_map(|e| e.file_name().into_string().ok())
            .collect();
        names.sort();
        names
    }
}

/// Resolved location of a recipe.
#[derive(Clone)]
pub struct RecipeHandle {
    /// Package name.
    pub name: String,
    /// Namespace providing it.
    pub namespace: String,
    /// Recipe file, for file-backed recipes.
    pub path: Option<PathBuf>,
    loader: Loader,
}

impl fmt::Debug for RecipeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecipeHandle")
            .field("name", &self.name)
            .field("namespace", &self.namespace)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// A recipe bound to one concrete spec.
#[derive(Debug)]
pub struct RecipeInstance {
    /// The spec being built.
    pub spec: Arc<ConcreteSpec>,
    /// The recipe.
    pub recipe: Arc<dyn Recipe>,
}

/// Instances keyed by concrete spec hash.
#[derive(Debug, Default)]
pub struct InstanceCache {
    map: Mutex<HashMap<DagHash, Arc<RecipeInstance>>>,
}

impl InstanceCache {
    fn map(&self) -> MutexGuard<'_, HashMap<DagHash, Arc<RecipeInstance>>> {
        self.map.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cached instance for `hash`.
    pub fn get(&self, hash: &DagHash) -> Option<Arc<RecipeInstance>> {
        self.map().get(hash).cloned()
    }

    /// Store `instance` under its spec hash.
    pub fn insert(&self, instance: Arc<RecipeInstance>) {
        self.map().insert(instance.spec.hash().clone(), instance);
    }

    /// Drop the instance for `hash`.
    pub fn evict(&self, hash: &DagHash) -> Option<Arc<RecipeInstance>> {
        self.map().remove(hash)
    }

    /// Number of cached instances.
    pub fn len(&self) -> usize {
        self.map().len()
    }

    /// Whether nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct Registered {
    namespace: String,
    name: String,
    loader: Loader,
}

/// Repositories plus programmatically registered loaders.
pub struct Registry {
    repos: Vec<Repository>,
    registered: Vec<Registered>,
    loaders: OnceLock<BTreeMap<String, Vec<RecipeHandle>>>,
    recipes: Mutex<HashMap<(String, String), Arc<dyn Recipe>>>,
    instances: InstanceCache,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("repos", &self.repos)
            .field("instances", &self.instances)
            .finish_non_exhaustive()
    }
}

fn toml_loader() -> Loader {
    Arc::new(|handle: &RecipeHandle| {
        let path = handle
            .path
            .as_deref()
            .ok_or_else(|| format!("'{}' has no recipe file", handle.name))?;
        let recipe: Arc<dyn Recipe> = Arc::new(TomlRecipe::load(&handle.name, path)?);
        Ok(recipe)
    })
}

impl Registry {
    /// Open every root, in search order.
    ///
    /// # Errors
    ///
    /// [`RepoError::DuplicateRepository`] if two roots are the same directory
    /// or share a namespace; [`RepoError::BadRepository`] for an invalid root.
    /// Nothing is registered on failure.
    pub fn new(roots: &[PathBuf]) -> Result<Self, RepoError> {
        let mut repos: Vec<Repository> = Vec::with_capacity(roots.len());
        for root in roots {
            let repo = Repository::open(root)?;
            if let Some(prev) = repos
                .iter()
                .find(|r| r.root == repo.root || r.namespace == repo.namespace)
            {
                return Err(RepoError::DuplicateRepository {
                    first: prev.root.clone(),
                    second: repo.root.clone(),
                    namespace: repo.namespace.clone(),
                });
            }
            repos.push(repo);
        }
        Ok(Self {
            repos,
            registered: Vec::new(),
            loaders: OnceLock::new(),
            recipes: Mutex::new(HashMap::new()),
            instances: InstanceCache::default(),
        })
    }

    /// Register a loader for `name` under `namespace`.
    ///
    /// It shadows a file recipe of the same name in that namespace. Must be
    /// called before the first lookup.
    pub fn register(
        mut self,
        namespace: &str,
        name: &str,
        loader: impl Fn(&RecipeHandle) -> Result<Arc<dyn Recipe>, BoxError> + Send + Sync + 'static,
    ) -> Self {
        if self.loaders.get().is_some() {
            tracing::warn!(name, "loader registered after first lookup is ignored");
        }
        self.registered.push(Registered {
            namespace: namespace.to_string(),
            name: name.to_string(),
            loader: Arc::new(loader),
        });
        self
    }

    /// Repositories in search order.
    pub fn repositories(&self) -> &[Repository] {
        &self.repos
    }

    /// The instance cache.
    pub fn instances(&self) -> &InstanceCache {
        &self.instances
    }

    fn namespace_rank(&self, namespace: &str) -> usize {
        self.repos
            .iter()
            .position(|r| r.namespace == namespace)
            .unwrap_or(self.repos.len())
    }

    fn loaders(&self) -> &BTreeMap<String, Vec<RecipeHandle>> {
        self.loaders.get_or_init(|| {
            let mut map: BTreeMap<String, Vec<(usize, usize, RecipeHandle)>> = BTreeMap::new();
            for r in &self.registered {
                map.entry(r.name.clone()).or_default().push((
                    self.namespace_rank(&r.namespace),
                    0,
                    RecipeHandle {
                        name: r.name.clone(),
                        namespace: r.namespace.clone(),
                        path: None,
                        loader: Arc::clone(&r.loader),
                    },
                ));
            }
            let toml = toml_loader();
            for (rank, repo) in self.repos.iter().enumerate() {
                for name in repo.package_names() {
                    let handle = RecipeHandle {
                        path: Some(repo.recipe_path(&name)),
                        namespace: repo.namespace.clone(),
                        loader: Arc::clone(&toml),
                        name: name.clone(),
                    };
                    map.entry(name).or_default().push((rank, 1, handle));
                }
            }
            let total: usize = map.values().map(Vec::len).sum();
            tracing::debug!(packages = map.len(), recipes = total, "loader map built");
            map.into_iter()
                .map(|(name, mut handles)| {
                    handles.sort_by_key(|(rank, order, _)| (*rank, *order));
                    (name, handles.into_iter().map(|(_, _, h)| h).collect())
                })
                .collect()
        })
    }

    fn check_namespace(&self, namespace: &str) -> Result<(), RepoError> {
        let known = self.repos.iter().any(|r| r.namespace == namespace)
            || self.registered.iter().any(|r| r.namespace == namespace);
        if known {
            Ok(())
        } else {
            Err(RepoError::UnknownNamespace(namespace.to_string()))
        }
    }

    /// Every package name across repositories, sorted.
    pub fn all_names(&self) -> Vec<&str> {
        self.loaders().keys().map(String::as_str).collect()
    }

    fn suggestions(&self, name: &str) -> Vec<String> {
        let matcher = SkimMatcherV2::default();
        let mut scored: Vec<(i64, &str)> = self
            .all_names()
            .into_iter()
            .filter_map(|candidate| matcher.fuzzy_match(candidate, name).map(|s| (s, candidate)))
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(b.1)));
        scored
            .into_iter()
            .take(MAX_SUGGESTIONS)
            .map(|(_, n)| n.to_string())
            .collect()
    }

    /// Find the recipe for `name`, optionally restricted to `namespace`.
    ///
    /// # Errors
    ///
    /// [`RepoError::UnknownNamespace`] for an unknown hint,
    /// [`RepoError::UnknownPackage`] when no repository has it.
    pub fn lookup(&self, name: &str, namespace: Option<&str>) -> Result<RecipeHandle, RepoError> {
        if let Some(ns) = namespace {
            self.check_namespace(ns)?;
        }
        self.loaders()
            .get(name)
            .and_then(|handles| {
                handles
                    .iter()
                    .find(|h| namespace.is_none_or(|ns| h.namespace == ns))
            })
            .cloned()
            .ok_or_else(|| RepoError::UnknownPackage {
                name: name.to_string(),
                suggestions: self.suggestions(name),
            })
    }

    /// Whether some repository provides `name`.
    pub fn exists(&self, name: &str) -> bool {
        self.loaders().contains_key(name)
    }

    /// Where the recipe for `name` lives, or would be created.
    ///
    /// # Errors
    ///
    /// [`RepoError::UnknownNamespace`] for an unknown hint, or
    /// [`RepoError::BadRepository`] when there is no repository at all.
    pub fn recipe_path(&self, name: &str, namespace: Option<&str>) -> Result<PathBuf, RepoError> {
        if let Ok(RecipeHandle { path: Some(path), .. }) = self.lookup(name, namespace) {
            return Ok(path);
        }
        let repo = match namespace {
            Some(ns) => self
                .repos
                .iter()
                .find(|r| r.namespace == ns)
                .ok_or_else(|| RepoError::UnknownNamespace(ns.to_string()))?,
            None => self.repos.first().ok_or_else(|| RepoError::BadRepository {
                path: PathBuf::new(),
                reason: "no repositories configured".to_string(),
            })?,
        };
        Ok(repo.recipe_path(name))
    }

    fn construct(handle: &RecipeHandle) -> Result<Arc<dyn Recipe>, RepoError> {
        (handle.loader)(handle).map_err(|cause| RepoError::RecipeConstructionError {
            name: handle.name.clone(),
            cause,
        })
    }

    /// The recipe behind `handle`, constructed once and cached.
    ///
    /// # Errors
    ///
    /// [`RepoError::RecipeConstructionError`] if the loader fails.
    pub fn recipe(&self, handle: &RecipeHandle) -> Result<Arc<dyn Recipe>, RepoError> {
        let key = (handle.namespace.clone(), handle.name.clone());
        let mut recipes = self.recipes.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(recipe) = recipes.get(&key) {
            return Ok(Arc::clone(recipe));
        }
        let recipe = Self::construct(handle)?;
        recipes.insert(key, Arc::clone(&recipe));
        Ok(recipe)
    }

    /// Recipe instance for `spec`.
    ///
    /// The same instance is returned for the same hash unless `force_new`,
    /// which evicts it and reconstructs the recipe.
    ///
    /// # Errors
    ///
    /// [`RepoError::UnknownNamespace`], [`RepoError::UnknownPackage`] or
    /// [`RepoError::RecipeConstructionError`].
    pub fn load(&self, spec: &Arc<ConcreteSpec>, force_new: bool) -> Result<Arc<RecipeInstance>, RepoError> {
        if force_new {
            self.instances.evict(spec.hash());
        } else if let Some(instance) = self.instances.get(spec.hash()) {
            return Ok(instance);
        }

        let handle = self.lookup(spec.name(), Some(&spec.node().namespace))?;
        let recipe = if force_new {
            let fresh = Self::construct(&handle)?;
            self.recipes
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert((handle.namespace.clone(), handle.name.clone()), Arc::clone(&fresh));
            fresh
        } else {
            self.recipe(&handle)?
        };
        let instance = Arc::new(RecipeInstance {
            spec: Arc::clone(spec),
            recipe,
        });
        self.instances.insert(Arc::clone(&instance));
        Ok(instance)
    }
}
