//! Reference concretizer.
//!
//! Greedy fixed-point: each round walks the graph from the root, picks every
//! node's attributes from the constraints gathered so far, and collects the
//! constraints its active dependencies impose. Rounds repeat until the
//! collected constraints stop changing, then the graph is checked and
//! assembled bottom-up. Packages are shared by name, so a diamond yields one
//! node.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use kiln_schema::{
    AbstractSpec, ArchConstraint, CompilerConstraint, ConcreteArch, ConcreteCompiler, ConcreteSpec, DepTypes,
    DependencyEdge, SpecNode, VariantValue,
};
use thiserror::Error;

use crate::compiler::{CompilerDescriptor, detect};
use crate::microarch::{self, TargetTable};
use crate::repo::recipe::{RecipeDecl, VariantDecl};
use crate::repo::{RepoError, Registry};

const MAX_ROUNDS: usize = 32;

/// Errors from concretization.
#[derive(Debug, Error)]
pub enum ConcretizeError {
    /// No graph meets every constraint.
    #[error("cannot concretize '{spec}': {reason}")]
    UnsatisfiableSpec {
        /// The request.
        spec: String,
        /// First violated constraint.
        reason: String,
    },
    /// A package could not be found or loaded.
    #[error(transparent)]
    Repo(#[from] RepoError),
}

impl ConcretizeError {
    /// Taxonomy name.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnsatisfiableSpec { .. } => "UnsatisfiableSpec",
            Self::Repo(e) => e.kind(),
        }
    }
}

/// Platform, OS and target nodes inherit when nothing constrains them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostArch {
    /// `linux`, `darwin`.
    pub platform: String,
    /// Operating system with version.
    pub os: String,
    /// Microarchitecture name.
    pub target: String,
}

impl HostArch {
    /// Probe the running machine.
    pub fn detect() -> Self {
        Self {
            platform: detect::platform().to_string(),
            os: detect::operating_system(),
            target: microarch::host().name().to_string(),
        }
    }
}

impl fmt::Display for HostArch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.platform, self.os, self.target)
    }
}

struct Resolved {
    node: SpecNode,
    edges: Vec<(String, DepTypes)>,
}

type Constraints = BTreeMap<String, Vec<AbstractSpec>>;

/// Turns abstract requests into concrete graphs.
#[derive(Debug)]
pub struct Concretizer<'a> {
    registry: &'a Registry,
    compilers: Vec<CompilerDescriptor>,
    host: HostArch,
    families: Vec<&'static str>,
    table: &'static TargetTable,
}

impl<'a> Concretizer<'a> {
    /// Concretizer choosing among `compilers` on `host`.
    pub fn new(registry: &'a Registry, compilers: Vec<CompilerDescriptor>, host: HostArch) -> Self {
        Self {
            registry,
            compilers,
            host,
            families: detect::family_names(),
            table: TargetTable::builtin(),
        }
    }

    /// Host attributes used as defaults.
    pub fn host(&self) -> &HostArch {
        &self.host
    }

    /// Concretize `request` into a graph rooted at its package.
    ///
    /// # Errors
    ///
    /// [`ConcretizeError::UnsatisfiableSpec`] when no graph satisfies the
    /// request, [`ConcretizeError::Repo`] when a package is unknown.
    pub fn concretize(&self, request: &AbstractSpec) -> Result<Arc<ConcreteSpec>, ConcretizeError> {
        let unsat = |reason: String| ConcretizeError::UnsatisfiableSpec {
            spec: request.to_string(),
            reason,
        };
        let root = request
            .name()
            .ok_or_else(|| unsat("the request names no package".to_string()))?
            .to_string();

        let mut user: Constraints = BTreeMap::new();
        user.entry(root.clone()).or_default().push(request.without_dependencies());
        for dep in request.dependencies() {
            let name = dep
                .name()
                .ok_or_else(|| unsat(format!("dependency constraint '{dep}' names no package")))?;
            user.entry(name.to_string()).or_default().push(dep.without_dependencies());
        }

        let mut derived: Constraints = BTreeMap::new();
        for round in 0..MAX_ROUNDS {
            let (nodes, next) = self.expand(&root, &user, &derived).map_err(|e| match e {
                Expansion::Unsat(reason) => unsat(reason),
                Expansion::Repo(e) => ConcretizeError::Repo(e),
            })?;
            if next == derived {
                tracing::debug!(%request, rounds = round + 1, nodes = nodes.len(), "concretized");
                return Self::assemble(&root, &user, &derived, &nodes).map_err(unsat);
            }
            derived = next;
        }
        Err(unsat(format!("constraints did not settle after {MAX_ROUNDS} rounds")))
    }

    fn expand(
        &self,
        root: &str,
        user: &Constraints,
        derived: &Constraints,
    ) -> Result<(BTreeMap<String, Resolved>, Constraints), Expansion> {
        let mut nodes: BTreeMap<String, Resolved> = BTreeMap::new();
        let mut next: Constraints = BTreeMap::new();
        let mut queue: VecDeque<(String, Option<String>)> = VecDeque::from([(root.to_string(), None)]);

        while let Some((name, parent)) = queue.pop_front() {
            if nodes.contains_key(&name) {
                continue;
            }
            let constraints: Vec<&AbstractSpec> = user
                .get(&name)
                .into_iter()
                .chain(derived.get(&name))
                .flatten()
                .collect();
            let hint = constraints.iter().find_map(|c| c.namespace());
            let handle = self.registry.lookup(&name, hint)?;
            let recipe = self.registry.recipe(&handle)?;
            let decl = recipe.decl();

            let parent_node = parent.as_ref().and_then(|p| nodes.get(p)).map(|r| &r.node);
            let node = self
                .choose(decl, &handle.namespace, &constraints, parent_node)
                .map_err(|reason| Expansion::Unsat(format!("{name}: {reason}")))?;

            let mut edges: Vec<(String, DepTypes)> = Vec::new();
            for dep in decl.active_dependencies(&node) {
                let Some(dep_name) = dep.spec.name() else { continue };
                next.entry(dep_name.to_string())
                    .or_default()
                    .push(dep.spec.without_dependencies());
                match edges.iter_mut().find(|(n, _)| n == dep_name) {
                    Some((_, types)) => *types = *types | dep.types,
                    None => edges.push((dep_name.to_string(), dep.types)),
                }
                queue.push_back((dep_name.to_string(), Some(name.clone())));
            }
            nodes.insert(name, Resolved { node, edges });
        }
        Ok((nodes, next))
    }

    fn choose(
        &self,
        decl: &RecipeDecl,
        namespace: &str,
        constraints: &[&AbstractSpec],
        parent: Option<&SpecNode>,
    ) -> Result<SpecNode, String> {
        let version = Self::choose_version(decl, constraints)?;
        let variants = Self::choose_variants(decl, constraints)?;
        let arch = self.choose_arch(constraints, parent)?;
        let compiler = self.choose_compiler(constraints, parent, &arch.os)?;
        let node = SpecNode {
            name: decl.name.clone(),
            namespace: namespace.to_string(),
            version,
            variants,
            compiler,
            arch,
        };
        if let Some(message) = decl.conflict(&node) {
            return Err(format!("conflict: {message}"));
        }
        Ok(node)
    }

    fn choose_version(decl: &RecipeDecl, constraints: &[&AbstractSpec]) -> Result<kiln_schema::Version, String> {
        if decl.versions.is_empty() {
            return Err("recipe declares no versions".to_string());
        }
        let candidates: Vec<_> = decl
            .versions
            .iter()
            .filter(|v| constraints.iter().all(|c| c.versions().contains(&v.version)))
            .filter(|v| !v.version.is_infinity() || constraints.iter().any(|c| c.versions().names(&v.version)))
            .collect();
        candidates
            .iter()
            .find(|v| v.preferred)
            .or_else(|| candidates.iter().max_by(|a, b| a.version.cmp(&b.version)))
            .map(|v| v.version.clone())
            .ok_or_else(|| {
                let wanted: Vec<String> = constraints
                    .iter()
                    .filter(|c| !c.versions().is_any())
                    .map(|c| c.versions().to_string())
                    .collect();
                format!("no declared version satisfies @{}", wanted.join(" and @"))
            })
    }

    fn merge_variant(decl: &VariantDecl, current: VariantValue, want: &VariantValue) -> Result<VariantValue, String> {
        if want.satisfied_by(&current) {
            return Ok(current);
        }
        if current.satisfied_by(want) {
            return Ok(want.clone());
        }
        let bool_involved = matches!(current, VariantValue::Bool(_)) || matches!(want, VariantValue::Bool(_));
        if decl.multi && !bool_involved {
            let mut all = current.values();
            all.extend(want.values());
            return Ok(VariantValue::Multi(all));
        }
        Err(format!("conflicting values requested for variant '{}'", decl.name))
    }

    fn choose_variants(
        decl: &RecipeDecl,
        constraints: &[&AbstractSpec],
    ) -> Result<BTreeMap<String, VariantValue>, String> {
        for c in constraints {
            if let Some(unknown) = c.variants().keys().find(|n| decl.variant(n).is_none()) {
                return Err(format!("no variant named '{unknown}'"));
            }
        }
        let mut chosen = BTreeMap::new();
        for variant in &decl.variants {
            let mut value: Option<VariantValue> = None;
            for want in constraints.iter().filter_map(|c| c.variants().get(&variant.name)) {
                value = Some(match value {
                    None => want.clone(),
                    Some(current) => Self::merge_variant(variant, current, want)?,
                });
            }
            let value = value.unwrap_or_else(|| variant.default.clone());
            if let Some(reason) = variant.reject(&value) {
                return Err(reason);
            }
            chosen.insert(variant.name.clone(), value);
        }
        Ok(chosen)
    }

    fn choose_arch(&self, constraints: &[&AbstractSpec], parent: Option<&SpecNode>) -> Result<ConcreteArch, String> {
        fn pick(
            constraints: &[&AbstractSpec],
            field: impl Fn(&ArchConstraint) -> Option<&String>,
            inherited: &str,
            what: &str,
        ) -> Result<(String, bool), String> {
            let mut requested: Option<&String> = None;
            for value in constraints.iter().filter_map(|c| field(c.arch())) {
                match requested {
                    Some(prev) if prev != value => {
                        return Err(format!("conflicting {what} requests '{prev}' and '{value}'"));
                    }
                    _ => requested = Some(value),
                }
            }
            Ok(match requested {
                Some(v) => (v.clone(), true),
                None => (inherited.to_string(), false),
            })
        }

        let (platform, os, target) = match parent {
            Some(p) => (&p.arch.platform, &p.arch.os, &p.arch.target),
            None => (&self.host.platform, &self.host.os, &self.host.target),
        };
        let (platform, _) = pick(constraints, |a| a.platform.as_ref(), platform, "platform")?;
        let (os, _) = pick(constraints, |a| a.os.as_ref(), os, "os")?;
        let (target, explicit) = pick(constraints, |a| a.target.as_ref(), target, "target")?;
        if explicit {
            self.table.get(&target).map_err(|e| e.to_string())?;
        }
        Ok(ConcreteArch { platform, os, target })
    }

    fn choose_compiler(
        &self,
        constraints: &[&AbstractSpec],
        parent: Option<&SpecNode>,
        os: &str,
    ) -> Result<ConcreteCompiler, String> {
        let wanted: Vec<&CompilerConstraint> = constraints.iter().filter_map(|c| c.compiler()).collect();
        let candidates: Vec<&CompilerDescriptor> = self
            .compilers
            .iter()
            .filter(|d| d.operating_system == os && wanted.iter().all(|w| d.satisfies(w)))
            .collect();

        if wanted.is_empty() {
            if let Some(p) = parent {
                let inherited = candidates
                    .iter()
                    .any(|d| d.name == p.compiler.name && d.version == p.compiler.version);
                if inherited {
                    return Ok(p.compiler.clone());
                }
            }
        }

        let rank = |name: &str| {
            self.families
                .iter()
                .position(|f| *f == name)
                .unwrap_or(self.families.len())
        };
        candidates
            .into_iter()
            .min_by_key(|d| (rank(&d.name), Reverse(d.version.clone())))
            .map(|d| ConcreteCompiler {
                name: d.name.clone(),
                version: d.version.clone(),
            })
            .ok_or_else(|| {
                let wanted: Vec<String> = wanted.iter().map(ToString::to_string).collect();
                if wanted.is_empty() {
                    format!("no compiler configured for {os}")
                } else {
                    format!("no compiler matching %{} for {os}", wanted.join(" %"))
                }
            })
    }

    fn assemble(
        root: &str,
        user: &Constraints,
        derived: &Constraints,
        nodes: &BTreeMap<String, Resolved>,
    ) -> Result<Arc<ConcreteSpec>, String> {
        if let Some(missing) = user.keys().find(|n| !nodes.contains_key(*n)) {
            return Err(format!("{missing} is not a dependency of {root}"));
        }
        for (name, constraints) in user.iter().chain(derived) {
            let Some(resolved) = nodes.get(name) else { continue };
            if let Some(c) = constraints.iter().find(|c| !resolved.node.satisfies(c)) {
                return Err(format!("{name} does not satisfy '{c}'"));
            }
        }

        let mut built = HashMap::new();
        let mut path = Vec::new();
        build(root, nodes, &mut built, &mut path)
    }
}

fn build(
    name: &str,
    nodes: &BTreeMap<String, Resolved>,
    built: &mut HashMap<String, Arc<ConcreteSpec>>,
    path: &mut Vec<String>,
) -> Result<Arc<ConcreteSpec>, String> {
    if let Some(spec) = built.get(name) {
        return Ok(Arc::clone(spec));
    }
    if path.iter().any(|p| p == name) {
        return Err(format!("dependency cycle {} -> {name}", path.join(" -> ")));
    }
    let resolved = nodes
        .get(name)
        .ok_or_else(|| format!("{name} was never resolved"))?;
    path.push(name.to_string());
    let mut edges = Vec::with_capacity(resolved.edges.len());
    for (dep, types) in &resolved.edges {
        edges.push(DependencyEdge {
            spec: build(dep, nodes, built, path)?,
            types: *types,
        });
    }
    path.pop();
    let spec = ConcreteSpec::new(resolved.node.clone(), edges).map_err(|e| e.to_string())?;
    built.insert(name.to_string(), Arc::clone(&spec));
    Ok(spec)
}

enum Expansion {
    Unsat(String),
    Repo(RepoError),
}

impl From<RepoError> for Expansion {
    fn from(e: RepoError) -> Self {
        Self::Repo(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::tests::descriptor;
    use crate::repo::Repository;
    use crate::repo::tests::write_recipe;
    use std::path::Path;

    const SHA: &str = "9a93b2b7dfdac77ceba5a558a580e74667dd6fede4585b91eefb60f03b72df23";

    fn version(v: &str, extra: &str) -> String {
        format!("[[versions]]\nversion = \"{v}\"\nurl = \"file:///dev/null\"\nsha256 = \"{SHA}\"\n{extra}\n")
    }

    fn recipe(versions: &[&str], body: &str) -> String {
        let mut text = String::from("phases = [\"install\"]\n");
        for v in versions {
            text.push_str(&version(v, ""));
        }
        text.push_str(body);
        text.push_str("\n[steps]\ninstall = \"true\"\n");
        text
    }

    fn dep(spec: &str, when: Option<&str>) -> String {
        match when {
            Some(w) => format!("[[dependencies]]\nspec = \"{spec}\"\nwhen = \"{w}\"\n"),
            None => format!("[[dependencies]]\nspec = \"{spec}\"\n"),
        }
    }

    fn host() -> HostArch {
        HostArch {
            platform: "linux".into(),
            os: "ubuntu22.04".into(),
            target: "x86_64".into(),
        }
    }

    fn compilers() -> Vec<CompilerDescriptor> {
        vec![
            descriptor("clang", "17.0.6", "ubuntu22.04"),
            descriptor("gcc", "11.4.0", "ubuntu22.04"),
            descriptor("gcc", "13.2.0", "ubuntu22.04"),
            descriptor("gcc", "14.1.0", "rhel8"),
        ]
    }

    fn registry(dir: &Path, recipes: &[(&str, String)]) -> Registry {
        let root = dir.join("repo");
        Repository::create(&root, "builtin").unwrap();
        for (name, body) in recipes {
            write_recipe(&root, name, body);
        }
        Registry::new(&[root]).unwrap()
    }

    fn concretize(reg: &Registry, text: &str) -> Result<Arc<ConcreteSpec>, ConcretizeError> {
        Concretizer::new(reg, compilers(), host()).concretize(&AbstractSpec::parse(text).unwrap())
    }

    fn reason(err: ConcretizeError) -> String {
        match err {
            ConcretizeError::UnsatisfiableSpec { reason, .. } => reason,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn defaults_versions_and_compiler() {
        let dir = tempfile::tempdir().unwrap();
        let zlib = format!(
            "phases = [\"install\"]\n{}{}{}\n[variants.shared]\ndefault = true\n[steps]\ninstall = \"true\"\n",
            version("1.2.13", ""),
            version("1.3.1", ""),
            version("develop", ""),
        );
        let reg = registry(dir.path(), &[("zlib", zlib)]);

        let spec = concretize(&reg, "zlib").unwrap();
        assert_eq!(spec.version().as_str(), "1.3.1");
        assert_eq!(spec.variants()["shared"], VariantValue::Bool(true));
        assert_eq!(spec.compiler().to_string(), "gcc@13.2.0");
        assert_eq!(spec.arch().to_string(), "linux-ubuntu22.04-x86_64");
        assert_eq!(spec.node().namespace, "builtin");

        assert_eq!(concretize(&reg, "zlib@develop").unwrap().version().as_str(), "develop");
        assert_eq!(concretize(&reg, "zlib@:1.2 ~shared").unwrap().version().as_str(), "1.2.13");
        assert_eq!(concretize(&reg, "zlib %clang").unwrap().compiler().name, "clang");
        assert!(reason(concretize(&reg, "zlib@2:").unwrap_err()).contains("no declared version"));
        assert!(reason(concretize(&reg, "zlib %gcc@14").unwrap_err()).contains("no compiler"));
    }

    #[test]
    fn preferred_version_wins() {
        let dir = tempfile::tempdir().unwrap();
        let body = format!(
            "{}{}\n[steps]\ninstall = \"true\"\n",
            version("3.0.13", "preferred = true"),
            version("3.2.1", "")
        );
        let reg = registry(dir.path(), &[("openssl", body)]);
        assert_eq!(concretize(&reg, "openssl").unwrap().version().as_str(), "3.0.13");
        assert_eq!(concretize(&reg, "openssl@3.2").unwrap().version().as_str(), "3.2.1");
    }

    #[test]
    fn conditional_dependencies_and_recipe_constraints() {
        let dir = tempfile::tempdir().unwrap();
        let hdf5 = recipe(
            &["1.14.3"],
            &format!(
                "[variants.zlib]\ndefault = true\n{}{}",
                dep("zlib@:1.2", Some("+zlib")),
                dep("cmake", None)
            ),
        );
        let reg = registry(
            dir.path(),
            &[
                ("hdf5", hdf5),
                ("zlib", recipe(&["1.2.13", "1.3.1"], "")),
                ("cmake", recipe(&["3.27.9"], "")),
            ],
        );

        let spec = concretize(&reg, "hdf5 %gcc@11").unwrap();
        let zlib = &spec.dependency("zlib").unwrap().spec;
        assert_eq!(zlib.version().as_str(), "1.2.13");
        assert_eq!(zlib.compiler().to_string(), "gcc@11.4.0");
        assert_eq!(spec.dependency("cmake").unwrap().types, DepTypes::default());

        let without = concretize(&reg, "hdf5~zlib").unwrap();
        assert!(without.dependency("zlib").is_none());

        let err = concretize(&reg, "hdf5 ^zlib@1.3").unwrap_err();
        assert!(reason(err).contains("zlib"));
        let err = concretize(&reg, "hdf5~zlib ^zlib").unwrap_err();
        assert!(reason(err).contains("not a dependency"));
    }

    #[test]
    fn diamond_shares_one_node() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(
            dir.path(),
            &[
                ("app", recipe(&["1.0"], &format!("{}{}", dep("left", None), dep("right", None)))),
                ("left", recipe(&["1.0"], &dep("base", None))),
                ("right", recipe(&["1.0"], &dep("base@2:", None))),
                ("base", recipe(&["1.0", "2.0", "3.0"], "")),
            ],
        );
        let spec = concretize(&reg, "app").unwrap();
        let left = &spec.dependency("left").unwrap().spec;
        let right = &spec.dependency("right").unwrap().spec;
        let (a, b) = (&left.dependency("base").unwrap().spec, &right.dependency("base").unwrap().spec);
        assert!(Arc::ptr_eq(a, b));
        assert_eq!(a.version().as_str(), "3.0");
        assert_eq!(spec.traverse(kiln_schema::Order::Post, DepTypes::ALL).count(), 4);
    }

    #[test]
    fn variant_errors_conflicts_and_cycles() {
        let dir = tempfile::tempdir().unwrap();
        let mpi = recipe(
            &["4.1.6"],
            "[variants.fabrics]\ndefault = \"auto\"\nvalues = [\"auto\", \"ucx\", \"ofi\"]\nmulti = true\n\
             [[conflicts]]\nspec = \"%clang\"\nmsg = \"needs gcc\"\n",
        );
        let reg = registry(
            dir.path(),
            &[
                ("mpi", mpi),
                ("ping", recipe(&["1.0"], &dep("pong", None))),
                ("pong", recipe(&["1.0"], &dep("ping", None))),
            ],
        );

        let spec = concretize(&reg, "mpi fabrics=ucx,ofi").unwrap();
        assert_eq!(spec.variants()["fabrics"], VariantValue::from_assignment("ofi,ucx"));
        assert!(reason(concretize(&reg, "mpi fabrics=tcp").unwrap_err()).contains("does not allow"));
        assert!(reason(concretize(&reg, "mpi +debug").unwrap_err()).contains("no variant"));
        assert!(reason(concretize(&reg, "mpi %clang").unwrap_err()).contains("needs gcc"));
        assert!(reason(concretize(&reg, "mpi target=nehalem9000").unwrap_err()).contains("nehalem9000"));
        assert!(reason(concretize(&reg, "ping").unwrap_err()).contains("cycle"));
        assert_eq!(concretize(&reg, "nothere").unwrap_err().kind(), "UnknownPackage");
    }
}
