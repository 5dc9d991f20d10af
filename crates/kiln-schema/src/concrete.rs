//! Concrete specs: fully resolved, immutable dependency graph nodes.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::deptype::DepTypes;
use crate::hash::DagHash;
use crate::spec::{AbstractSpec, ArchConstraint, CompilerConstraint};
use crate::traverse::{Order, Traversal};
use crate::variant::VariantValue;
use crate::version::{Version, VersionList};

/// Errors raised while assembling or decoding a concrete graph.
#[derive(Debug, Error)]
pub enum GraphError {
    /// A node lists the same dependency name twice.
    #[error("{parent} depends on '{name}' more than once")]
    DuplicateDependency {
        /// Dependent package.
        parent: String,
        /// Duplicated dependency name.
        name: String,
    },
    /// A serialized graph references a node it does not contain.
    #[error("serialized graph references unknown node {0}")]
    MissingNode(String),
    /// A serialized node's recorded hash disagrees with its content.
    #[error("hash mismatch for {name}: recorded {recorded}, computed {computed}")]
    HashMismatch {
        /// Package name.
        name: String,
        /// Hash stored in the record.
        recorded: DagHash,
        /// Hash recomputed from the content.
        computed: DagHash,
    },
    /// A serialized graph contains a cycle.
    #[error("serialized graph contains a cycle through {0}")]
    Cycle(String),
    /// The hash input could not be encoded.
    #[error("failed to encode hash input: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Resolved compiler. Its operating-system binding is the owning spec's
/// [`ConcreteArch::os`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConcreteCompiler {
    /// Toolchain name.
    pub name: String,
    /// Toolchain version.
    pub version: Version,
}

impl fmt::Display for ConcreteCompiler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

/// Resolved platform, operating system and microarchitecture.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConcreteArch {
    /// `linux`, `darwin`.
    pub platform: String,
    /// Operating system name and version.
    pub os: String,
    /// Microarchitecture name.
    pub target: String,
}

impl fmt::Display for ConcreteArch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.platform, self.os, self.target)
    }
}

/// The node-local part of a concrete spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecNode {
    /// Package name.
    pub name: String,
    /// Repository namespace the recipe came from.
    pub namespace: String,
    /// Exact version.
    pub version: Version,
    /// Every declared variant with its concrete value.
    pub variants: BTreeMap<String, VariantValue>,
    /// Compiler used for this node.
    pub compiler: ConcreteCompiler,
    /// Target architecture.
    pub arch: ConcreteArch,
}

impl SpecNode {
    /// Whether the node attributes satisfy `constraint`, ignoring its `^`
    /// dependency constraints.
    pub fn satisfies(&self, constraint: &AbstractSpec) -> bool {
        if constraint.name().is_some_and(|n| n != self.name) {
            return false;
        }
        if constraint.namespace().is_some_and(|ns| ns != self.namespace) {
            return false;
        }
        if !constraint.versions().contains(&self.version) {
            return false;
        }
        let variants_ok = constraint.variants().iter().all(|(name, want)| {
            self.variants
                .get(name)
                .is_some_and(|have| want.satisfied_by(have))
        });
        if !variants_ok {
            return false;
        }
        if let Some(c) = constraint.compiler() {
            if c.name != self.compiler.name || !c.versions.contains(&self.compiler.version) {
                return false;
            }
        }
        let arch = constraint.arch();
        arch.platform.as_ref().is_none_or(|p| *p == self.arch.platform)
            && arch.os.as_ref().is_none_or(|o| *o == self.arch.os)
            && arch.target.as_ref().is_none_or(|t| *t == self.arch.target)
    }

    /// The node as an abstract spec pinned to exactly these values.
    pub fn to_abstract(&self) -> AbstractSpec {
        AbstractSpec {
            name: Some(self.name.clone()),
            namespace: None,
            versions: VersionList::exact(self.version.clone()),
            variants: self.variants.clone(),
            compiler: Some(CompilerConstraint {
                name: self.compiler.name.clone(),
                versions: VersionList::exact(self.compiler.version.clone()),
            }),
            arch: ArchConstraint {
                platform: Some(self.arch.platform.clone()),
                os: Some(self.arch.os.clone()),
                target: Some(self.arch.target.clone()),
            },
            dependencies: Vec::new(),
        }
    }
}

/// A dependency edge: child node plus edge types.
#[derive(Debug, Clone)]
pub struct DependencyEdge {
    /// Child node.
    pub spec: Arc<ConcreteSpec>,
    /// Why the parent needs it.
    pub types: DepTypes,
}

/// A fully concrete spec: node attributes, dependency edges and identity.
///
/// Children must exist before their parent, so a graph of `ConcreteSpec`s
/// is acyclic.
#[derive(Debug)]
pub struct ConcreteSpec {
    node: SpecNode,
    dependencies: Vec<DependencyEdge>,
    hash: DagHash,
}

#[derive(Serialize)]
struct HashInput<'a> {
    node: &'a SpecNode,
    dependencies: Vec<(&'a str, &'a DagHash, DepTypes)>,
}

impl ConcreteSpec {
    /// Assemble a node over already-built children and compute its hash.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::DuplicateDependency`] if two edges share a name
    /// and [`GraphError::Encode`] if the hash input cannot be serialized.
    pub fn new(node: SpecNode, mut dependencies: Vec<DependencyEdge>) -> Result<Arc<Self>, GraphError> {
        dependencies.sort_by(|a, b| a.spec.name().cmp(b.spec.name()));
        if let Some(pair) = dependencies
            .windows(2)
            .find(|w| w[0].spec.name() == w[1].spec.name())
        {
            return Err(GraphError::DuplicateDependency {
                parent: node.name.clone(),
                name: pair[0].spec.name().to_string(),
            });
        }

        let input = HashInput {
            node: &node,
            dependencies: dependencies
                .iter()
                .map(|d| (d.spec.name(), d.spec.hash(), d.types))
                .collect(),
        };
        let encoded = serde_json::to_vec(&input)?;
        let hash = DagHash::compute(&encoded);

        Ok(Arc::new(Self {
            node,
            dependencies,
            hash,
        }))
    }

    /// Node-local attributes.
    pub fn node(&self) -> &SpecNode {
        &self.node
    }

    /// Package name.
    pub fn name(&self) -> &str {
        &self.node.name
    }

    /// Exact version.
    pub fn version(&self) -> &Version {
        &self.node.version
    }

    /// Resolved compiler.
    pub fn compiler(&self) -> &ConcreteCompiler {
        &self.node.compiler
    }

    /// Resolved architecture.
    pub fn arch(&self) -> &ConcreteArch {
        &self.node.arch
    }

    /// Concrete variant values.
    pub fn variants(&self) -> &BTreeMap<String, VariantValue> {
        &self.node.variants
    }

    /// Identity hash.
    pub fn hash(&self) -> &DagHash {
        &self.hash
    }

    /// Direct dependency edges, sorted by name.
    pub fn dependencies(&self) -> &[DependencyEdge] {
        &self.dependencies
    }

    /// Direct dependency by name.
    pub fn dependency(&self, name: &str) -> Option<&DependencyEdge> {
        self.dependencies.iter().find(|d| d.spec.name() == name)
    }

    /// Lazy traversal of this node and every reachable node whose edge types
    /// intersect `types`. Each unique node is yielded once.
    pub fn traverse(self: &Arc<Self>, order: Order, types: DepTypes) -> Traversal {
        Traversal::new(Arc::clone(self), order, types)
    }

    /// Whether this graph satisfies `constraint`: the root must satisfy the
    /// node constraints and each `^dep` must be met by some reachable node.
    pub fn satisfies(self: &Arc<Self>, constraint: &AbstractSpec) -> bool {
        self.node.satisfies(constraint)
            && constraint.dependencies().iter().all(|dep| {
                self.traverse(Order::Pre, DepTypes::ALL)
                    .any(|n| n.node.satisfies(dep))
            })
    }

    /// `name@version/hash7` for messages.
    pub fn short_form(&self) -> String {
        format!("{}@{}/{}", self.node.name, self.node.version, self.hash.short())
    }

    /// Flatten the graph into a serializable record.
    pub fn to_record(self: &Arc<Self>) -> SpecRecord {
        let nodes = self
            .traverse(Order::Post, DepTypes::ALL)
            .map(|spec| NodeRecord {
                hash: spec.hash.clone(),
                node: spec.node.clone(),
                dependencies: spec
                    .dependencies
                    .iter()
                    .map(|d| EdgeRecord {
                        hash: d.spec.hash.clone(),
                        types: d.types,
                    })
                    .collect(),
            })
            .collect();
        SpecRecord {
            root: self.hash.clone(),
            nodes,
        }
    }

    /// Rebuild a graph from a record, verifying every hash.
    ///
    /// # Errors
    ///
    /// Returns a [`GraphError`] for dangling references, cycles or hashes
    /// that do not match their content.
    pub fn from_record(record: &SpecRecord) -> Result<Arc<Self>, GraphError> {
        let by_hash: HashMap<&DagHash, &NodeRecord> =
            record.nodes.iter().map(|n| (&n.hash, n)).collect();
        let mut built: HashMap<DagHash, Arc<ConcreteSpec>> = HashMap::new();
        let mut in_progress: Vec<DagHash> = Vec::new();
        build_from_record(&record.root, &by_hash, &mut built, &mut in_progress)
    }
}

fn build_from_record(
    hash: &DagHash,
    by_hash: &HashMap<&DagHash, &NodeRecord>,
    built: &mut HashMap<DagHash, Arc<ConcreteSpec>>,
    in_progress: &mut Vec<DagHash>,
) -> Result<Arc<ConcreteSpec>, GraphError> {
    if let Some(done) = built.get(hash) {
        return Ok(Arc::clone(done));
    }
    let record = by_hash
        .get(hash)
        .ok_or_else(|| GraphError::MissingNode(hash.to_string()))?;
    if in_progress.contains(hash) {
        return Err(GraphError::Cycle(record.node.name.clone()));
    }
    in_progress.push(hash.clone());

    let mut edges = Vec::with_capacity(record.dependencies.len());
    for edge in &record.dependencies {
        let child = build_from_record(&edge.hash, by_hash, built, in_progress)?;
        edges.push(DependencyEdge {
            spec: child,
            types: edge.types,
        });
    }
    in_progress.pop();

    let spec = ConcreteSpec::new(record.node.clone(), edges)?;
    if spec.hash != *hash {
        return Err(GraphError::HashMismatch {
            name: record.node.name.clone(),
            recorded: hash.clone(),
            computed: spec.hash.clone(),
        });
    }
    built.insert(hash.clone(), Arc::clone(&spec));
    Ok(spec)
}

impl fmt::Display for ConcreteSpec {
    /// The root node in spec syntax, with exact versions.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.node.to_abstract())
    }
}

/// Serialized concrete graph: nodes in post-order, root last.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecRecord {
    /// Hash of the root node.
    pub root: DagHash,
    /// Every unique node.
    pub nodes: Vec<NodeRecord>,
}

/// One serialized node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Identity hash.
    pub hash: DagHash,
    /// Node attributes.
    #[serde(flatten)]
    pub node: SpecNode,
    /// Outgoing edges.
    pub dependencies: Vec<EdgeRecord>,
}

/// One serialized edge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeRecord {
    /// Child hash.
    pub hash: DagHash,
    /// Edge types.
    pub types: DepTypes,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn node(name: &str, version: &str) -> SpecNode {
        SpecNode {
            name: name.to_string(),
            namespace: "builtin".to_string(),
            version: Version::parse(version).unwrap(),
            variants: BTreeMap::from([("shared".to_string(), VariantValue::Bool(true))]),
            compiler: ConcreteCompiler {
                name: "gcc".to_string(),
                version: Version::parse("11.4.0").unwrap(),
            },
            arch: ConcreteArch {
                platform: "linux".to_string(),
                os: "ubuntu22.04".to_string(),
                target: "haswell".to_string(),
            },
        }
    }

    pub(crate) fn edge(spec: &Arc<ConcreteSpec>, types: DepTypes) -> DependencyEdge {
        DependencyEdge {
            spec: Arc::clone(spec),
            types,
        }
    }

    /// app -> (libfoo, libbar), libfoo -> zlib, libbar -> zlib, app -build-> cmake
    pub(crate) fn diamond() -> Arc<ConcreteSpec> {
        let zlib = ConcreteSpec::new(node("zlib", "1.3"), vec![]).unwrap();
        let cmake = ConcreteSpec::new(node("cmake", "3.27.1"), vec![]).unwrap();
        let libfoo = ConcreteSpec::new(node("libfoo", "2.0"), vec![edge(&zlib, DepTypes::default())]).unwrap();
        let libbar = ConcreteSpec::new(node("libbar", "1.1"), vec![edge(&zlib, DepTypes::LINK)]).unwrap();
        ConcreteSpec::new(
            node("app", "1.0"),
            vec![
                edge(&libfoo, DepTypes::default()),
                edge(&libbar, DepTypes::LINK | DepTypes::RUN),
                edge(&cmake, DepTypes::BUILD),
            ],
        )
        .unwrap()
    }

    #[test]
    fn hash_is_deterministic_and_content_sensitive() {
        let a = ConcreteSpec::new(node("zlib", "1.3"), vec![]).unwrap();
        let b = ConcreteSpec::new(node("zlib", "1.3"), vec![]).unwrap();
        assert_eq!(a.hash(), b.hash());

        let mut other = node("zlib", "1.3");
        other.variants.insert("shared".into(), VariantValue::Bool(false));
        let c = ConcreteSpec::new(other, vec![]).unwrap();
        assert_ne!(a.hash(), c.hash());
    }

    #[test]
    fn hash_depends_on_children_and_edge_types() {
        let zlib = ConcreteSpec::new(node("zlib", "1.3"), vec![]).unwrap();
        let zlib_old = ConcreteSpec::new(node("zlib", "1.2.13"), vec![]).unwrap();
        let a = ConcreteSpec::new(node("app", "1.0"), vec![edge(&zlib, DepTypes::LINK)]).unwrap();
        let b = ConcreteSpec::new(node("app", "1.0"), vec![edge(&zlib_old, DepTypes::LINK)]).unwrap();
        let c = ConcreteSpec::new(node("app", "1.0"), vec![edge(&zlib, DepTypes::BUILD)]).unwrap();
        assert_ne!(a.hash(), b.hash());
        assert_ne!(a.hash(), c.hash());
    }

    #[test]
    fn duplicate_dependency_is_rejected() {
        let zlib = ConcreteSpec::new(node("zlib", "1.3"), vec![]).unwrap();
        let err = ConcreteSpec::new(
            node("app", "1.0"),
            vec![edge(&zlib, DepTypes::LINK), edge(&zlib, DepTypes::RUN)],
        )
        .unwrap_err();
        assert!(matches!(err, GraphError::DuplicateDependency { .. }));
    }

    #[test]
    fn encoding_failures_surface_as_graph_errors() {
        let cause = serde_json::from_str::<u8>("not json").unwrap_err();
        let err = GraphError::from(cause);
        assert!(matches!(err, GraphError::Encode(_)));
        assert!(err.to_string().starts_with("failed to encode hash input"));
    }

    #[test]
    fn satisfies_checks_node_and_dependencies() {
        let app = diamond();
        assert!(app.satisfies(&AbstractSpec::parse("app@1: +shared %gcc@11").unwrap()));
        assert!(app.satisfies(&AbstractSpec::parse("app ^zlib@1.3 ^cmake@3.20:").unwrap()));
        assert!(!app.satisfies(&AbstractSpec::parse("app ^zlib@1.2").unwrap()));
        assert!(!app.satisfies(&AbstractSpec::parse("app~shared").unwrap()));
        assert!(!app.satisfies(&AbstractSpec::parse("app target=skylake").unwrap()));
        assert!(app.satisfies(&AbstractSpec::parse("+shared arch=linux-ubuntu22.04-haswell").unwrap()));
    }

    #[test]
    fn display_parses_back_and_is_satisfied() {
        let app = diamond();
        let text = app.to_string();
        assert_eq!(text, "app@=1.0+shared %gcc@=11.4.0 arch=linux-ubuntu22.04-haswell");
        assert!(app.satisfies(&AbstractSpec::parse(&text).unwrap()));
    }

    #[test]
    fn record_round_trip_preserves_sharing_and_hashes() {
        let app = diamond();
        let record = app.to_record();
        assert_eq!(record.nodes.len(), 5);
        assert_eq!(record.nodes.last().unwrap().hash, *app.hash());

        let json = serde_json::to_string(&record).unwrap();
        let back = ConcreteSpec::from_record(&serde_json::from_str(&json).unwrap()).unwrap();
        assert_eq!(back.hash(), app.hash());

        let foo_zlib = &back.dependency("libfoo").unwrap().spec.dependencies()[0].spec;
        let bar_zlib = &back.dependency("libbar").unwrap().spec.dependencies()[0].spec;
        assert!(Arc::ptr_eq(foo_zlib, bar_zlib));
    }

    #[test]
    fn tampered_record_is_rejected() {
        let mut record = diamond().to_record();
        record.nodes[0].node.version = Version::parse("9.9").unwrap();
        assert!(matches!(
            ConcreteSpec::from_record(&record),
            Err(GraphError::HashMismatch { .. })
        ));

        let mut record = diamond().to_record();
        record.nodes.remove(0);
        assert!(matches!(
            ConcreteSpec::from_record(&record),
            Err(GraphError::MissingNode(_))
        ));
    }
}
