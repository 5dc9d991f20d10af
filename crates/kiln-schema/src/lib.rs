//! Spec and dependency-graph model shared by every kiln crate.
//!
//! - [`AbstractSpec`]: what the user asked for (`hdf5@1.14+mpi %gcc ^zlib@1.3`).
//! - [`ConcreteSpec`]: one fully resolved, immutable graph node with a
//!   [`DagHash`] identity.
//! - [`Version`] / [`VersionList`]: version ordering and constraints.

pub mod concrete;
pub mod deptype;
pub mod hash;
pub mod parser;
pub mod spec;
pub mod traverse;
pub mod variant;
pub mod version;

// Re-exports
pub use concrete::{
    ConcreteArch, ConcreteCompiler, ConcreteSpec, DependencyEdge, GraphError, SpecNode, SpecRecord,
};
pub use deptype::DepTypes;
pub use hash::{DagHash, DigestError, Sha256Digest};
pub use parser::SpecError;
pub use spec::{AbstractSpec, ArchConstraint, CompilerConstraint};
pub use traverse::{Order, Traversal};
pub use variant::VariantValue;
pub use version::{Version, VersionError, VersionItem, VersionList};
