//! Install prefix layout.
//!
//! `<root>/<platform>-<os>-<target>/<compiler>-<version>/<name>-<version>-<hash32>`,
//! with the node's spec written to `<prefix>/.kiln/spec.json`.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use kiln_schema::{ConcreteSpec, SpecRecord};

/// Metadata directory inside each prefix.
pub const METADATA_DIR: &str = ".kiln";
/// Serialized spec inside [`METADATA_DIR`].
pub const SPEC_FILE: &str = "spec.json";

/// Maps concrete specs to install prefixes under one root.
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    /// Layout rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Install root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Prefix for `spec`.
    pub fn prefix(&self, spec: &ConcreteSpec) -> PathBuf {
        let arch = spec.arch();
        let compiler = spec.compiler();
        self.root
            .join(format!("{}-{}-{}", arch.platform, arch.os, arch.target))
            .join(format!("{}-{}", compiler.name, compiler.version))
            .join(format!(
                "{}-{}-{}",
                spec.name(),
                spec.version(),
                spec.hash().prefix_component()
            ))
    }

    /// Write `.kiln/spec.json` into `prefix`.
    ///
    /// # Errors
    ///
    /// Returns filesystem or encoding failures.
    pub fn write_metadata(&self, spec: &Arc<ConcreteSpec>, prefix: &Path) -> io::Result<()> {
        let dir = prefix.join(METADATA_DIR);
        std::fs::create_dir_all(&dir)?;
        let json = serde_json::to_vec_pretty(&spec.to_record()).map_err(io::Error::other)?;
        std::fs::write(dir.join(SPEC_FILE), json)
    }

    /// Read the spec stored in `prefix`.
    ///
    /// # Errors
    ///
    /// Returns filesystem, decoding or graph failures.
    pub fn read_metadata(&self, prefix: &Path) -> io::Result<Arc<ConcreteSpec>> {
        let bytes = std::fs::read(prefix.join(METADATA_DIR).join(SPEC_FILE))?;
        let record: SpecRecord = serde_json::from_slice(&bytes).map_err(io::Error::other)?;
        ConcreteSpec::from_record(&record).map_err(io::Error::other)
    }

    /// Delete `prefix` and any parents left empty, stopping at the root.
    ///
    /// # Errors
    ///
    /// Returns failures removing the prefix itself; a missing prefix is fine.
    pub fn remove_prefix(&self, prefix: &Path) -> io::Result<()> {
        match std::fs::remove_dir_all(prefix) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        let mut dir = prefix.parent();
        while let Some(d) = dir {
            if d == self.root || !d.starts_with(&self.root) {
                break;
            }
            // Fails on non-empty directories, which ends the walk.
            if std::fs::remove_dir(d).is_err() {
                break;
            }
            dir = d.parent();
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::installer::build_env::tests::node;

    #[test]
    fn prefix_shape() {
        let spec = ConcreteSpec::new(node("zlib", "1.3.1"), Vec::new()).unwrap();
        let layout = Layout::new("/opt/kiln");
        let prefix = layout.prefix(&spec);
        let expected = format!(
            "/opt/kiln/linux-ubuntu22.04-x86_64/gcc-12.3.0/zlib-1.3.1-{}",
            spec.hash().prefix_component()
        );
        assert_eq!(prefix, PathBuf::from(expected));
    }

    #[test]
    fn remove_prunes_empty_parents_only() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let a = ConcreteSpec::new(node("zlib", "1.3.1"), Vec::new()).unwrap();
        let b = ConcreteSpec::new(node("bzip2", "1.0.8"), Vec::new()).unwrap();
        let (pa, pb) = (layout.prefix(&a), layout.prefix(&b));
        std::fs::create_dir_all(&pa).unwrap();
        std::fs::create_dir_all(&pb).unwrap();
        layout.write_metadata(&a, &pa).unwrap();
        assert_eq!(layout.read_metadata(&pa).unwrap().hash(), a.hash());

        layout.remove_prefix(&pa).unwrap();
        assert!(!pa.exists());
        assert!(pb.exists());
        layout.remove_prefix(&pb).unwrap();
        assert!(!dir.path().join("linux-ubuntu22.04-x86_64").exists());
        assert!(dir.path().exists());
        layout.remove_prefix(&pb).unwrap();
    }
}
