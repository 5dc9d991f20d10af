//! Stage directories.

use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

/// Name of the expanded source directory inside a stage.
pub const SOURCE_DIR: &str = "src";
/// Name of the build log inside a stage.
pub const BUILD_LOG: &str = "kiln-build-out.txt";

/// A directory bound to one fetch/build cycle of one node.
#[derive(Debug, Clone)]
pub struct Stage {
    root: PathBuf,
}

impl Stage {
    /// Stage rooted at `root`. Nothing is created yet.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create the stage directory.
    ///
    /// # Errors
    ///
    /// Propagates filesystem errors.
    pub fn create(&self) -> io::Result<()> {
        std::fs::create_dir_all(&self.root)
    }

    /// Stage root.
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Expanded source directory.
    pub fn source_path(&self) -> PathBuf {
        self.root.join(SOURCE_DIR)
    }

    /// Build log written by phase steps.
    pub fn build_log(&self) -> PathBuf {
        self.root.join(BUILD_LOG)
    }

    /// A scratch directory inside the stage, on the same filesystem as the
    /// source path so it can be renamed into place.
    ///
    /// # Errors
    ///
    /// Propagates filesystem errors.
    pub fn scratch(&self, prefix: &str) -> io::Result<TempDir> {
        self.create()?;
        tempfile::Builder::new().prefix(prefix).tempdir_in(&self.root)
    }

    /// Remove every entry except the ones named in `keep`.
    ///
    /// # Errors
    ///
    /// Propagates filesystem errors.
    pub fn clear_except(&self, keep: &[&str]) -> io::Result<()> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        for entry in entries {
            let entry = entry?;
            if keep.iter().any(|k| entry.file_name() == *k) {
                continue;
            }
            if entry.file_type()?.is_dir() {
                std::fs::remove_dir_all(entry.path())?;
            } else {
                std::fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }

    /// Delete the whole stage.
    ///
    /// # Errors
    ///
    /// Propagates filesystem errors other than the stage being absent.
    pub fn destroy(&self) -> io::Result<()> {
        match std::fs::remove_dir_all(&self.root) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}
