//! Configuration scopes and `config.toml` settings.
//!
//! A scope is a directory holding `config.toml` and `compilers.toml`.
//! Scopes are ordered lowest precedence first; a value set in a later scope
//! wins.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Name of the settings file inside a scope.
pub const CONFIG_FILE: &str = "config.toml";

/// A named configuration directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigScope {
    /// Scope name (`site`, `user`, ...).
    pub name: String,
    /// Directory holding the scope's files.
    pub path: PathBuf,
}

impl ConfigScope {
    /// New scope rooted at `path`.
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }

    /// Path of `file` inside the scope.
    pub fn file(&self, file: &str) -> PathBuf {
        self.path.join(file)
    }
}

/// Errors reading or writing configuration files.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File exists but could not be read.
    #[error("failed to read {path}")]
    Read {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
    /// File is not valid TOML for its schema.
    #[error("invalid configuration in {path}")]
    Parse {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: toml::de::Error,
    },
    /// File could not be written.
    #[error("failed to write {path}")]
    Write {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
    /// Value could not be encoded as TOML.
    #[error("failed to encode configuration")]
    Encode(#[from] toml::ser::Error),
    /// No scope with the requested name.
    #[error("unknown configuration scope '{0}'")]
    UnknownScope(String),
}

/// Read and decode a TOML file; `None` when it does not exist.
///
/// # Errors
///
/// Returns [`ConfigError::Read`] or [`ConfigError::Parse`].
pub fn read_toml<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, ConfigError> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    toml::from_str(&text).map(Some).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Encode `value` and write it to `path` atomically.
///
/// # Errors
///
/// Returns [`ConfigError::Encode`] or [`ConfigError::Write`].
pub fn write_toml<T: Serialize>(path: &Path, value: &T) -> Result<(), ConfigError> {
    let text = toml::to_string_pretty(value)?;
    let write_err = |source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    };
    let parent = path.parent().unwrap_or(Path::new("."));
    std::fs::create_dir_all(parent).map_err(write_err)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(write_err)?;
    io::Write::write_all(&mut tmp, text.as_bytes()).map_err(write_err)?;
    tmp.persist(path).map_err(|e| write_err(e.error))?;
    Ok(())
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    install: InstallTable,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct InstallTable {
    jobs: Option<usize>,
    build_jobs: Option<usize>,
    phase_timeout_secs: Option<u64>,
    fetch_timeout_secs: Option<u64>,
    fetch_retries: Option<u32>,
    lock_timeout_secs: Option<u64>,
    keep_stage: Option<bool>,
}

/// Effective `[install]` settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallSettings {
    /// Nodes built concurrently.
    pub jobs: usize,
    /// Parallelism exported to builds as `JOBS`.
    pub build_jobs: usize,
    /// Limit for each phase step.
    pub phase_timeout: Option<Duration>,
    /// Limit for each fetch subprocess or download.
    pub fetch_timeout: Duration,
    /// Retries for transient network errors.
    pub fetch_retries: u32,
    /// Bounded wait for database and prefix locks.
    pub lock_timeout: Duration,
    /// Keep stage directories after success.
    pub keep_stage: bool,
}

impl Default for InstallSettings {
    fn default() -> Self {
        let cpus = num_cpus::get();
        Self {
            jobs: cpus.clamp(1, 4),
            build_jobs: cpus.max(1),
            phase_timeout: None,
            fetch_timeout: Duration::from_secs(300),
            fetch_retries: 3,
            lock_timeout: Duration::from_secs(120),
            keep_stage: false,
        }
    }
}

impl InstallSettings {
    /// Merge `config.toml` from every scope over the defaults.
    ///
    /// # Errors
    ///
    /// Returns the first unreadable or invalid file.
    pub fn load(scopes: &[ConfigScope]) -> Result<Self, ConfigError> {
        let mut settings = Self::default();
        for scope in scopes {
            if let Some(file) = read_toml::<ConfigFile>(&scope.file(CONFIG_FILE))? {
                settings.apply(file.install);
            }
        }
        Ok(settings)
    }

    fn apply(&mut self, t: InstallTable) {
        if let Some(jobs) = t.jobs {
            self.jobs = jobs.max(1);
        }
        if let Some(jobs) = t.build_jobs {
            self.build_jobs = jobs.max(1);
        }
        if let Some(secs) = t.phase_timeout_secs {
            self.phase_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(secs) = t.fetch_timeout_secs {
            self.fetch_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = t.fetch_retries {
            self.fetch_retries = n;
        }
        if let Some(secs) = t.lock_timeout_secs {
            self.lock_timeout = Duration::from_secs(secs);
        }
        if let Some(keep) = t.keep_stage {
            self.keep_stage = keep;
        }
    }
}
