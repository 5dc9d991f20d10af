//! Filesystem layout and environment overrides.
//!
//! ```text
//! $KILN_HOME (~/.kiln)
//! ├── opt/              # install prefixes
//! │   └── .kiln-db/     # install database + locks
//! ├── var/stage/        # staging directories ($KILN_STAGE_ROOT)
//! ├── repos/builtin/    # default recipe repository ($KILN_REPO_PATH)
//! └── etc/              # site configuration scope ($KILN_CONFIG_PATH)
//! ```

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::config::ConfigScope;

/// Root of all kiln state.
pub const HOME_ENV: &str = "KILN_HOME";
/// Colon-separated repository roots, highest priority first.
pub const REPO_PATH_ENV: &str = "KILN_REPO_PATH";
/// Colon-separated configuration scopes (`name=dir` or `dir`), lowest precedence first.
pub const CONFIG_PATH_ENV: &str = "KILN_CONFIG_PATH";
/// Staging root override.
pub const STAGE_ROOT_ENV: &str = "KILN_STAGE_ROOT";

/// Errors resolving the layout.
#[derive(Debug, Error)]
pub enum PathsError {
    /// Neither `KILN_HOME` nor a home directory is available.
    #[error("could not determine home directory; set {HOME_ENV}")]
    NoHome,
}

/// Resolved locations used by one kiln process.
#[derive(Debug, Clone)]
pub struct KilnPaths {
    /// Root of kiln state.
    pub home: PathBuf,
    /// Parent of every install prefix.
    pub install_root: PathBuf,
    /// Install database directory.
    pub db_dir: PathBuf,
    /// Parent of staging directories.
    pub stage_root: PathBuf,
    /// Recipe repositories in search order.
    pub repo_roots: Vec<PathBuf>,
    /// Configuration scopes, lowest precedence first.
    pub scopes: Vec<ConfigScope>,
}

impl KilnPaths {
    /// Default layout beneath `home`, with `site` and `user` scopes inside it.
    pub fn under(home: impl Into<PathBuf>) -> Self {
        let home = home.into();
        let install_root = home.join("opt");
        Self {
            db_dir: install_root.join(".kiln-db"),
            install_root,
            stage_root: home.join("var").join("stage"),
            repo_roots: vec![home.join("repos").join("builtin")],
            scopes: vec![
                ConfigScope::new("site", home.join("etc")),
                ConfigScope::new("user", home.join("user")),
            ],
            home,
        }
    }

    /// Resolve from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`PathsError::NoHome`] when no home directory can be found.
    pub fn from_env() -> Result<Self, PathsError> {
        Self::from_lookup(|key| std::env::var_os(key))
    }

    /// Resolve using `lookup` in place of the environment.
    ///
    /// # Errors
    ///
    /// Returns [`PathsError::NoHome`] when no home directory can be found.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<OsString>) -> Result<Self, PathsError> {
        let explicit_home = lookup(HOME_ENV).map(PathBuf::from);
        let home = match &explicit_home {
            Some(home) => home.clone(),
            None => dirs::home_dir().ok_or(PathsError::NoHome)?.join(".kiln"),
        };
        let mut paths = Self::under(&home);

        // Outside an explicit KILN_HOME the user scope follows the platform
        // config directory.
        if explicit_home.is_none() {
            if let Some(config) = dirs::config_dir() {
                paths.scopes[1] = ConfigScope::new("user", config.join("kiln"));
            }
        }

        if let Some(stage) = lookup(STAGE_ROOT_ENV).filter(|v| !v.is_empty()) {
            paths.stage_root = PathBuf::from(stage);
        }
        if let Some(repos) = lookup(REPO_PATH_ENV).filter(|v| !v.is_empty()) {
            paths.repo_roots = std::env::split_paths(&repos).collect();
        }
        if let Some(scopes) = lookup(CONFIG_PATH_ENV).filter(|v| !v.is_empty()) {
            paths.scopes = parse_scope_list(&scopes.to_string_lossy());
        }
        Ok(paths)
    }

    /// Path of the install database file.
    pub fn db_path(&self) -> PathBuf {
        self.db_dir.join("index.sqlite")
    }

    /// Directory holding per-prefix lock files.
    pub fn lock_dir(&self) -> PathBuf {
        self.db_dir.join("locks")
    }

    /// Scope named `name`, if configured.
    pub fn scope(&self, name: &str) -> Option<&ConfigScope> {
        self.scopes.iter().find(|s| s.name == name)
    }
}

fn parse_scope_list(value: &str) -> Vec<ConfigScope> {
    value
        .split(':')
        .filter(|item| !item.is_empty())
        .enumerate()
        .map(|(i, item)| match item.split_once('=') {
            Some((name, dir)) => ConfigScope::new(name, dir),
            None => ConfigScope::new(format!("scope{i}"), item),
        })
        .collect()
}

/// Extract the filename from a URL.
pub fn filename_from_url(url: &str) -> &str {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.split('/').next_back().unwrap_or("")
}

/// Whether `path` is an existing, non-empty directory.
pub fn is_populated_dir(path: &Path) -> bool {
    std::fs::read_dir(path).is_ok_and(|mut entries| entries.next().is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<OsString> {
        let map: HashMap<String, OsString> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), OsString::from(v)))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn layout_under_explicit_home() {
        let paths = KilnPaths::from_lookup(lookup(&[(HOME_ENV, "/srv/kiln")])).unwrap();
        assert_eq!(paths.install_root, PathBuf::from("/srv/kiln/opt"));
        assert_eq!(paths.db_path(), PathBuf::from("/srv/kiln/opt/.kiln-db/index.sqlite"));
        assert_eq!(paths.stage_root, PathBuf::from("/srv/kiln/var/stage"));
        assert_eq!(paths.repo_roots, vec![PathBuf::from("/srv/kiln/repos/builtin")]);
        assert_eq!(paths.scope("user").unwrap().path, PathBuf::from("/srv/kiln/user"));
    }

    #[test]
    fn overrides() {
        let paths = KilnPaths::from_lookup(lookup(&[
            (HOME_ENV, "/h"),
            (REPO_PATH_ENV, "/a:/b"),
            (CONFIG_PATH_ENV, "defaults=/etc/kiln:/home/me/.kiln-conf"),
            (STAGE_ROOT_ENV, "/tmp/stage"),
        ]))
        .unwrap();
        assert_eq!(paths.repo_roots, vec![PathBuf::from("/a"), PathBuf::from("/b")]);
        assert_eq!(paths.stage_root, PathBuf::from("/tmp/stage"));
        let names: Vec<&str> = paths.scopes.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["defaults", "scope1"]);
    }

    #[test]
    fn url_filenames() {
        assert_eq!(filename_from_url("https://zlib.net/zlib-1.3.tar.gz"), "zlib-1.3.tar.gz");
        assert_eq!(filename_from_url("https://x.org/dl/pkg.zip?raw=1"), "pkg.zip");
        assert_eq!(filename_from_url(""), "");
    }
}
