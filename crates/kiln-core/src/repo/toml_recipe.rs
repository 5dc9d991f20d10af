//! Declarative recipes: `packages/<name>/package.toml`.
//!
//! ```toml
//! description = "Compression library"
//! phases = ["configure", "build", "install"]
//!
//! [[versions]]
//! version = "1.3.1"
//! url = "https://zlib.net/zlib-1.3.1.tar.gz"
//! sha256 = "9a93b2b7dfdac77ceba5a558a580e74667dd6fede4585b91eefb60f03b72df23"
//!
//! [[versions]]
//! version = "develop"
//! git = "https://github.com/madler/zlib.git"
//! branch = "develop"
//!
//! [variants.shared]
//! default = true
//! description = "Build shared libraries"
//!
//! [[dependencies]]
//! spec = "cmake@3.20:"
//! type = ["build"]
//!
//! [[conflicts]]
//! spec = "%oneapi"
//! when = "@:1.2"
//! msg = "needs 1.3 for icx"
//!
//! [steps]
//! configure = "./configure --prefix=\"$PREFIX\""
//! build = "make -j\"$JOBS\""
//! install = "make install"
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use kiln_schema::{AbstractSpec, DepTypes, Sha256Digest, VariantValue, Version};
use serde::Deserialize;

use super::recipe::{ConflictDecl, DependencyDecl, Recipe, RecipeDecl, VariantDecl, VersionDecl};
use super::BoxError;
use crate::fetch::{FetchDescriptor, GitRef};
use crate::installer::build_env::{BuildContext, BuildError};

/// Recipe file name inside a package directory.
pub const RECIPE_FILE: &str = "package.toml";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RecipeFile {
    #[serde(default)]
    description: String,
    #[serde(default = "default_phases")]
    phases: Vec<String>,
    #[serde(default)]
    versions: Vec<VersionEntry>,
    #[serde(default)]
    variants: BTreeMap<String, VariantEntry>,
    #[serde(default)]
    dependencies: Vec<DependencyEntry>,
    #[serde(default)]
    conflicts: Vec<ConflictEntry>,
    #[serde(default)]
    steps: BTreeMap<String, String>,
}

fn default_phases() -> Vec<String> {
    vec!["install".to_string()]
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct VersionEntry {
    version: String,
    url: Option<String>,
    sha256: Option<String>,
    git: Option<String>,
    commit: Option<String>,
    tag: Option<String>,
    branch: Option<String>,
    #[serde(default)]
    preferred: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct VariantEntry {
    default: toml::Value,
    #[serde(default)]
    description: String,
    values: Option<Vec<String>>,
    #[serde(default)]
    multi: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DependencyEntry {
    spec: String,
    when: Option<String>,
    #[serde(rename = "type")]
    types: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConflictEntry {
    spec: String,
    when: Option<String>,
    #[serde(default)]
    msg: String,
}

/// A recipe read from `package.toml`. Each phase step is a shell script.
#[derive(Debug, Clone)]
pub struct TomlRecipe {
    decl: RecipeDecl,
    steps: BTreeMap<String, String>,
    path: PathBuf,
}

fn version_decl(entry: VersionEntry) -> Result<VersionDecl, String> {
    let version = Version::parse(&entry.version).map_err(|e| e.to_string())?;
    let fetch = match (entry.url, entry.git) {
        (Some(url), None) => {
            let sha = entry
                .sha256
                .ok_or_else(|| format!("version {version} has a url but no sha256"))?;
            let checksum = Sha256Digest::new(&sha).map_err(|e| e.to_string())?;
            FetchDescriptor::Url { url, checksum }
        }
        (None, Some(url)) => {
            let reference = match (entry.commit, entry.tag, entry.branch) {
                (Some(c), None, None) => GitRef::Commit(c),
                (None, Some(t), None) => GitRef::Tag(t),
                (None, None, Some(b)) => GitRef::Branch(b),
                (None, None, None) => GitRef::Default,
                _ => return Err(format!("version {version} sets more than one of commit, tag, branch")),
            };
            FetchDescriptor::Vcs { url, reference }
        }
        _ => return Err(format!("version {version} needs exactly one of url or git")),
    };
    Ok(VersionDecl {
        version,
        fetch,
        preferred: entry.preferred,
    })
}

fn variant_decl(name: String, entry: VariantEntry) -> Result<VariantDecl, String> {
    let default = match entry.default {
        toml::Value::Boolean(b) => VariantValue::Bool(b),
        toml::Value::String(s) => VariantValue::from_assignment(&s),
        toml::Value::Array(items) => VariantValue::Multi(
            items
                .into_iter()
                .map(|v| v.as_str().map(str::to_string).ok_or("multi-valued defaults must be strings"))
                .collect::<Result<BTreeSet<_>, _>>()?,
        ),
        other => return Err(format!("variant '{name}' has an unsupported default {other}")),
    };
    let decl = VariantDecl {
        name,
        default,
        description: entry.description,
        values: entry.values.map(|v| v.into_iter().collect()),
        multi: entry.multi,
    };
    if let Some(reason) = decl.reject(&decl.default) {
        return Err(format!("default is invalid: {reason}"));
    }
    Ok(decl)
}

fn condition(text: Option<String>) -> Result<Option<AbstractSpec>, String> {
    text.map(|t| AbstractSpec::parse(&t).map_err(|e| e.to_string()))
        .transpose()
}

fn dep_types(names: Option<Vec<String>>) -> Result<DepTypes, String> {
    let Some(names) = names else {
        return Ok(DepTypes::default());
    };
    names.iter().try_fold(DepTypes::NONE, |acc, n| {
        DepTypes::from_name(n)
            .map(|t| acc | t)
            .ok_or_else(|| format!("unknown dependency type '{n}'"))
    })
}

impl TomlRecipe {
    /// Parse `text` as the recipe for `name`.
    ///
    /// # Errors
    ///
    /// Describes the first invalid field.
    pub fn parse(name: &str, text: &str, path: &Path) -> Result<Self, String> {
        let file: RecipeFile = toml::from_str(text).map_err(|e| e.to_string())?;

        for phase in &file.phases {
            if !file.steps.contains_key(phase) {
                return Err(format!("phase '{phase}' has no step"));
            }
        }
        if let Some(extra) = file.steps.keys().find(|k| !file.phases.contains(k)) {
            return Err(format!("step '{extra}' is not a declared phase"));
        }

        let versions = file
            .versions
            .into_iter()
            .map(version_decl)
            .collect::<Result<Vec<_>, _>>()?;
        let variants = file
            .variants
            .into_iter()
            .map(|(n, e)| variant_decl(n, e))
            .collect::<Result<Vec<_>, _>>()?;
        let dependencies = file
            .dependencies
            .into_iter()
            .map(|d| {
                let spec = AbstractSpec::parse(&d.spec).map_err(|e| e.to_string())?;
                if spec.is_anonymous() {
                    return Err(format!("dependency '{}' has no package name", d.spec));
                }
                Ok(DependencyDecl {
                    spec,
                    when: condition(d.when)?,
                    types: dep_types(d.types)?,
                })
            })
            .collect::<Result<Vec<_>, String>>()?;
        let conflicts = file
            .conflicts
            .into_iter()
            .map(|c| {
                Ok(ConflictDecl {
                    spec: AbstractSpec::parse(&c.spec).map_err(|e| e.to_string())?,
                    when: condition(c.when)?,
                    message: c.msg,
                })
            })
            .collect::<Result<Vec<_>, String>>()?;

        Ok(Self {
            decl: RecipeDecl {
                name: name.to_string(),
                description: file.description,
                versions,
                variants,
                dependencies,
                conflicts,
                phases: file.phases,
            },
            steps: file.steps,
            path: path.to_path_buf(),
        })
    }

    /// Read the recipe at `path`.
    ///
    /// # Errors
    ///
    /// Returns read or parse failures, naming the file.
    pub fn load(name: &str, path: &Path) -> Result<Self, BoxError> {
        let text = std::fs::read_to_string(path).map_err(|e| format!("{}: {e}", path.display()))?;
        Ok(Self::parse(name, &text, path).map_err(|e| format!("{}: {e}", path.display()))?)
    }

    /// File the recipe was read from.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Recipe for TomlRecipe {
    fn decl(&self) -> &RecipeDecl {
        &self.decl
    }

    async fn run_phase(&self, phase: &str, ctx: &BuildContext) -> Result<(), BuildError> {
        let script = self
            .steps
            .get(phase)
            .ok_or_else(|| BuildError::UnknownPhase(phase.to_string()))?;
        ctx.run_script(script).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ZLIB: &str = r#"
description = "Compression library"
phases = ["configure", "install"]

[[versions]]
version = "1.3.1"
url = "https://zlib.net/zlib-1.3.1.tar.gz"
sha256 = "9a93b2b7dfdac77ceba5a558a580e74667dd6fede4585b91eefb60f03b72df23"
preferred = true

[[versions]]
version = "develop"
git = "https://github.com/madler/zlib.git"
branch = "develop"

[variants.shared]
default = true
description = "Build shared libraries"

[variants.opt]
default = "O2"
values = ["O2", "O3"]

[[dependencies]]
spec = "cmake@3.20:"
type = ["build"]

[[dependencies]]
spec = "pkgconf"
when = "+shared"

[[conflicts]]
spec = "%oneapi"
when = "@:1.2"
msg = "needs 1.3"

[steps]
configure = "./configure --prefix=\"$PREFIX\""
install = "make install"
"#;

    #[test]
    fn parses_full_recipe() {
        let r = TomlRecipe::parse("zlib", ZLIB, Path::new("zlib/package.toml")).unwrap();
        let d = r.decl();
        assert_eq!(d.phases, ["configure", "install"]);
        assert_eq!(d.versions.len(), 2);
        assert!(d.versions[0].preferred);
        assert!(matches!(
            &d.versions[1].fetch,
            FetchDescriptor::Vcs { reference: GitRef::Branch(b), .. } if b == "develop"
        ));
        assert_eq!(d.dependencies[0].types, DepTypes::BUILD);
        assert_eq!(d.dependencies[1].types, DepTypes::BUILD | DepTypes::LINK);
        assert!(d.dependencies[1].when.is_some());
        assert_eq!(d.variant("opt").unwrap().default, VariantValue::Single("O2".into()));
        assert_eq!(d.conflicts[0].message, "needs 1.3");
    }

    #[test]
    fn rejects_missing_step() {
        let text = "phases = [\"build\", \"install\"]\n[steps]\ninstall = \"true\"\n";
        let err = TomlRecipe::parse("x", text, Path::new("x")).unwrap_err();
        assert!(err.contains("phase 'build' has no step"), "{err}");
    }

    #[test]
    fn rejects_url_without_checksum() {
        let text = "[[versions]]\nversion = \"1.0\"\nurl = \"https://x/a.tgz\"\n[steps]\ninstall = \"true\"\n";
        let err = TomlRecipe::parse("x", text, Path::new("x")).unwrap_err();
        assert!(err.contains("sha256"), "{err}");
    }

    #[test]
    fn rejects_bad_default() {
        let text = "[variants.api]\ndefault = \"v9\"\nvalues = [\"v1\"]\n[steps]\ninstall = \"true\"\n";
        assert!(TomlRecipe::parse("x", text, Path::new("x")).is_err());
    }
}
