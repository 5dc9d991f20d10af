//! CPU microarchitecture model.
//!
//! Targets form a DAG rooted at one generic node per family (`x86_64`,
//! `ppc64`, `ppc64le`, `aarch64`). The table is embedded at compile time and
//! parsed once. A target requires its own features plus every ancestor's.

mod detect;

pub use detect::{HostInfo, detect_host_info};

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::LazyLock;

use kiln_schema::{Version, VersionList};
use serde::Deserialize;
use thiserror::Error;

const TABLE_JSON: &str = include_str!("microarchitectures.json");

static BUILTIN: LazyLock<TargetTable> = LazyLock::new(|| {
    TargetTable::from_json(TABLE_JSON).unwrap_or_else(|e| {
        tracing::error!("embedded microarchitecture table is invalid: {e}");
        TargetTable::default()
    })
});

/// Errors from the microarchitecture model.
#[derive(Debug, Error)]
pub enum MicroarchError {
    /// No target of this name is known.
    #[error("unsupported microarchitecture '{0}'")]
    UnsupportedMicroarchitecture(String),

    /// The target knows the compiler but not this version of it.
    #[error("{compiler}@{version} cannot optimize for {target}")]
    UnsupportedCompilerVersion {
        /// Target name.
        target: String,
        /// Compiler name.
        compiler: String,
        /// Compiler version.
        version: String,
    },

    /// The target table itself is malformed.
    #[error("invalid microarchitecture data: {0}")]
    Data(String),
}

impl MicroarchError {
    /// Taxonomy name of the error.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnsupportedMicroarchitecture(_) | Self::UnsupportedCompilerVersion { .. } => {
                "UnsupportedMicroarchitecture"
            }
            Self::Data(_) => "MicroarchitectureData",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct FlagsEntry {
    versions: VersionList,
    #[serde(default)]
    name: Option<String>,
    flags: String,
}

#[derive(Debug, Deserialize)]
struct RawTarget {
    #[serde(default)]
    from: Vec<String>,
    vendor: String,
    #[serde(default)]
    features: Vec<String>,
    #[serde(default)]
    generation: u32,
    #[serde(default)]
    compilers: BTreeMap<String, Vec<FlagsEntry>>,
}

#[derive(Debug, Deserialize)]
struct RawTable {
    microarchitectures: BTreeMap<String, RawTarget>,
    #[serde(default)]
    linux_flags: BTreeMap<String, String>,
    #[serde(default)]
    darwin_flags: BTreeMap<String, String>,
    #[serde(default)]
    arm_vendors: BTreeMap<String, String>,
}

/// A known CPU target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Microarchitecture {
    name: String,
    vendor: String,
    features: BTreeSet<String>,
    parents: Vec<String>,
    ancestors: Vec<String>,
    family: String,
    generation: u32,
    compilers: BTreeMap<String, Vec<CompilerFlags>>,
}

/// Optimization flags for one compiler version range.
#[derive(Debug, Clone, PartialEq, Eq)]
struct CompilerFlags {
    versions: VersionList,
    flags: String,
}

impl Microarchitecture {
    /// A featureless generic node for a family absent from the table.
    pub fn generic(family: &str) -> Self {
        Self {
            name: family.to_string(),
            vendor: "generic".to_string(),
            features: BTreeSet::new(),
            parents: Vec::new(),
            ancestors: Vec::new(),
            family: family.to_string(),
            generation: 0,
            compilers: BTreeMap::new(),
        }
    }

    /// Target name (`haswell`).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Vendor string (`GenuineIntel`, `generic`).
    pub fn vendor(&self) -> &str {
        &self.vendor
    }

    /// Whether the vendor is `generic`.
    pub fn is_generic(&self) -> bool {
        self.vendor == "generic"
    }

    /// Required features, including those inherited from ancestors.
    pub fn features(&self) -> &BTreeSet<String> {
        &self.features
    }

    /// Direct parents.
    pub fn parents(&self) -> &[String] {
        &self.parents
    }

    /// Every ancestor: parents first, then their ancestors.
    pub fn ancestors(&self) -> &[String] {
        &self.ancestors
    }

    /// POWER generation; zero elsewhere.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Family root name: the parentless ancestor, or this node if it has none.
    pub fn family(&self) -> &str {
        &self.family
    }

    /// Whether `self` appears among `other`'s ancestors.
    pub fn is_ancestor_of(&self, other: &Microarchitecture) -> bool {
        other.ancestors.iter().any(|a| *a == self.name)
    }

    /// Whether `other` appears among `self`'s ancestors.
    pub fn is_strict_descendant_of(&self, other: &Microarchitecture) -> bool {
        other.is_ancestor_of(self)
    }

    /// Compiler flags that optimize for this target.
    ///
    /// Returns an empty string when the table has no entry for the compiler.
    ///
    /// # Errors
    ///
    /// Returns [`MicroarchError::UnsupportedCompilerVersion`] when the
    /// compiler is known but too old for this target.
    pub fn optimization_flags(&self, compiler: &str, version: &Version) -> Result<String, MicroarchError> {
        let Some(entries) = self.compilers.get(compiler) else {
            return Ok(String::new());
        };
        entries
            .iter()
            .find(|e| e.versions.contains(version))
            .map(|e| e.flags.clone())
            .ok_or_else(|| MicroarchError::UnsupportedCompilerVersion {
                target: self.name.clone(),
                compiler: compiler.to_string(),
                version: version.to_string(),
            })
    }

    fn rank(&self) -> (usize, usize) {
        (self.ancestors.len(), self.features.len())
    }
}

/// The static table of known targets plus the host-flag conversion data.
#[derive(Debug, Default)]
pub struct TargetTable {
    targets: BTreeMap<String, Microarchitecture>,
    linux_flags: BTreeMap<String, String>,
    darwin_flags: BTreeMap<String, String>,
    arm_vendors: BTreeMap<String, String>,
}

impl TargetTable {
    /// The embedded table.
    pub fn builtin() -> &'static TargetTable {
        &BUILTIN
    }

    /// Parse a table, resolving ancestors and inherited features.
    ///
    /// # Errors
    ///
    /// Returns [`MicroarchError::Data`] for malformed JSON, unknown parents or
    /// cycles.
    pub fn from_json(json: &str) -> Result<Self, MicroarchError> {
        let raw: RawTable = serde_json::from_str(json).map_err(|e| MicroarchError::Data(e.to_string()))?;

        let mut resolved: HashMap<String, (Vec<String>, BTreeSet<String>)> = HashMap::new();
        for name in raw.microarchitectures.keys() {
            resolve_lineage(name, &raw.microarchitectures, &mut resolved, &mut Vec::new())?;
        }

        let roots: BTreeSet<String> = raw
            .microarchitectures
            .iter()
            .filter(|(_, t)| t.from.is_empty())
            .map(|(name, _)| name.clone())
            .collect();

        let targets = raw
            .microarchitectures
            .into_iter()
            .map(|(name, target)| {
                let (ancestors, features) = resolved.remove(&name).unwrap_or_default();
                let family = ancestors
                    .iter()
                    .find(|a| roots.contains(*a))
                    .unwrap_or(&name)
                    .clone();
                let compilers = target
                    .compilers
                    .into_iter()
                    .map(|(compiler, entries)| {
                        let flags = entries
                            .into_iter()
                            .map(|e| CompilerFlags {
                                versions: e.versions,
                                flags: e.flags.replace("{name}", e.name.as_deref().unwrap_or(&name)),
                            })
                            .collect();
                        (compiler, flags)
                    })
                    .collect();
                let arch = Microarchitecture {
                    name: name.clone(),
                    vendor: target.vendor,
                    features,
                    parents: target.from,
                    ancestors,
                    family,
                    generation: target.generation,
                    compilers,
                };
                (name, arch)
            })
            .collect();

        Ok(Self {
            targets,
            linux_flags: raw.linux_flags,
            darwin_flags: raw.darwin_flags,
            arm_vendors: raw.arm_vendors,
        })
    }

    /// Look up a target by name.
    ///
    /// # Errors
    ///
    /// Returns [`MicroarchError::UnsupportedMicroarchitecture`] if unknown.
    pub fn get(&self, name: &str) -> Result<&Microarchitecture, MicroarchError> {
        self.targets
            .get(name)
            .ok_or_else(|| MicroarchError::UnsupportedMicroarchitecture(name.to_string()))
    }

    /// Every known target.
    pub fn iter(&self) -> impl Iterator<Item = &Microarchitecture> {
        self.targets.values()
    }

    /// Name of an ARM vendor from its `CPU implementer` code.
    pub fn arm_vendor(&self, code: &str) -> Option<&str> {
        self.arm_vendors.get(&code.to_ascii_lowercase()).map(String::as_str)
    }

    pub(crate) fn linux_flags(&self) -> &BTreeMap<String, String> {
        &self.linux_flags
    }

    pub(crate) fn darwin_flags(&self) -> &BTreeMap<String, String> {
        &self.darwin_flags
    }

    /// Whether code built for `target` runs on the described host.
    pub fn compatible(&self, host: &HostInfo, target: &Microarchitecture) -> bool {
        let Ok(root) = self.get(&host.family) else {
            return false;
        };
        let in_family = target.name == root.name || root.is_ancestor_of(target);
        if !in_family {
            return false;
        }
        match host.family.as_str() {
            "x86_64" | "aarch64" => {
                (target.is_generic() || target.vendor.eq_ignore_ascii_case(&host.vendor))
                    && target.features.is_subset(&host.features)
            }
            "ppc64" | "ppc64le" => target.generation <= host.generation,
            _ => false,
        }
    }

    /// The most specific known target the host can run.
    ///
    /// Generic targets pick a baseline; only vendor targets strictly
    /// descending from that baseline may replace it.
    pub fn host_target(&self, host: &HostInfo) -> Microarchitecture {
        let candidates: Vec<&Microarchitecture> =
            self.iter().filter(|t| self.compatible(host, t)).collect();

        let Some(best_generic) = candidates
            .iter()
            .filter(|t| t.is_generic())
            .max_by_key(|t| t.rank())
            .copied()
        else {
            return Microarchitecture::generic(&host.family);
        };

        candidates
            .iter()
            .filter(|t| t.is_strict_descendant_of(best_generic))
            .max_by_key(|t| t.rank())
            .copied()
            .unwrap_or(best_generic)
            .clone()
    }
}

fn resolve_lineage(
    name: &str,
    raw: &BTreeMap<String, RawTarget>,
    resolved: &mut HashMap<String, (Vec<String>, BTreeSet<String>)>,
    visiting: &mut Vec<String>,
) -> Result<(Vec<String>, BTreeSet<String>), MicroarchError> {
    if let Some(done) = resolved.get(name) {
        return Ok(done.clone());
    }
    if visiting.iter().any(|v| v == name) {
        return Err(MicroarchError::Data(format!("cycle through '{name}'")));
    }
    let target = raw
        .get(name)
        .ok_or_else(|| MicroarchError::Data(format!("unknown parent '{name}'")))?;

    visiting.push(name.to_string());
    let mut ancestors: Vec<String> = target.from.clone();
    let mut features: BTreeSet<String> = target.features.iter().cloned().collect();
    for parent in &target.from {
        let (parent_ancestors, parent_features) = resolve_lineage(parent, raw, resolved, visiting)?;
        for a in parent_ancestors {
            if !ancestors.contains(&a) {
                ancestors.push(a);
            }
        }
        features.extend(parent_features);
    }
    visiting.pop();

    resolved.insert(name.to_string(), (ancestors.clone(), features.clone()));
    Ok((ancestors, features))
}

/// Detect the running host's best target from the embedded table.
pub fn host() -> Microarchitecture {
    let table = TargetTable::builtin();
    let info = detect_host_info(table);
    let target = table.host_target(&info);
    tracing::debug!(family = %info.family, vendor = %info.vendor, target = %target.name, "detected host microarchitecture");
    target
}
