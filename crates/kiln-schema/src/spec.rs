//! Abstract (user-facing, partially constrained) specs.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::parser::{self, SpecError};
use crate::variant::VariantValue;
use crate::version::VersionList;

/// `%name@versions`: a constraint on the compiler.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CompilerConstraint {
    /// Toolchain name (`gcc`, `clang`, ...).
    pub name: String,
    /// Acceptable versions.
    pub versions: VersionList,
}

impl CompilerConstraint {
    /// Constraint on a toolchain name alone.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            versions: VersionList::any(),
        }
    }
}

impl fmt::Display for CompilerConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if !self.versions.is_any() {
            write!(f, "@{}", self.versions)?;
        }
        Ok(())
    }
}

impl FromStr for CompilerConstraint {
    type Err = SpecError;

    /// Parse `gcc@9:` (the `%` is optional).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.strip_prefix('%').unwrap_or(s);
        let spec = parser::parse(&format!("%{text}"))?;
        spec.compiler
            .ok_or_else(|| SpecError::syntax(s, 0, "expected a compiler"))
    }
}

/// Architecture constraint: any of platform, os and target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct ArchConstraint {
    /// `linux`, `darwin`, ...
    pub platform: Option<String>,
    /// `ubuntu22.04`, `macos14`, ...
    pub os: Option<String>,
    /// Microarchitecture name.
    pub target: Option<String>,
}

impl ArchConstraint {
    /// Whether nothing is constrained.
    pub fn is_empty(&self) -> bool {
        self.platform.is_none() && self.os.is_none() && self.target.is_none()
    }
}

/// A requested spec: a package name with optional constraints.
///
/// Built only by the parser or the `with_*` constructors, so an
/// `AbstractSpec` never changes after creation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AbstractSpec {
    pub(crate) name: Option<String>,
    pub(crate) namespace: Option<String>,
    pub(crate) versions: VersionList,
    pub(crate) variants: BTreeMap<String, VariantValue>,
    pub(crate) compiler: Option<CompilerConstraint>,
    pub(crate) arch: ArchConstraint,
    pub(crate) dependencies: Vec<AbstractSpec>,
}

impl AbstractSpec {
    /// Parse spec text.
    ///
    /// # Errors
    ///
    /// Returns [`SpecError::InvalidSpecSyntax`] on malformed input.
    pub fn parse(text: &str) -> Result<Self, SpecError> {
        parser::parse(text)
    }

    /// An unconstrained spec for `name`.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Copy with a version constraint.
    pub fn with_versions(mut self, versions: VersionList) -> Self {
        self.versions = versions;
        self
    }

    /// Copy with a variant set.
    pub fn with_variant(mut self, name: impl Into<String>, value: VariantValue) -> Self {
        self.variants.insert(name.into(), value);
        self
    }

    /// Copy with a compiler constraint.
    pub fn with_compiler(mut self, compiler: CompilerConstraint) -> Self {
        self.compiler = Some(compiler);
        self
    }

    /// Copy with a dependency constraint appended.
    pub fn with_dependency(mut self, dep: AbstractSpec) -> Self {
        self.dependencies.push(dep);
        self
    }

    /// Package name; `None` for anonymous condition specs such as `+shared`.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Repository namespace hint (`builtin` in `builtin.zlib`).
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// Whether no package name was given.
    pub fn is_anonymous(&self) -> bool {
        self.name.is_none()
    }

    /// Version constraint.
    pub fn versions(&self) -> &VersionList {
        &self.versions
    }

    /// Requested variants.
    pub fn variants(&self) -> &BTreeMap<String, VariantValue> {
        &self.variants
    }

    /// Compiler constraint, if any.
    pub fn compiler(&self) -> Option<&CompilerConstraint> {
        self.compiler.as_ref()
    }

    /// Architecture constraint.
    pub fn arch(&self) -> &ArchConstraint {
        &self.arch
    }

    /// `^dep` constraints, in order.
    pub fn dependencies(&self) -> &[AbstractSpec] {
        &self.dependencies
    }

    /// Constraint for the named dependency, if one was given.
    pub fn dependency(&self, name: &str) -> Option<&AbstractSpec> {
        self.dependencies.iter().find(|d| d.name() == Some(name))
    }

    /// The root node alone, without `^` constraints.
    pub fn without_dependencies(&self) -> Self {
        Self {
            dependencies: Vec::new(),
            ..self.clone()
        }
    }

    fn fmt_node(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut words: Vec<String> = Vec::new();

        let mut head = String::new();
        if let Some(ns) = &self.namespace {
            head.push_str(ns);
            head.push('.');
        }
        if let Some(name) = &self.name {
            head.push_str(name);
        }
        if !self.versions.is_any() {
            head.push('@');
            head.push_str(&self.versions.to_string());
        }
        for (name, value) in &self.variants {
            if matches!(value, VariantValue::Bool(_)) {
                head.push_str(&Named(name, value).to_string());
            }
        }
        if !head.is_empty() {
            words.push(head);
        }

        for (name, value) in &self.variants {
            if !matches!(value, VariantValue::Bool(_)) {
                words.push(Named(name, value).to_string());
            }
        }
        if let Some(compiler) = &self.compiler {
            words.push(format!("%{compiler}"));
        }
        match (&self.arch.platform, &self.arch.os, &self.arch.target) {
            (Some(p), Some(o), Some(t)) => words.push(format!("arch={p}-{o}-{t}")),
            (p, o, t) => {
                if let Some(p) = p {
                    words.push(format!("platform={p}"));
                }
                if let Some(o) = o {
                    words.push(format!("os={o}"));
                }
                if let Some(t) = t {
                    words.push(format!("target={t}"));
                }
            }
        }
        f.write_str(&words.join(" "))
    }
}

struct Named<'a>(&'a str, &'a VariantValue);

impl fmt::Display for Named<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.1.fmt_named(self.0, f)
    }
}

impl fmt::Display for AbstractSpec {
    /// Canonical text; parsing it yields an equal spec.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_node(f)?;
        for dep in &self.dependencies {
            write!(f, " ^")?;
            dep.fmt_node(f)?;
        }
        Ok(())
    }
}

impl FromStr for AbstractSpec {
    type Err = SpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for AbstractSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for AbstractSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::Version;

    #[test]
    fn display_is_canonical() {
        let spec = AbstractSpec::parse("zlib ~pic+shared@1.2: %gcc@11 cflags=-O2").unwrap();
        assert_eq!(spec.to_string(), "zlib@1.2:~pic+shared cflags=-O2 %gcc@11");
    }

    #[test]
    fn builders_compose() {
        let spec = AbstractSpec::named("cmake")
            .with_versions(VersionList::exact(Version::parse("3.27.1").unwrap()))
            .with_variant("ncurses", VariantValue::Bool(false))
            .with_compiler(CompilerConstraint::named("clang"))
            .with_dependency(AbstractSpec::named("openssl"));
        assert_eq!(spec.to_string(), "cmake@=3.27.1~ncurses %clang ^openssl");
        assert_eq!(AbstractSpec::parse(&spec.to_string()).unwrap(), spec);
    }

    #[test]
    fn compiler_constraint_from_str() {
        let c: CompilerConstraint = "%gcc@9:12".parse().unwrap();
        assert_eq!(c.name, "gcc");
        assert!(c.versions.contains(&Version::parse("11.4.0").unwrap()));
        let bare: CompilerConstraint = "clang".parse().unwrap();
        assert!(bare.versions.is_any());
    }

    #[test]
    fn serde_uses_text_form() {
        let spec = AbstractSpec::parse("builtin.zlib@1.3 target=haswell").unwrap();
        let json = serde_json::to_string(&spec).unwrap();
        assert_eq!(json, "\"builtin.zlib@1.3 target=haswell\"");
        let back: AbstractSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back, spec);
    }
}
