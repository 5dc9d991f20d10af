//! The recipe contract.
//!
//! A recipe declares versions, variants, dependencies, conflicts and ordered
//! phases, and runs one step per phase against a [`BuildContext`].

use std::collections::BTreeSet;
use std::fmt;

use async_trait::async_trait;
use kiln_schema::{AbstractSpec, DepTypes, SpecNode, VariantValue, Version};

use crate::fetch::FetchDescriptor;
use crate::installer::build_env::{BuildContext, BuildError};

/// One declared version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionDecl {
    /// The version.
    pub version: Version,
    /// Where its source comes from.
    pub fetch: FetchDescriptor,
    /// Chosen over higher versions when nothing else constrains.
    pub preferred: bool,
}

/// One declared variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantDecl {
    /// Variant name.
    pub name: String,
    /// Value used when the request does not set one.
    pub default: VariantValue,
    /// Help text.
    pub description: String,
    /// Allowed values; `None` for boolean or free-form variants.
    pub values: Option<BTreeSet<String>>,
    /// Whether several values may be set at once.
    pub multi: bool,
}

impl VariantDecl {
    /// Why `value` is not acceptable, if it isn't.
    pub fn reject(&self, value: &VariantValue) -> Option<String> {
        match (&self.default, value) {
            (VariantValue::Bool(_), VariantValue::Bool(_)) => None,
            (VariantValue::Bool(_), _) => Some(format!("variant '{}' is boolean", self.name)),
            (_, VariantValue::Bool(_)) => Some(format!("variant '{}' takes a value", self.name)),
            (_, VariantValue::Multi(vs)) if !self.multi && vs.len() > 1 => {
                Some(format!("variant '{}' accepts a single value", self.name))
            }
            (_, v) => {
                let allowed = self.values.as_ref()?;
                let bad: Vec<String> = v.values().difference(allowed).cloned().collect();
                (!bad.is_empty()).then(|| {
                    format!(
                        "variant '{}' does not allow {}; expected one of {}",
                        self.name,
                        bad.join(","),
                        allowed.iter().cloned().collect::<Vec<_>>().join(",")
                    )
                })
            }
        }
    }
}

/// A declared dependency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyDecl {
    /// Constraint on the dependency.
    pub spec: AbstractSpec,
    /// Anonymous condition on the dependent; `None` means always.
    pub when: Option<AbstractSpec>,
    /// Edge types.
    pub types: DepTypes,
}

/// A declared conflict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictDecl {
    /// Spec the node must not satisfy.
    pub spec: AbstractSpec,
    /// Condition under which the conflict applies; `None` means always.
    pub when: Option<AbstractSpec>,
    /// Explanation shown when it matches.
    pub message: String,
}

/// Static description of a package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipeDecl {
    /// Package name.
    pub name: String,
    /// One-line summary.
    pub description: String,
    /// Versions in declaration order.
    pub versions: Vec<VersionDecl>,
    /// Variants.
    pub variants: Vec<VariantDecl>,
    /// Dependencies.
    pub dependencies: Vec<DependencyDecl>,
    /// Conflicts.
    pub conflicts: Vec<ConflictDecl>,
    /// Phase names, run in order.
    pub phases: Vec<String>,
}

impl RecipeDecl {
    /// Declaration of `version`, if any.
    pub fn version(&self, version: &Version) -> Option<&VersionDecl> {
        self.versions.iter().find(|v| &v.version == version)
    }

    /// Declaration of variant `name`, if any.
    pub fn variant(&self, name: &str) -> Option<&VariantDecl> {
        self.variants.iter().find(|v| v.name == name)
    }

    /// Dependencies whose condition holds for `node`.
    pub fn active_dependencies<'a>(&'a self, node: &'a SpecNode) -> impl Iterator<Item = &'a DependencyDecl> {
        self.dependencies
            .iter()
            .filter(move |d| d.when.as_ref().is_none_or(|w| node.satisfies(w)))
    }

    /// Message of the first conflict matching `node`.
    pub fn conflict(&self, node: &SpecNode) -> Option<&str> {
        self.conflicts
            .iter()
            .find(|c| node.satisfies(&c.spec) && c.when.as_ref().is_none_or(|w| node.satisfies(w)))
            .map(|c| c.message.as_str())
    }
}

/// A package recipe.
#[async_trait]
pub trait Recipe: Send + Sync + fmt::Debug {
    /// Static declaration.
    fn decl(&self) -> &RecipeDecl;

    /// Run the step for `phase`.
    async fn run_phase(&self, phase: &str, ctx: &BuildContext) -> Result<(), BuildError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pick(name: &str, default: &str, values: &[&str], multi: bool) -> VariantDecl {
        VariantDecl {
            name: name.into(),
            default: VariantValue::from_assignment(default),
            description: String::new(),
            values: Some(values.iter().map(|s| (*s).to_string()).collect()),
            multi,
        }
    }

    #[test]
    fn variant_validation() {
        let api = pick("api", "v2", &["v1", "v2"], false);
        assert!(api.reject(&VariantValue::Single("v1".into())).is_none());
        assert!(api.reject(&VariantValue::Single("v3".into())).is_some());
        assert!(api.reject(&VariantValue::from_assignment("v1,v2")).is_some());
        assert!(api.reject(&VariantValue::Bool(true)).is_some());

        let langs = pick("langs", "c", &["c", "cxx", "fortran"], true);
        assert!(langs.reject(&VariantValue::from_assignment("c,fortran")).is_none());

        let shared = VariantDecl {
            name: "shared".into(),
            default: VariantValue::Bool(true),
            description: String::new(),
            values: None,
            multi: false,
        };
        assert!(shared.reject(&VariantValue::Bool(false)).is_none());
        assert!(shared.reject(&VariantValue::Single("yes".into())).is_some());
    }
}
