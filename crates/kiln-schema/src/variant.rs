//! Variant values: boolean, single-valued and multi-valued build options.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Value of a build variant in a spec.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VariantValue {
    /// `+name` / `~name`.
    Bool(bool),
    /// `name=value`.
    Single(String),
    /// `name=a,b`.
    Multi(BTreeSet<String>),
}

impl VariantValue {
    /// Parse the right-hand side of `name=value`.
    ///
    /// `true`/`false` become booleans, comma lists become multi values.
    pub fn from_assignment(value: &str) -> Self {
        match value {
            "true" => Self::Bool(true),
            "false" => Self::Bool(false),
            v if v.contains(',') => Self::Multi(v.split(',').map(str::to_string).collect()),
            v => Self::Single(v.to_string()),
        }
    }

    /// The values carried, as a set. Booleans yield `"true"` or `"false"`.
    pub fn values(&self) -> BTreeSet<String> {
        match self {
            Self::Bool(b) => BTreeSet::from([b.to_string()]),
            Self::Single(v) => BTreeSet::from([v.clone()]),
            Self::Multi(vs) => vs.clone(),
        }
    }

    /// Whether a concrete value satisfies this requested value.
    ///
    /// A requested multi value is satisfied when all its members are present
    /// in the concrete value; single values compare as one-element sets.
    pub fn satisfied_by(&self, concrete: &VariantValue) -> bool {
        match (self, concrete) {
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Bool(_), _) | (_, Self::Bool(_)) => false,
            (requested, concrete) => requested.values().is_subset(&concrete.values()),
        }
    }

    /// Render this value as it appears in spec text.
    pub(crate) fn fmt_named(&self, name: &str, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(true) => write!(f, "+{name}"),
            Self::Bool(false) => write!(f, "~{name}"),
            Self::Single(v) => write!(f, "{name}={v}"),
            Self::Multi(vs) => {
                write!(f, "{name}=")?;
                for (i, v) in vs.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    f.write_str(v)?;
                }
                Ok(())
            }
        }
    }
}
