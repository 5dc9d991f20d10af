//! Dependency edge types.

use std::fmt;
use std::ops::BitOr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Set of edge types carried by a dependency: a subset of {build, link, run}.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DepTypes(u8);

const NAMES: [(&str, u8); 3] = [("build", 1), ("link", 2), ("run", 4)];

impl DepTypes {
    /// No edge types.
    pub const NONE: Self = Self(0);
    /// Needed while building.
    pub const BUILD: Self = Self(1);
    /// Linked into the dependent.
    pub const LINK: Self = Self(2);
    /// Needed at run time.
    pub const RUN: Self = Self(4);
    /// All edge types.
    pub const ALL: Self = Self(7);

    /// Union of two sets.
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Whether every type in `other` is present.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether the sets share any type.
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Whether the set is empty.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Type names in canonical order.
    pub fn names(self) -> Vec<&'static str> {
        NAMES
            .iter()
            .filter(|(_, bit)| self.0 & bit != 0)
            .map(|(name, _)| *name)
            .collect()
    }

    /// Parse a single type name.
    pub fn from_name(name: &str) -> Option<Self> {
        NAMES
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, bit)| Self(*bit))
    }
}

impl Default for DepTypes {
    /// Recipes that do not say otherwise depend at build and link time.
    fn default() -> Self {
        Self::BUILD | Self::LINK
    }
}

impl BitOr for DepTypes {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl fmt::Debug for DepTypes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DepTypes({self})")
    }
}

impl fmt::Display for DepTypes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.names().join(","))
    }
}

impl Serialize for DepTypes {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.names().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for DepTypes {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let names = Vec::<String>::deserialize(deserializer)?;
        names.iter().try_fold(Self::NONE, |acc, name| {
            Self::from_name(name)
                .map(|t| acc | t)
                .ok_or_else(|| serde::de::Error::custom(format!("unknown dependency type '{name}'")))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_operations() {
        let bl = DepTypes::default();
        assert!(bl.contains(DepTypes::BUILD));
        assert!(bl.intersects(DepTypes::LINK | DepTypes::RUN));
        assert!(!bl.intersects(DepTypes::RUN));
        assert_eq!(bl.to_string(), "build,link");
    }

    #[test]
    fn serde_as_name_list() {
        let json = serde_json::to_string(&(DepTypes::RUN | DepTypes::BUILD)).unwrap();
        assert_eq!(json, r#"["build","run"]"#);
        let back: DepTypes = serde_json::from_str(&json).unwrap();
        assert_eq!(back, DepTypes::BUILD | DepTypes::RUN);
        assert!(serde_json::from_str::<DepTypes>(r#"["test"]"#).is_err());
    }
}
