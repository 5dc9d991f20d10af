//! Versions and version constraint lists.
//!
//! A [`Version`] is a dotted sequence of numeric and alphabetic segments
//! (`1.2.13`, `2.0rc1`, `develop`). A [`VersionList`] is the `@...` part of a
//! spec: a comma-separated union of exact versions (`=1.2`), prefixes (`1.2`,
//! matching `1.2` and `1.2.x`) and inclusive ranges (`1.2:1.4`, `:1.4`,
//! `1.2:`).

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Version names that sort above every numbered version, in descending order.
pub const INFINITY_VERSIONS: &[&str] = &["develop", "main", "master", "head", "trunk", "stable"];

/// Error produced when a version or version list cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid version '{input}': {reason}")]
pub struct VersionError {
    /// The offending text.
    pub input: String,
    /// What was wrong with it.
    pub reason: String,
}

impl VersionError {
    fn new(input: &str, reason: impl Into<String>) -> Self {
        Self {
            input: input.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Segment {
    Num(u64),
    Str(String),
}

impl Ord for Segment {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Num(a), Self::Num(b)) => a.cmp(b),
            (Self::Str(a), Self::Str(b)) => a.cmp(b),
            (Self::Num(_), Self::Str(_)) => Ordering::Greater,
            (Self::Str(_), Self::Num(_)) => Ordering::Less,
        }
    }
}

impl PartialOrd for Segment {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A single package version.
///
/// Equality, ordering and hashing use the parsed segments, so `1.2` and
/// `1-2` compare equal; `Display` reproduces the original text.
#[derive(Debug, Clone)]
pub struct Version {
    text: String,
    segments: Vec<Segment>,
}

impl Version {
    /// Parse a version string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is empty, does not start with an
    /// alphanumeric character, or contains characters other than
    /// alphanumerics, `.`, `-` and `_`.
    pub fn parse(s: &str) -> Result<Self, VersionError> {
        if s.is_empty() {
            return Err(VersionError::new(s, "empty version"));
        }
        if !s.starts_with(|c: char| c.is_ascii_alphanumeric()) {
            return Err(VersionError::new(s, "must start with a letter or digit"));
        }

        let mut segments = Vec::new();
        let mut current = String::new();
        let mut current_is_digit = false;

        let mut flush = |current: &mut String, is_digit: bool| -> Result<(), VersionError> {
            if current.is_empty() {
                return Ok(());
            }
            let seg = if is_digit {
                let n = current
                    .parse::<u64>()
                    .map_err(|_| VersionError::new(s, "numeric segment out of range"))?;
                Segment::Num(n)
            } else {
                Segment::Str(current.clone())
            };
            segments.push(seg);
            current.clear();
            Ok(())
        };

        for c in s.chars() {
            match c {
                '.' | '-' | '_' => flush(&mut current, current_is_digit)?,
                c if c.is_ascii_alphanumeric() => {
                    let is_digit = c.is_ascii_digit();
                    if !current.is_empty() && is_digit != current_is_digit {
                        flush(&mut current, current_is_digit)?;
                    }
                    current_is_digit = is_digit;
                    current.push(c);
                }
                other => {
                    return Err(VersionError::new(
                        s,
                        format!("unexpected character '{other}'"),
                    ));
                }
            }
        }
        flush(&mut current, current_is_digit)?;

        Ok(Self {
            text: s.to_string(),
            segments,
        })
    }

    /// The version as written.
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Whether this is a branch-like version (`develop`, `main`, ...) that
    /// sorts above every numbered release.
    pub fn is_infinity(&self) -> bool {
        self.infinity_rank().is_some()
    }

    fn infinity_rank(&self) -> Option<usize> {
        INFINITY_VERSIONS.iter().position(|v| *v == self.text)
    }

    /// Whether every segment of `self` is a leading segment of `other`.
    ///
    /// `1.2` is a prefix of `1.2` and `1.2.13`, but not of `1.20`.
    pub fn is_prefix_of(&self, other: &Version) -> bool {
        self.segments.len() <= other.segments.len()
            && self
                .segments
                .iter()
                .zip(&other.segments)
                .all(|(a, b)| a == b)
    }

    /// Numeric major component, if the version starts with a number.
    pub fn major(&self) -> Option<u64> {
        match self.segments.first() {
            Some(Segment::Num(n)) => Some(*n),
            _ => None,
        }
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.segments == other.segments
    }
}

impl Eq for Version {}

impl Hash for Version {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.segments.hash(state);
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.infinity_rank(), other.infinity_rank()) {
            // Lower index in INFINITY_VERSIONS means newer.
            (Some(a), Some(b)) => b.cmp(&a),
            (Some(_), None) => Ordering::Greater,
            (None, Some(_)) => Ordering::Less,
            (None, None) => self.segments.cmp(&other.segments),
        }
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.text)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// One element of a [`VersionList`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VersionItem {
    /// `=1.2`: exactly this version.
    Exact(Version),
    /// `1.2`: this version or any version it prefixes.
    Prefix(Version),
    /// `lo:hi`, inclusive; an upper bound also admits versions it prefixes.
    Range {
        /// Lower bound, if any.
        lo: Option<Version>,
        /// Upper bound, if any.
        hi: Option<Version>,
    },
}

impl VersionItem {
    /// Whether `version` falls inside this item.
    pub fn contains(&self, version: &Version) -> bool {
        match self {
            Self::Exact(v) => v == version,
            Self::Prefix(v) => v.is_prefix_of(version),
            Self::Range { lo, hi } => {
                lo.as_ref().is_none_or(|lo| version >= lo)
                    && hi
                        .as_ref()
                        .is_none_or(|hi| version <= hi || hi.is_prefix_of(version))
            }
        }
    }

    fn parse(s: &str) -> Result<Self, VersionError> {
        if let Some(exact) = s.strip_prefix('=') {
            return Ok(Self::Exact(Version::parse(exact)?));
        }
        if let Some((lo, hi)) = s.split_once(':') {
            let lo = (!lo.is_empty()).then(|| Version::parse(lo)).transpose()?;
            let hi = (!hi.is_empty()).then(|| Version::parse(hi)).transpose()?;
            if let (Some(l), Some(h)) = (&lo, &hi) {
                if l > h && !h.is_prefix_of(l) {
                    return Err(VersionError::new(s, "lower bound exceeds upper bound"));
                }
            }
            return Ok(Self::Range { lo, hi });
        }
        Ok(Self::Prefix(Version::parse(s)?))
    }
}

impl fmt::Display for VersionItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(v) => write!(f, "={v}"),
            Self::Prefix(v) => write!(f, "{v}"),
            Self::Range { lo, hi } => {
                if let Some(lo) = lo {
                    write!(f, "{lo}")?;
                }
                f.write_str(":")?;
                if let Some(hi) = hi {
                    write!(f, "{hi}")?;
                }
                Ok(())
            }
        }
    }
}

/// A union of version items. An empty list admits any version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct VersionList {
    items: Vec<VersionItem>,
}

impl VersionList {
    /// The unconstrained list.
    pub fn any() -> Self {
        Self::default()
    }

    /// A list admitting exactly `version`.
    pub fn exact(version: Version) -> Self {
        Self {
            items: vec![VersionItem::Exact(version)],
        }
    }

    /// Parse a comma-separated list.
    ///
    /// # Errors
    ///
    /// Returns an error if any item is malformed or the list is empty.
    pub fn parse(s: &str) -> Result<Self, VersionError> {
        if s.is_empty() {
            return Err(VersionError::new(s, "empty version list"));
        }
        let items = s
            .split(',')
            .map(|item| {
                if item.is_empty() {
                    Err(VersionError::new(s, "empty item in version list"))
                } else {
                    VersionItem::parse(item)
                }
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { items })
    }

    /// Whether no constraint is present.
    pub fn is_any(&self) -> bool {
        self.items.is_empty()
    }

    /// Whether `version` satisfies the list.
    pub fn contains(&self, version: &Version) -> bool {
        self.items.is_empty() || self.items.iter().any(|item| item.contains(version))
    }

    /// Whether the list explicitly names `version` (as an exact or prefix
    /// item). Used to opt in to infinity versions such as `develop`.
    pub fn names(&self, version: &Version) -> bool {
        self.items.iter().any(|item| match item {
            VersionItem::Exact(v) | VersionItem::Prefix(v) => v == version,
            VersionItem::Range { .. } => false,
        })
    }

    /// Items in declaration order.
    pub fn items(&self) -> &[VersionItem] {
        &self.items
    }
}

impl fmt::Display for VersionList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.items.is_empty() {
            return f.write_str(":");
        }
        for (i, item) in self.items.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{item}")?;
        }
        Ok(())
    }
}

impl FromStr for VersionList {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for VersionList {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for VersionList {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}
