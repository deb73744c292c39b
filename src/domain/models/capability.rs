//! Capability tags.
//!
//! Agents advertise and tasks require capabilities as plain tag sets.
//! Matching is pure set arithmetic: no reflection, no duck typing.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// A single capability tag, normalised to trimmed lowercase.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Capability(String);

impl Capability {
    /// Create a capability tag, normalising case and surrounding whitespace.
    pub fn new(tag: impl AsRef<str>) -> Self {
        Self(tag.as_ref().trim().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Capability {
    fn from(tag: &str) -> Self {
        Self::new(tag)
    }
}

impl From<String> for Capability {
    fn from(tag: String) -> Self {
        Self::new(tag)
    }
}

impl From<Capability> for String {
    fn from(capability: Capability) -> Self {
        capability.0
    }
}

/// Ordered set of capability tags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySet(BTreeSet<Capability>);

impl CapabilitySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, capability: impl Into<Capability>) -> bool {
        let capability = capability.into();
        if capability.as_str().is_empty() {
            return false;
        }
        self.0.insert(capability)
    }

    pub fn contains(&self, capability: &Capability) -> bool {
        self.0.contains(capability)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Capability> {
        self.0.iter()
    }

    /// Number of tags present in both sets.
    pub fn intersection_len(&self, other: &Self) -> usize {
        self.0.intersection(&other.0).count()
    }

    pub fn intersects(&self, other: &Self) -> bool {
        self.intersection_len(other) > 0
    }

    /// True when every tag of `self` is also in `other`.
    pub fn is_subset_of(&self, other: &Self) -> bool {
        self.0.is_subset(&other.0)
    }

    /// Fraction of `required` covered by `self`. An empty requirement is fully covered.
    pub fn coverage_of(&self, required: &Self) -> f64 {
        if required.is_empty() {
            return 1.0;
        }
        required.intersection_len(self) as f64 / required.len() as f64
    }

    /// Jaccard index `|A∩B| / |A∪B|`; zero when either set is empty.
    pub fn jaccard(&self, other: &Self) -> f64 {
        if self.is_empty() || other.is_empty() {
            return 0.0;
        }
        let shared = self.intersection_len(other);
        let union = self.len() + other.len() - shared;
        shared as f64 / union as f64
    }

    pub fn to_strings(&self) -> Vec<String> {
        self.0.iter().map(ToString::to_string).collect()
    }
}

impl<T: Into<Capability>> FromIterator<T> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut set = Self::new();
        for tag in iter {
            set.insert(tag);
        }
        set
    }
}

impl fmt::Display for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_strings().join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_normalisation() {
        assert_eq!(Capability::new("  Traffic "), Capability::new("traffic"));
        assert_eq!(Capability::new("Weather").as_str(), "weather");
    }

    #[test]
    fn test_empty_tags_are_ignored() {
        let set: CapabilitySet = ["x", "  ", ""].into_iter().collect();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_subset_and_coverage() {
        let agent: CapabilitySet = ["x", "y"].into_iter().collect();
        let task: CapabilitySet = ["y"].into_iter().collect();
        let wide: CapabilitySet = ["y", "z"].into_iter().collect();

        assert!(task.is_subset_of(&agent));
        assert!(!wide.is_subset_of(&agent));
        assert!((agent.coverage_of(&task) - 1.0).abs() < f64::EPSILON);
        assert!((agent.coverage_of(&wide) - 0.5).abs() < f64::EPSILON);
        assert!((agent.coverage_of(&CapabilitySet::new()) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_jaccard() {
        let a: CapabilitySet = ["x", "y"].into_iter().collect();
        let b: CapabilitySet = ["y", "z"].into_iter().collect();
        assert!((a.jaccard(&b) - 1.0 / 3.0).abs() < 1e-12);
        assert!((a.jaccard(&a) - 1.0).abs() < f64::EPSILON);
        assert_eq!(a.jaccard(&CapabilitySet::new()), 0.0);
    }

    #[test]
    fn test_serde_is_a_plain_list() {
        let set: CapabilitySet = ["b", "a"].into_iter().collect();
        let json = serde_json::to_string(&set).unwrap();
        assert_eq!(json, r#"["a","b"]"#);
        let back: CapabilitySet = serde_json::from_str(&json).unwrap();
        assert_eq!(back, set);
    }
}
