// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Dimension updates produced by monitors.
//!
//! A dimension is a `name=value` pair on a monitored entity (e.g. `host=web1`) on which
//! properties and tags can be set. An update either replaces the whole property/tag set
//! (`merge_into_existing == false`, sent with PUT) or patches it (`true`, sent with PATCH).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Identity and equality contract used for queuing and deduplication.
pub trait DedupIdentity {
    type Key: Eq + std::hash::Hash + Clone;

    fn key(&self) -> Self::Key;

    /// Whether applying `self` on top of `cached` would change nothing.
    fn equal_for_dedup(&self, cached: &Self) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DimensionKey {
    pub name: String,
    pub value: String,
}

impl fmt::Display for DimensionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.value)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dimension {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    /// `true` adds the tag, `false` removes it.
    #[serde(default)]
    pub tags: BTreeMap<String, bool>,
    #[serde(default)]
    pub merge_into_existing: bool,
}

impl Dimension {
    #[must_use]
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>, add: bool) -> Self {
        self.tags.insert(tag.into(), add);
        self
    }

    #[must_use]
    pub fn merging(mut self) -> Self {
        self.merge_into_existing = true;
        self
    }

    /// Name and value must both be non-empty for an update to be sent.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self.name.is_empty() && !self.value.is_empty()
    }

    /// Unions properties and tags of `other` into `self`, values from `other` win.
    pub fn merge_from(&mut self, other: &Dimension) {
        self.properties.extend(
            other
                .properties
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        self.tags
            .extend(other.tags.iter().map(|(k, v)| (k.clone(), *v)));
    }

    /// Overwrites properties and tags of `self` with those of `other`.
    pub fn replace_contents(&mut self, other: &Dimension) {
        self.properties.clone_from(&other.properties);
        self.tags.clone_from(&other.tags);
    }

    /// Tags to add and tags to remove, each sorted.
    #[must_use]
    pub fn split_tags(&self) -> (Vec<String>, Vec<String>) {
        let mut to_add = Vec::new();
        let mut to_remove = Vec::new();
        for (tag, add) in &self.tags {
            if *add {
                to_add.push(tag.clone());
            } else {
                to_remove.push(tag.clone());
            }
        }
        (to_add, to_remove)
    }
}

impl DedupIdentity for Dimension {
    type Key = DimensionKey;

    fn key(&self) -> DimensionKey {
        DimensionKey {
            name: self.name.clone(),
            value: self.value.clone(),
        }
    }

    fn equal_for_dedup(&self, cached: &Self) -> bool {
        if self.merge_into_existing != cached.merge_into_existing {
            return false;
        }
        if !self.merge_into_existing {
            return self == cached;
        }
        self.properties
            .iter()
            .all(|(k, v)| cached.properties.get(k) == Some(v))
            && self
                .tags
                .iter()
                .all(|(k, v)| cached.tags.get(k) == Some(v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_display() {
        let dim = Dimension::new("host", "web1");
        assert_eq!(dim.key().to_string(), "host/web1");
    }

    #[test]
    fn test_is_valid() {
        assert!(Dimension::new("host", "web1").is_valid());
        assert!(!Dimension::new("", "web1").is_valid());
        assert!(!Dimension::new("host", "").is_valid());
    }

    #[test]
    fn test_merge_from_new_values_win() {
        let mut queued = Dimension::new("host", "a")
            .with_property("x", "1")
            .with_property("y", "1")
            .with_tag("t", true)
            .merging();
        let incoming = Dimension::new("host", "a")
            .with_property("y", "2")
            .with_tag("t", false)
            .with_tag("u", true)
            .merging();

        queued.merge_from(&incoming);

        assert_eq!(queued.properties.get("x").map(String::as_str), Some("1"));
        assert_eq!(queued.properties.get("y").map(String::as_str), Some("2"));
        assert_eq!(queued.tags.get("t"), Some(&false));
        assert_eq!(queued.tags.get("u"), Some(&true));
    }

    #[test]
    fn test_replace_contents() {
        let mut queued = Dimension::new("host", "a").with_property("x", "1");
        let incoming = Dimension::new("host", "a").with_tag("t", true);

        queued.replace_contents(&incoming);

        assert!(queued.properties.is_empty());
        assert_eq!(queued.tags.get("t"), Some(&true));
    }

    #[test]
    fn test_equal_for_dedup_replace_requires_deep_equality() {
        let cached = Dimension::new("host", "a").with_property("x", "1");
        assert!(cached.clone().equal_for_dedup(&cached));
        let subset = Dimension::new("host", "a");
        assert!(!subset.equal_for_dedup(&cached));
    }

    #[test]
    fn test_equal_for_dedup_merge_is_subset_check() {
        let cached = Dimension::new("host", "a")
            .with_property("x", "1")
            .with_property("y", "2")
            .with_tag("t", true)
            .merging();

        let subset = Dimension::new("host", "a").with_property("x", "1").merging();
        assert!(subset.equal_for_dedup(&cached));

        let changed = Dimension::new("host", "a").with_property("x", "9").merging();
        assert!(!changed.equal_for_dedup(&cached));

        let tag_flip = Dimension::new("host", "a").with_tag("t", false).merging();
        assert!(!tag_flip.equal_for_dedup(&cached));

        let new_tag = Dimension::new("host", "a").with_tag("v", true).merging();
        assert!(!new_tag.equal_for_dedup(&cached));
    }

    #[test]
    fn test_equal_for_dedup_mismatched_merge_flags() {
        let cached = Dimension::new("host", "a").with_property("x", "1");
        let patch = Dimension::new("host", "a").with_property("x", "1").merging();
        assert!(!patch.equal_for_dedup(&cached));
        assert!(!cached.equal_for_dedup(&patch));
    }

    #[test]
    fn test_split_tags_sorted() {
        let dim = Dimension::new("host", "a")
            .with_tag("b", true)
            .with_tag("a", true)
            .with_tag("z", false);
        let (add, remove) = dim.split_tags();
        assert_eq!(add, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(remove, vec!["z".to_string()]);
    }

    #[test]
    fn test_deserialize_defaults() {
        let dim: Dimension =
            serde_json::from_str(r#"{"name":"host","value":"web1"}"#).expect("parse failed");
        assert_eq!(dim, Dimension::new("host", "web1"));
    }
}
