// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Exclusion filters applied to dimension updates before they are queued.
//!
//! Each pattern is either a literal, a glob (`*`, `?`, `[...]`, `{a,b}`) or a `/regex/`,
//! and can be negated with a leading `!`. A filter only touches dimensions whose name and
//! value match, and removes the properties (and tags) whose name and value match.

use crate::dimension::Dimension;
use crate::errors::FilterError;
use globset::{GlobBuilder, GlobMatcher};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

fn match_all() -> String {
    "*".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyFilterConfig {
    #[serde(default = "match_all")]
    pub property_name: String,
    #[serde(default = "match_all")]
    pub property_value: String,
    #[serde(default = "match_all")]
    pub dimension_name: String,
    #[serde(default = "match_all")]
    pub dimension_value: String,
}

impl Default for PropertyFilterConfig {
    fn default() -> Self {
        Self {
            property_name: match_all(),
            property_value: match_all(),
            dimension_name: match_all(),
            dimension_value: match_all(),
        }
    }
}

const GLOB_META: [char; 4] = ['*', '?', '[', '{'];

#[derive(Debug, Clone)]
enum Pattern {
    Literal(String),
    Glob(GlobMatcher),
    Regex(Regex),
}

impl Pattern {
    fn parse(pattern: &str) -> Result<Self, FilterError> {
        if let Some(re) = pattern
            .strip_prefix('/')
            .and_then(|rest| rest.strip_suffix('/'))
        {
            let re = Regex::new(re).map_err(|source| FilterError::InvalidRegex {
                pattern: pattern.to_string(),
                source,
            })?;
            return Ok(Self::Regex(re));
        }

        if pattern.contains(GLOB_META) {
            // `*` also matches `/`.
            let glob = GlobBuilder::new(pattern)
                .literal_separator(false)
                .build()
                .map_err(|source| FilterError::InvalidGlob {
                    pattern: pattern.to_string(),
                    source,
                })?;
            return Ok(Self::Glob(glob.compile_matcher()));
        }

        Ok(Self::Literal(pattern.to_string()))
    }

    fn matches(&self, s: &str) -> bool {
        match self {
            Self::Literal(literal) => literal == s,
            Self::Glob(glob) => glob.is_match(s),
            Self::Regex(re) => re.is_match(s),
        }
    }
}

/// Matches a string against a set of positive and negated patterns.
#[derive(Debug, Clone, Default)]
pub struct StringMatcher {
    positive: Vec<Pattern>,
    negated: Vec<Pattern>,
}

impl StringMatcher {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, FilterError> {
        let mut matcher = Self::default();
        for pattern in patterns {
            let pattern = pattern.as_ref();
            match pattern.strip_prefix('!') {
                Some(negated) => matcher.negated.push(Pattern::parse(negated)?),
                None => matcher.positive.push(Pattern::parse(pattern)?),
            }
        }
        Ok(matcher)
    }

    #[must_use]
    pub fn matches(&self, s: &str) -> bool {
        if self.negated.iter().any(|p| p.matches(s)) {
            return false;
        }
        self.positive.is_empty() || self.positive.iter().any(|p| p.matches(s))
    }
}

#[derive(Debug, Clone)]
pub struct PropertyFilter {
    property_name: StringMatcher,
    property_value: StringMatcher,
    dimension_name: StringMatcher,
    dimension_value: StringMatcher,
}

impl PropertyFilter {
    pub fn new(config: &PropertyFilterConfig) -> Result<Self, FilterError> {
        Ok(Self {
            property_name: StringMatcher::new(&[&config.property_name])?,
            property_value: StringMatcher::new(&[&config.property_value])?,
            dimension_name: StringMatcher::new(&[&config.dimension_name])?,
            dimension_value: StringMatcher::new(&[&config.dimension_value])?,
        })
    }

    #[must_use]
    pub fn matches_dimension(&self, name: &str, value: &str) -> bool {
        self.dimension_name.matches(name) && self.dimension_value.matches(value)
    }

    #[must_use]
    pub fn filter_properties(
        &self,
        properties: &BTreeMap<String, String>,
    ) -> BTreeMap<String, String> {
        properties
            .iter()
            .filter(|(k, v)| !(self.property_name.matches(k) && self.property_value.matches(v)))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Tags are filtered as properties with an empty value.
    #[must_use]
    pub fn filter_tags(&self, tags: &BTreeMap<String, bool>) -> BTreeMap<String, bool> {
        tags.iter()
            .filter(|(k, _)| !(self.property_name.matches(k) && self.property_value.matches("")))
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }

    /// Returns `None` when the filter removed everything there was to send. An update
    /// that was empty to begin with (clearing a dimension) passes through.
    #[must_use]
    pub fn filter_dimension(&self, dim: Dimension) -> Option<Dimension> {
        if !self.matches_dimension(&dim.name, &dim.value) {
            return Some(dim);
        }
        if dim.properties.is_empty() && dim.tags.is_empty() {
            return Some(dim);
        }

        let properties = self.filter_properties(&dim.properties);
        let tags = self.filter_tags(&dim.tags);
        if properties.is_empty() && tags.is_empty() {
            return None;
        }

        Some(Dimension {
            properties,
            tags,
            ..dim
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct PropertyFilterSet {
    filters: Vec<PropertyFilter>,
}

impl PropertyFilterSet {
    pub fn new(configs: &[PropertyFilterConfig]) -> Result<Self, FilterError> {
        let filters = configs
            .iter()
            .map(PropertyFilter::new)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { filters })
    }

    #[must_use]
    pub fn filter_dimension(&self, dim: Dimension) -> Option<Dimension> {
        self.filters
            .iter()
            .try_fold(dim, |dim, filter| filter.filter_dimension(dim))
    }
}
