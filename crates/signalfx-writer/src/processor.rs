// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Preprocessing shared by every backend: global dimensions, host id dimensions,
//! datapoint exclusion and dimension value truncation.

use crate::config::WriterConfig;
use crate::errors::ConfigError;
use crate::model::{Datapoint, Event, Span, NOT_HOST_SPECIFIC_META};
use crate::property_filters::StringMatcher;
use crate::WRITER_VERSION;
use std::collections::BTreeMap;

pub const MAX_DIMENSION_VALUE_LENGTH: usize = 256;
pub const VERSION_SPAN_TAG: &str = "signalfx.smartagent.version";

#[derive(Debug, Clone, Default)]
pub struct Processor {
    global_dims: BTreeMap<String, String>,
    global_span_tags: BTreeMap<String, String>,
    add_global_dimensions_as_span_tags: bool,
    host_id_dims: BTreeMap<String, String>,
    datapoint_filter: Option<StringMatcher>,
}

impl Processor {
    pub fn new(config: &WriterConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            global_dims: config.global_dimensions.clone(),
            global_span_tags: config.global_span_tags.clone(),
            add_global_dimensions_as_span_tags: config.add_global_dimensions_as_span_tags,
            host_id_dims: config.host_id_dims.clone(),
            datapoint_filter: config.datapoint_filters()?,
        })
    }

    #[must_use]
    pub fn should_send_datapoint(&self, dp: &Datapoint) -> bool {
        self.datapoint_filter
            .as_ref()
            .map_or(true, |filter| !filter.matches(&dp.metric))
    }

    /// Returns `false` when the datapoint is excluded and must not be sent.
    pub fn preprocess_datapoint(&self, dp: &mut Datapoint) -> bool {
        if !self.should_send_datapoint(dp) {
            return false;
        }

        add_missing(&mut dp.dimensions, &self.global_dims);
        if dp.is_host_specific() {
            add_overriding(&mut dp.dimensions, &self.host_id_dims);
        }
        truncate_dimension_values(&mut dp.dimensions);
        true
    }

    /// Events only get the `host` dimension overridden, other host ids are left off.
    pub fn preprocess_event(&self, event: &mut Event) {
        add_missing(&mut event.dimensions, &self.global_dims);

        let not_host_specific = event
            .properties
            .remove(NOT_HOST_SPECIFIC_META)
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        if !not_host_specific {
            if let Some(host) = self.host_id_dims.get("host").filter(|h| !h.is_empty()) {
                event.dimensions.insert("host".to_string(), host.clone());
            }
        }
    }

    pub fn preprocess_span(&self, span: &mut Span) {
        // presence of the tag is what matters, not its value
        if span.tags.remove(NOT_HOST_SPECIFIC_META).is_none() {
            add_overriding(&mut span.tags, &self.host_id_dims);
        }

        add_missing(&mut span.tags, &self.global_span_tags);
        if self.add_global_dimensions_as_span_tags {
            add_missing(&mut span.tags, &self.global_dims);
        }

        span.tags
            .insert(VERSION_SPAN_TAG.to_string(), WRITER_VERSION.to_string());
    }
}

fn add_missing(fields: &mut BTreeMap<String, String>, extra: &BTreeMap<String, String>) {
    for (name, value) in extra {
        fields
            .entry(name.clone())
            .or_insert_with(|| value.clone());
    }
}

fn add_overriding(fields: &mut BTreeMap<String, String>, extra: &BTreeMap<String, String>) {
    fields.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
}

/// Truncates values longer than [`MAX_DIMENSION_VALUE_LENGTH`] characters.
pub fn truncate_dimension_values(dims: &mut BTreeMap<String, String>) {
    for value in dims.values_mut() {
        if let Some((byte_idx, _)) = value.char_indices().nth(MAX_DIMENSION_VALUE_LENGTH) {
            value.truncate(byte_idx);
        }
    }
}
