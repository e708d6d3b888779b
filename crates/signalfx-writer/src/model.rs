// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Datapoints, events and trace spans produced by monitors.
//!
//! All types own their data, so `clone()` yields an independent deep copy that a backend
//! can mutate during preprocessing without affecting other backends.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Meta key (or event property / span tag) marking an item as not tied to the host it
/// was collected on, so host id dimensions are not added to it.
pub const NOT_HOST_SPECIFIC_META: &str = "sfx-not-host-specific";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    #[default]
    Gauge,
    Counter,
    CumulativeCounter,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DatapointValue {
    Int(i64),
    Float(f64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Datapoint {
    pub metric: String,
    pub value: DatapointValue,
    #[serde(default)]
    pub metric_type: MetricType,
    #[serde(default)]
    pub dimensions: BTreeMap<String, String>,
    /// Writer-side annotations, never sent to a backend.
    #[serde(default, skip_serializing)]
    pub meta: BTreeMap<String, bool>,
    /// Milliseconds since the epoch; the backend assigns receive time when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl Datapoint {
    #[must_use]
    pub fn gauge(metric: impl Into<String>, value: DatapointValue) -> Self {
        Self {
            metric: metric.into(),
            value,
            metric_type: MetricType::Gauge,
            dimensions: BTreeMap::new(),
            meta: BTreeMap::new(),
            timestamp: None,
        }
    }

    #[must_use]
    pub fn with_dimension(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.dimensions.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn is_host_specific(&self) -> bool {
        !self
            .meta
            .get(NOT_HOST_SPECIFIC_META)
            .copied()
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventCategory {
    #[default]
    UserDefined,
    Alert,
    Audit,
    Job,
    Collectd,
    ServiceDiscovery,
    Exception,
    Agent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub event_type: String,
    #[serde(default)]
    pub category: EventCategory,
    #[serde(default)]
    pub dimensions: BTreeMap<String, String>,
    #[serde(default)]
    pub properties: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl Event {
    #[must_use]
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            category: EventCategory::UserDefined,
            dimensions: BTreeMap::new(),
            properties: BTreeMap::new(),
            timestamp: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

/// A trace span in Zipkin v2 JSON shape.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Span {
    pub trace_id: String,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Start time in microseconds since the epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_endpoint: Option<Endpoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_endpoint: Option<Endpoint>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl Span {
    #[must_use]
    pub fn service_name(&self) -> Option<&str> {
        self.local_endpoint
            .as_ref()
            .and_then(|e| e.service_name.as_deref())
    }
}
