// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Writer configuration.
//!
//! Sources are applied in this order, later ones winning:
//!
//! 1. **Defaults** - the values in [`WriterConfig::default`]
//! 2. **YAML file** - the agent's `writer:` block, camelCase keys
//! 3. **Environment variables** - `SFX_ACCESS_TOKEN`, `SFX_API_URL`, `SFX_INGEST_URL`,
//!    `SFX_LOG_LEVEL`, `SFX_SIGNALFX_ENABLED` and `SFX_PROXY_HTTPS`/`HTTPS_PROXY`

use crate::access_token::AccessToken;
use crate::dimension_client::DimensionClientConfig;
use crate::errors::ConfigError;
use crate::property_filters::{PropertyFilterConfig, PropertyFilterSet, StringMatcher};
use figment::providers::{Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::path::Path;
use std::time::Duration;
use url::Url;

pub const DEFAULT_INGEST_URL: &str = "https://ingest.us0.signalfx.com";
pub const DEFAULT_API_URL: &str = "https://api.us0.signalfx.com";

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WriterConfig {
    /// Largest datapoint batch sent in one request.
    pub datapoint_max_batch_size: usize,
    /// Datapoints held before the oldest start being overwritten.
    pub max_datapoints_buffered: usize,
    pub trace_span_max_batch_size: usize,
    pub max_trace_spans_in_flight: usize,
    /// Concurrent requests per backend for datapoints, events and spans.
    pub max_requests: usize,
    pub timeout_seconds: u64,
    pub event_send_interval_seconds: u64,
    /// Concurrent dimension update requests.
    pub properties_max_requests: usize,
    /// Dimension updates held pending before new ones are dropped.
    pub properties_max_buffered: usize,
    /// Updates to the same dimension within this window are coalesced.
    pub properties_send_delay_seconds: u64,
    /// Size of the cache of confirmed dimension states used to skip no-op updates.
    pub properties_history_size: usize,
    /// Resubmissions of one update before it is given up on.
    pub properties_max_retries: u32,
    pub log_datapoints: bool,
    pub log_events: bool,
    pub log_trace_spans: bool,
    pub log_dimension_updates: bool,
    pub log_dropped_datapoints: bool,
    pub add_global_dimensions_as_span_tags: bool,
    pub signal_fx_enabled: bool,
    pub splunk: Option<SplunkConfig>,
    pub extra_headers: BTreeMap<String, String>,
    pub signal_fx_access_token: String,
    pub ingest_url: String,
    pub api_url: String,
    pub event_endpoint_url: Option<String>,
    pub trace_endpoint_url: Option<String>,
    pub global_dimensions: BTreeMap<String, String>,
    pub global_span_tags: BTreeMap<String, String>,
    pub host_id_dims: BTreeMap<String, String>,
    /// Metric name patterns whose datapoints are never sent.
    pub metrics_to_exclude: Vec<String>,
    pub properties_to_exclude: Vec<PropertyFilterConfig>,
    pub log_level: String,
    pub https_proxy: Option<String>,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            datapoint_max_batch_size: 1000,
            max_datapoints_buffered: 25_000,
            trace_span_max_batch_size: 1000,
            max_trace_spans_in_flight: 100_000,
            max_requests: 10,
            timeout_seconds: 5,
            event_send_interval_seconds: 1,
            properties_max_requests: 20,
            properties_max_buffered: 10_000,
            properties_send_delay_seconds: 30,
            properties_history_size: 10_000,
            properties_max_retries: 10,
            log_datapoints: false,
            log_events: false,
            log_trace_spans: false,
            log_dimension_updates: false,
            log_dropped_datapoints: false,
            add_global_dimensions_as_span_tags: false,
            signal_fx_enabled: true,
            splunk: None,
            extra_headers: BTreeMap::new(),
            signal_fx_access_token: String::new(),
            ingest_url: DEFAULT_INGEST_URL.to_string(),
            api_url: DEFAULT_API_URL.to_string(),
            event_endpoint_url: None,
            trace_endpoint_url: None,
            global_dimensions: BTreeMap::new(),
            global_span_tags: BTreeMap::new(),
            host_id_dims: BTreeMap::new(),
            metrics_to_exclude: Vec::new(),
            properties_to_exclude: Vec::new(),
            log_level: "info".to_string(),
            https_proxy: None,
        }
    }
}

/// Output to a Splunk HTTP Event Collector. Zero-valued limits inherit the writer's.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SplunkConfig {
    pub enabled: bool,
    /// Full URL (including path) of the HEC endpoint.
    pub url: String,
    pub token: String,
    pub source: String,
    pub source_type: String,
    pub index: String,
    pub events_index: String,
    pub events_source: String,
    pub events_source_type: String,
    pub skip_tls_verify: bool,
    pub max_buffered: usize,
    pub max_requests: usize,
    pub max_batch_size: usize,
}

impl WriterConfig {
    /// Loads defaults, then the YAML file at `path` if given, then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(WriterConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        let mut config: WriterConfig = figment.extract().map_err(Box::new)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: WriterConfig = Figment::from(Serialized::defaults(WriterConfig::default()))
            .merge(Yaml::string(yaml))
            .extract()
            .map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(token) = env::var("SFX_ACCESS_TOKEN") {
            self.signal_fx_access_token = token;
        }
        if let Ok(api_url) = env::var("SFX_API_URL") {
            self.api_url = api_url;
        }
        if let Ok(ingest_url) = env::var("SFX_INGEST_URL") {
            self.ingest_url = ingest_url;
        }
        if let Ok(level) = env::var("SFX_LOG_LEVEL") {
            self.log_level = level.to_lowercase();
        }
        if let Ok(enabled) = env::var("SFX_SIGNALFX_ENABLED") {
            self.signal_fx_enabled = enabled.to_lowercase() != "false";
        }
        if let Ok(proxy) = env::var("SFX_PROXY_HTTPS").or_else(|_| env::var("HTTPS_PROXY")) {
            self.https_proxy = Some(proxy);
        }
    }

    #[must_use]
    pub fn is_splunk_output_enabled(&self) -> bool {
        self.splunk.as_ref().is_some_and(|s| s.enabled)
    }

    #[must_use]
    pub fn is_signalfx_output_enabled(&self) -> bool {
        self.signal_fx_enabled
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.is_splunk_output_enabled() && !self.is_signalfx_output_enabled() {
            return Err(ConfigError::InvalidConfig(
                "both SignalFx and Splunk output are disabled, at least one must be enabled"
                    .to_string(),
            ));
        }

        self.access_token()?;

        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(ConfigError::InvalidConfig(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        for (field, value) in [
            ("max_datapoints_buffered", self.max_datapoints_buffered),
            ("datapoint_max_batch_size", self.datapoint_max_batch_size),
            ("trace_span_max_batch_size", self.trace_span_max_batch_size),
            ("max_requests", self.max_requests),
            ("properties_max_requests", self.properties_max_requests),
            ("properties_max_buffered", self.properties_max_buffered),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidConfig(format!(
                    "{field} must be greater than 0"
                )));
            }
        }

        self.parsed_api_url()?;
        self.parsed_ingest_url()?;
        self.event_endpoint()?;
        self.trace_endpoint()?;
        if let Some(splunk) = self.splunk.as_ref().filter(|s| s.enabled) {
            Url::parse(&splunk.url).map_err(|source| ConfigError::InvalidUrl {
                field: "splunk.url",
                source,
            })?;
        }

        self.property_filters()?;
        self.datapoint_filters()?;

        Ok(())
    }

    pub fn parsed_api_url(&self) -> Result<Url, ConfigError> {
        Url::parse(&self.api_url).map_err(|source| ConfigError::InvalidUrl {
            field: "apiUrl",
            source,
        })
    }

    pub fn parsed_ingest_url(&self) -> Result<Url, ConfigError> {
        Url::parse(&self.ingest_url).map_err(|source| ConfigError::InvalidUrl {
            field: "ingestUrl",
            source,
        })
    }

    /// Event endpoint, defaulting to `{ingest}/v2/event`.
    pub fn event_endpoint(&self) -> Result<Url, ConfigError> {
        self.endpoint_or_ingest_path(
            self.event_endpoint_url.as_deref(),
            "eventEndpointUrl",
            "v2/event",
        )
    }

    /// Trace endpoint, defaulting to `{ingest}/v1/trace`.
    pub fn trace_endpoint(&self) -> Result<Url, ConfigError> {
        self.endpoint_or_ingest_path(
            self.trace_endpoint_url.as_deref(),
            "traceEndpointUrl",
            "v1/trace",
        )
    }

    pub fn datapoint_endpoint(&self) -> Result<Url, ConfigError> {
        self.endpoint_or_ingest_path(None, "ingestUrl", "v2/datapoint")
    }

    fn endpoint_or_ingest_path(
        &self,
        explicit: Option<&str>,
        field: &'static str,
        path: &str,
    ) -> Result<Url, ConfigError> {
        match explicit.filter(|url| !url.is_empty()) {
            Some(url) => Url::parse(url).map_err(|source| ConfigError::InvalidUrl { field, source }),
            None => join_path(&self.parsed_ingest_url()?, path)
                .map_err(|source| ConfigError::InvalidUrl { field, source }),
        }
    }

    pub fn access_token(&self) -> Result<AccessToken, ConfigError> {
        AccessToken::new(&self.signal_fx_access_token).map_err(|_| {
            ConfigError::InvalidConfig(
                "the SignalFx Access Token does not pass http header validation and is likely malformed"
                    .to_string(),
            )
        })
    }

    pub fn property_filters(&self) -> Result<PropertyFilterSet, ConfigError> {
        Ok(PropertyFilterSet::new(&self.properties_to_exclude)?)
    }

    pub fn datapoint_filters(&self) -> Result<Option<StringMatcher>, ConfigError> {
        if self.metrics_to_exclude.is_empty() {
            return Ok(None);
        }
        Ok(Some(StringMatcher::new(&self.metrics_to_exclude)?))
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    #[must_use]
    pub fn event_send_interval(&self) -> Duration {
        Duration::from_secs(self.event_send_interval_seconds.max(1))
    }

    pub fn dimension_client_config(&self) -> Result<DimensionClientConfig, ConfigError> {
        Ok(DimensionClientConfig {
            api_url: self.parsed_api_url()?,
            send_delay: Duration::from_secs(self.properties_send_delay_seconds),
            max_buffered: self.properties_max_buffered,
            max_requests: self.properties_max_requests,
            history_size: self.properties_history_size,
            max_retries: self.properties_max_retries,
            log_updates: self.log_dimension_updates,
            extra_headers: self.extra_headers.clone(),
            timeout: Duration::from_secs(10),
            https_proxy: self.https_proxy.clone(),
        })
    }
}

/// Appends `path` to `base`, keeping any path prefix `base` already has.
pub(crate) fn join_path(base: &Url, path: &str) -> Result<Url, url::ParseError> {
    let mut base = base.clone();
    if !base.path().ends_with('/') {
        let with_slash = format!("{}/", base.path());
        base.set_path(&with_slash);
    }
    base.join(path)
}
