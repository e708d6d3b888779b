// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Splunk HTTP Event Collector sink.
//!
//! Each batch is sent as concatenated HEC JSON entries. Datapoints become metric entries
//! (`"event": "metric"` with `metric_name:<name>` fields), events and spans become event
//! entries. Dimension updates have no HEC counterpart.

use crate::config::SplunkConfig;
use crate::errors::ShippingError;
use crate::model::{Datapoint, DatapointValue, Event, Span};
use crate::sink::{post_json, Sink};
use async_trait::async_trait;
use reqwest::header::{HeaderValue, AUTHORIZATION};
use serde::Serialize;
use serde_json::{Map, Value};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;
use url::Url;

#[derive(Serialize)]
struct HecEntry<'a, E: Serialize> {
    /// Seconds since the epoch.
    time: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    host: Option<&'a str>,
    #[serde(skip_serializing_if = "str::is_empty")]
    source: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    sourcetype: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    index: &'a str,
    event: E,
    #[serde(skip_serializing_if = "Map::is_empty")]
    fields: Map<String, Value>,
}

#[derive(Debug)]
pub struct SplunkSink {
    client: reqwest::Client,
    url: Url,
    config: SplunkConfig,
}

impl SplunkSink {
    pub fn new(config: SplunkConfig, client: reqwest::Client) -> Result<Self, url::ParseError> {
        Ok(Self {
            url: Url::parse(&config.url)?,
            client,
            config,
        })
    }

    async fn post_entries(&self, body: Vec<u8>) -> Result<(), ShippingError> {
        let auth = HeaderValue::from_str(&format!("Splunk {}", self.config.token))
            .map_err(|e| ShippingError::Payload(format!("invalid HEC token: {e}")))?;
        let request = self
            .client
            .post(self.url.clone())
            .header(AUTHORIZATION, auth);
        let status = post_json(request, body).await?;
        debug!(url = %self.url, %status, "Shipped payload to Splunk");
        Ok(())
    }
}

fn append_entry<E: Serialize>(body: &mut Vec<u8>, entry: &HecEntry<'_, E>) -> Result<(), ShippingError> {
    serde_json::to_writer(&mut *body, entry).map_err(|e| ShippingError::Payload(e.to_string()))?;
    body.push(b'\n');
    Ok(())
}

fn millis_to_secs(millis: Option<i64>) -> f64 {
    match millis {
        Some(ms) => ms as f64 / 1000.0,
        None => SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default(),
    }
}

fn metric_value(value: DatapointValue) -> Value {
    match value {
        DatapointValue::Int(i) => Value::from(i),
        DatapointValue::Float(f) => Value::from(f),
    }
}

#[async_trait]
impl Sink for SplunkSink {
    fn name(&self) -> &'static str {
        "splunk"
    }

    async fn send_datapoints(&self, datapoints: &[Datapoint]) -> Result<(), ShippingError> {
        if datapoints.is_empty() {
            return Ok(());
        }

        let mut body = Vec::new();
        for dp in datapoints {
            let mut fields: Map<String, Value> = dp
                .dimensions
                .iter()
                .filter(|(k, _)| k.as_str() != "host")
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect();
            fields.insert(format!("metric_name:{}", dp.metric), metric_value(dp.value));
            fields.insert(
                "metric_type".to_string(),
                serde_json::to_value(dp.metric_type).unwrap_or(Value::Null),
            );

            let entry = HecEntry {
                time: millis_to_secs(dp.timestamp),
                host: dp.dimensions.get("host").map(String::as_str),
                source: &self.config.source,
                sourcetype: &self.config.source_type,
                index: &self.config.index,
                event: "metric",
                fields,
            };
            append_entry(&mut body, &entry)?;
        }
        self.post_entries(body).await
    }

    async fn send_events(&self, events: &[Event]) -> Result<(), ShippingError> {
        if events.is_empty() {
            return Ok(());
        }

        let mut body = Vec::new();
        for event in events {
            let entry = HecEntry {
                time: millis_to_secs(event.timestamp),
                host: event.dimensions.get("host").map(String::as_str),
                source: &self.config.events_source,
                sourcetype: &self.config.events_source_type,
                index: &self.config.events_index,
                event,
                fields: Map::new(),
            };
            append_entry(&mut body, &entry)?;
        }
        self.post_entries(body).await
    }

    async fn send_spans(&self, spans: &[Span]) -> Result<(), ShippingError> {
        if spans.is_empty() {
            return Ok(());
        }

        let mut body = Vec::new();
        for span in spans {
            let entry = HecEntry {
                time: span
                    .timestamp
                    .map_or_else(|| millis_to_secs(None), |us| us as f64 / 1_000_000.0),
                host: span.tags.get("host").map(String::as_str),
                source: &self.config.source,
                sourcetype: &self.config.source_type,
                index: &self.config.index,
                event: span,
                fields: Map::new(),
            };
            append_entry(&mut body, &entry)?;
        }
        self.post_entries(body).await
    }
}
