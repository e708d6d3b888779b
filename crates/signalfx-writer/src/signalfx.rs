// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! SignalFx ingest sink: JSON datapoints, events and Zipkin spans.

use crate::access_token::AccessToken;
use crate::config::WriterConfig;
use crate::errors::{ConfigError, ShippingError};
use crate::http::header_map;
use crate::model::{Datapoint, DatapointValue, Event, MetricType, Span};
use crate::sink::{post_json, Sink};
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::debug;
use url::Url;

#[derive(Serialize)]
struct DatapointEntry<'a> {
    metric: &'a str,
    value: DatapointValue,
    dimensions: &'a BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    timestamp: Option<i64>,
}

impl<'a> From<&'a Datapoint> for DatapointEntry<'a> {
    fn from(dp: &'a Datapoint) -> Self {
        Self {
            metric: &dp.metric,
            value: dp.value,
            dimensions: &dp.dimensions,
            timestamp: dp.timestamp,
        }
    }
}

/// `/v2/datapoint` body: datapoints grouped by metric type.
#[derive(Serialize, Default)]
struct DatapointBody<'a> {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    gauge: Vec<DatapointEntry<'a>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    counter: Vec<DatapointEntry<'a>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    cumulative_counter: Vec<DatapointEntry<'a>>,
}

impl<'a> DatapointBody<'a> {
    fn new(datapoints: &'a [Datapoint]) -> Self {
        let mut body = Self::default();
        for dp in datapoints {
            let group = match dp.metric_type {
                MetricType::Gauge => &mut body.gauge,
                MetricType::Counter => &mut body.counter,
                MetricType::CumulativeCounter => &mut body.cumulative_counter,
            };
            group.push(dp.into());
        }
        body
    }
}

#[derive(Debug)]
pub struct SignalFxSink {
    client: reqwest::Client,
    token: AccessToken,
    extra_headers: HeaderMap,
    datapoint_url: Url,
    event_url: Url,
    trace_url: Url,
}

impl SignalFxSink {
    pub fn new(
        config: &WriterConfig,
        token: AccessToken,
        client: reqwest::Client,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            client,
            token,
            extra_headers: header_map(&config.extra_headers),
            datapoint_url: config.datapoint_endpoint()?,
            event_url: config.event_endpoint()?,
            trace_url: config.trace_endpoint()?,
        })
    }

    fn request(&self, url: &Url) -> reqwest::RequestBuilder {
        let request = self
            .client
            .post(url.clone())
            .headers(self.extra_headers.clone());
        self.token.authorize(request)
    }

    async fn post<T: Serialize + ?Sized>(
        &self,
        url: &Url,
        body: &T,
    ) -> Result<(), ShippingError> {
        let body = serde_json::to_vec(body).map_err(|e| ShippingError::Payload(e.to_string()))?;
        let request = self.request(url);
        let status = post_json(request, body).await?;
        debug!(%url, %status, "Shipped payload to SignalFx");
        Ok(())
    }
}

#[async_trait]
impl Sink for SignalFxSink {
    fn name(&self) -> &'static str {
        "signalfx"
    }

    async fn send_datapoints(&self, datapoints: &[Datapoint]) -> Result<(), ShippingError> {
        if datapoints.is_empty() {
            return Ok(());
        }
        self.post(&self.datapoint_url, &DatapointBody::new(datapoints))
            .await
    }

    async fn send_events(&self, events: &[Event]) -> Result<(), ShippingError> {
        if events.is_empty() {
            return Ok(());
        }
        self.post(&self.event_url, events).await
    }

    async fn send_spans(&self, spans: &[Span]) -> Result<(), ShippingError> {
        if spans.is_empty() {
            return Ok(());
        }
        self.post(&self.trace_url, spans).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};

    fn sink(server_url: &str) -> SignalFxSink {
        let config = WriterConfig {
            ingest_url: server_url.to_string(),
            extra_headers: BTreeMap::from([("X-Extra".to_string(), "1".to_string())]),
            ..Default::default()
        };
        SignalFxSink::new(
            &config,
            AccessToken::new("sfx-token").expect("valid token"),
            reqwest::Client::new(),
        )
        .expect("sink should build")
    }

    #[tokio::test]
    async fn test_send_datapoints_grouped_by_type() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/v2/datapoint")
            .match_header("X-SF-TOKEN", "sfx-token")
            .match_header("X-Extra", "1")
            .match_header("content-type", "application/json")
            .match_body(Matcher::Json(serde_json::json!({
                "gauge": [{"metric": "cpu", "value": 1.5, "dimensions": {"host": "a"}}],
                "cumulative_counter": [{"metric": "requests", "value": 10, "dimensions": {}, "timestamp": 1000}]
            })))
            .with_status(200)
            .create_async()
            .await;

        let mut counter = Datapoint::gauge("requests", DatapointValue::Int(10));
        counter.metric_type = MetricType::CumulativeCounter;
        counter.timestamp = Some(1000);
        let datapoints = vec![
            Datapoint::gauge("cpu", DatapointValue::Float(1.5)).with_dimension("host", "a"),
            counter,
        ];

        sink(&server.url())
            .send_datapoints(&datapoints)
            .await
            .expect("datapoints should ship");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_send_events_and_spans() {
        let mut server = Server::new_async().await;
        let events = server
            .mock("POST", "/v2/event")
            .match_body(Matcher::PartialJson(serde_json::json!([{"eventType": "deploy"}])))
            .with_status(200)
            .create_async()
            .await;
        let spans = server
            .mock("POST", "/v1/trace")
            .match_body(Matcher::PartialJson(serde_json::json!([{"traceId": "t1", "id": "s1"}])))
            .with_status(200)
            .create_async()
            .await;

        let sink = sink(&server.url());
        sink.send_events(&[Event::new("deploy")])
            .await
            .expect("events should ship");
        sink.send_spans(&[Span {
            trace_id: "t1".to_string(),
            id: "s1".to_string(),
            ..Default::default()
        }])
        .await
        .expect("spans should ship");

        events.assert_async().await;
        spans.assert_async().await;
    }

    #[tokio::test]
    async fn test_error_status_is_shipping_error() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/v2/datapoint")
            .with_status(401)
            .with_body("bad token")
            .create_async()
            .await;

        let err = sink(&server.url())
            .send_datapoints(&[Datapoint::gauge("cpu", DatapointValue::Int(1))])
            .await
            .expect_err("401 should fail");
        assert!(err.is_permanent());
        assert!(matches!(
            err,
            ShippingError::Destination(Some(reqwest::StatusCode::UNAUTHORIZED), ref body) if body == "bad token"
        ));
    }

    #[tokio::test]
    async fn test_empty_batches_are_not_sent() {
        let server = Server::new_async().await;
        let sink = sink(&server.url());
        assert!(sink.send_datapoints(&[]).await.is_ok());
        assert!(sink.send_events(&[]).await.is_ok());
        assert!(sink.send_spans(&[]).await.is_ok());
    }
}
