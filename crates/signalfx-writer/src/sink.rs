// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::errors::ShippingError;
use crate::model::{Datapoint, Event, Span};
use async_trait::async_trait;
use reqwest::StatusCode;

/// Transport to one backend. Batches are already preprocessed.
#[async_trait]
pub trait Sink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send_datapoints(&self, datapoints: &[Datapoint]) -> Result<(), ShippingError>;

    async fn send_events(&self, events: &[Event]) -> Result<(), ShippingError>;

    async fn send_spans(&self, spans: &[Span]) -> Result<(), ShippingError>;
}

/// Posts `body` and maps anything but a 2xx response to a [`ShippingError`].
///
/// Connect and timeout errors are tried once more right away, since they are usually
/// a stale pooled connection rather than a backend problem.
pub(crate) async fn post_json(
    request: reqwest::RequestBuilder,
    body: Vec<u8>,
) -> Result<StatusCode, ShippingError> {
    let request = request
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .body(body);

    let retry = request.try_clone();
    let response = match request.send().await {
        Ok(response) => response,
        Err(e) if is_transient(&e) => {
            let Some(retry) = retry else {
                return Err(ShippingError::Destination(None, e.without_url().to_string()));
            };
            tracing::debug!("Retrying after temporary network error: {}", e.without_url());
            retry
                .send()
                .await
                .map_err(|e| ShippingError::Destination(e.status(), e.without_url().to_string()))?
        }
        Err(e) => {
            return Err(ShippingError::Destination(
                e.status(),
                e.without_url().to_string(),
            ))
        }
    };

    let status = response.status();
    if status.is_success() {
        return Ok(status);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ShippingError::Destination(Some(status), body))
}

fn is_transient(e: &reqwest::Error) -> bool {
    e.is_connect() || e.is_timeout() || e.is_request()
}
