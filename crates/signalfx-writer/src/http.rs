// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! HTTP client construction shared by every backend.
//!
//! Clients pool connections (270s idle timeout, 120s TCP keep-alive) and honor an
//! optional HTTPS proxy. HTTP/2 is negotiated over TLS through ALPN, plain-text
//! endpoints talk HTTP/1.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::collections::BTreeMap;
use std::error::Error;
use std::time::Duration;
use tracing::{error, warn};

#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    pub timeout: Duration,
    pub https_proxy: Option<String>,
    pub skip_tls_verify: bool,
}

/// Builds a client for `options`. An unusable proxy falls back to a direct connection.
#[must_use]
pub fn build_client(options: &ClientOptions) -> reqwest::Client {
    match build_client_inner(options, true) {
        Ok(client) => client,
        Err(e) => {
            error!(
                "Unable to parse proxy configuration: {}, falling back to direct connection",
                e
            );
            match build_client_inner(options, false) {
                Ok(client) => client,
                Err(inner) => {
                    error!(
                        "Failed to build HTTP client without proxy: {}, using reqwest defaults",
                        inner
                    );
                    reqwest::Client::new()
                }
            }
        }
    }
}

fn build_client_inner(
    options: &ClientOptions,
    allow_proxy: bool,
) -> Result<reqwest::Client, Box<dyn Error>> {
    let mut client = reqwest::Client::builder()
        .pool_idle_timeout(Some(Duration::from_secs(270)))
        .tcp_keepalive(Some(Duration::from_secs(120)));

    if !options.timeout.is_zero() {
        client = client.timeout(options.timeout);
    }

    if options.skip_tls_verify {
        client = client.danger_accept_invalid_certs(true);
    }

    if allow_proxy {
        if let Some(https_uri) = &options.https_proxy {
            let proxy = reqwest::Proxy::https(https_uri.clone())?;
            client = client.proxy(proxy);
        }
    }

    Ok(client.build()?)
}

/// Converts configured extra headers, skipping (and logging) any that are not valid HTTP.
#[must_use]
pub fn header_map(headers: &BTreeMap<String, String>) -> HeaderMap {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                map.insert(name, value);
            }
            _ => warn!("Ignoring invalid extra header {name}"),
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_map_skips_invalid_headers() {
        let headers = BTreeMap::from([
            ("X-Good".to_string(), "yes".to_string()),
            ("bad header".to_string(), "no".to_string()),
            ("X-Bad-Value".to_string(), "a\nb".to_string()),
        ]);
        let map = header_map(&headers);

        assert_eq!(map.len(), 1);
        assert_eq!(map.get("x-good").map(|v| v.as_bytes()), Some(&b"yes"[..]));
    }

    #[test]
    fn test_invalid_proxy_falls_back() {
        let options = ClientOptions {
            timeout: Duration::from_secs(1),
            https_proxy: Some("::not a url::".to_string()),
            skip_tls_verify: false,
        };
        assert!(build_client_inner(&options, true).is_err());
        let _client = build_client(&options);
    }
}
