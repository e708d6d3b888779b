// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use reqwest::header::{HeaderValue, InvalidHeaderValue};
use reqwest::RequestBuilder;
use std::fmt;

pub const TOKEN_HEADER: &str = "X-SF-TOKEN";

/// The SignalFx access token, checked once and attached to every request as `X-SF-TOKEN`.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    header: HeaderValue,
}

impl AccessToken {
    pub fn new(token: &str) -> Result<Self, InvalidHeaderValue> {
        let mut header = HeaderValue::from_str(token)?;
        header.set_sensitive(true);
        Ok(Self { header })
    }

    pub fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        request.header(TOKEN_HEADER, self.header.clone())
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken(<redacted>)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_is_sent_as_sensitive_header() {
        let token = AccessToken::new("abc123").expect("valid token");
        let request = token
            .authorize(reqwest::Client::new().get("http://localhost/"))
            .build()
            .expect("request should build");

        let header = request.headers().get(TOKEN_HEADER).expect("token header");
        assert_eq!(header, "abc123");
        assert!(header.is_sensitive());
    }

    #[test]
    fn test_debug_never_prints_token() {
        let token = AccessToken::new("abc123").expect("valid token");
        assert_eq!(format!("{token:?}"), "AccessToken(<redacted>)");
    }

    #[test]
    fn test_control_characters_are_rejected() {
        assert!(AccessToken::new("abc\ndef").is_err());
    }
}
