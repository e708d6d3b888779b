// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use reqwest::StatusCode;

/// Errors returned to dimension producers by the accept path.
#[derive(Debug, thiserror::Error)]
pub enum DimensionError {
    #[error("dimension {name}/{value} is missing key or value, cannot send")]
    InvalidDimension { name: String, value: String },

    #[error("dropped dimension update, propertiesMaxBuffered exceeded")]
    BufferFull,

    #[error("could not build dimension request: {0}")]
    RequestBuild(String),

    #[error("dimension client is stopped")]
    ClientStopped,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("Invalid URL in {field}: {source}")]
    InvalidUrl {
        field: &'static str,
        source: url::ParseError,
    },

    #[error("Invalid filter: {0}")]
    InvalidFilter(#[from] FilterError),
}

#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error("invalid regex pattern {pattern:?}: {source}")]
    InvalidRegex {
        pattern: String,
        source: regex::Error,
    },

    #[error("invalid glob pattern {pattern:?}: {source}")]
    InvalidGlob {
        pattern: String,
        source: globset::Error,
    },
}

/// Failure to deliver a batch to a backend.
#[derive(Debug, thiserror::Error)]
pub enum ShippingError {
    #[error("failed to prepare payload: {0}")]
    Payload(String),

    #[error("error shipping data ({0:?}): {1}")]
    Destination(Option<StatusCode>, String),
}

impl ShippingError {
    /// A permanent error will not go away by sending the same payload again.
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::Payload(_) => true,
            Self::Destination(Some(code), _) => {
                code.is_client_error()
                    && *code != StatusCode::NOT_FOUND
                    && *code != StatusCode::REQUEST_TIMEOUT
                    && *code != StatusCode::TOO_MANY_REQUESTS
            }
            Self::Destination(None, _) => false,
        }
    }
}

/// Error returned by `WriterHandle` when an item can't be handed to the writer.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("writer {0} channel is full")]
    Full(&'static str),

    #[error("writer {0} channel is closed")]
    Closed(&'static str),
}
