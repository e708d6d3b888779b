// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

//! Reads JSON-lines records from stdin and writes them to the configured backends.
//!
//! The configuration file path comes from the first argument or `SFX_WRITER_CONFIG`.
//! When stdin closes or Ctrl-C arrives, buffered data and the dimension updates still
//! inside their send delay are sent before exiting, for up to twice the request timeout.

use serde::Deserialize;
use std::{env, path::PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use signalfx_writer::{
    backend::BackendWriter,
    config::WriterConfig,
    dimension::Dimension,
    logger::Formatter,
    model::{Datapoint, Event, Span},
    multi_writer::{MultiWriter, WriterHandle},
};

/// One line of input.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Record {
    Dimension(Dimension),
    Datapoints { datapoints: Vec<Datapoint> },
    Event(Event),
    Spans { spans: Vec<Span> },
}

#[tokio::main]
pub async fn main() {
    let config_path = env::args()
        .nth(1)
        .or_else(|| env::var("SFX_WRITER_CONFIG").ok())
        .map(PathBuf::from);

    // logging is set up from the configuration, so this error can only go to stderr
    let config = match WriterConfig::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading writer configuration: {e}");
            return;
        }
    };

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter(&config.log_level))
                .expect("could not parse log level in configuration"),
        )
        .event_format(Formatter::default())
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let close_timeout = config.timeout() * 2;
    let (mut writer, handle) = match MultiWriter::new(config, CancellationToken::new()) {
        Ok(pair) => pair,
        Err(e) => {
            error!("Error creating writer: {e}");
            return;
        }
    };
    writer.start();
    let dimension_client = writer
        .backends()
        .iter()
        .find_map(BackendWriter::dimension_client)
        .cloned();

    tokio::select! {
        () = read_records(handle) => info!("Input closed, shutting down"),
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Unable to listen for shutdown signal: {e}");
            }
            info!("Received shutdown signal");
        }
    }

    // the handle is gone with `read_records`, so the pipeline can run dry
    writer.close(close_timeout).await;
    if let Some(client) = dimension_client {
        info!(stats = ?client.stats(), "Dimension client stats");
    }
}

fn env_filter(log_level: &str) -> String {
    format!("h2=off,hyper=off,rustls=off,{log_level}")
}

async fn read_records(handle: WriterHandle) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return,
            Err(e) => {
                error!("Error reading input: {e}");
                return;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let record = match serde_json::from_str::<Record>(&line) {
            Ok(record) => record,
            Err(e) => {
                warn!("Skipping malformed record: {e}");
                continue;
            }
        };

        let result = match record {
            Record::Dimension(dim) => handle.send_dimension(dim),
            Record::Datapoints { datapoints } => handle.send_datapoints(datapoints),
            Record::Event(event) => handle.send_event(event),
            Record::Spans { spans } => handle.send_spans(spans),
        };
        if let Err(e) = result {
            warn!("Dropping record: {e}");
        }
    }
}
