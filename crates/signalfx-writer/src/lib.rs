// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # SignalFx Writer
//!
//! Ships telemetry produced by many concurrent monitors to one or more backends.
//!
//! ## Overview
//!
//! - **Dimension updates**: debounced, deduplicated and retried property/tag updates
//!   sent to the SignalFx dimension API (see [`dimension_client`])
//! - **Datapoints, events and spans**: preprocessed, batched and shipped to SignalFx
//!   ingest and/or a Splunk HTTP Event Collector (see [`backend`])
//! - **Fan-out**: when several backends are enabled every item is cloned onto a
//!   per-backend channel (see [`fanout`] and [`multi_writer`])
//!
//! ## Architecture
//!
//! ```text
//!   monitors ──> WriterHandle ──> fan-out ──┬──> SignalFx backend ──> DimensionClient
//!                                           └──> Splunk backend
//! ```

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod access_token;
pub mod backend;
pub mod batch_writer;
pub mod config;
pub mod dedup;
pub mod delay_queue;
pub mod dimension;
pub mod dimension_client;
pub mod errors;
pub mod fanout;
pub mod http;
pub mod logger;
pub mod model;
pub mod multi_writer;
pub mod processor;
pub mod property_filters;
pub mod request_sender;
pub mod signalfx;
pub mod sink;
pub mod splunk;
mod throttle;

/// Writer version, reported on every span this writer ships.
pub const WRITER_VERSION: &str = env!("CARGO_PKG_VERSION");
