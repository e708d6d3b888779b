// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Front door of the writer pipeline.
//!
//! Producers hold a cloneable [`WriterHandle`] and never block: sends either succeed
//! immediately or fail with [`SendError`]. With one backend the input channels feed it
//! directly; with several, a fan-out task per channel gives each backend its own copy.
//!
//! [`MultiWriter::shutdown`] stops at once. [`MultiWriter::close`] is the graceful path:
//! once every handle is dropped it lets the buffered data and the delayed dimension
//! updates go out first.

use crate::backend::{BackendChannels, BackendWriter};
use crate::config::WriterConfig;
use crate::dimension::Dimension;
use crate::dimension_client::{DimensionClient, DimensionClientStats};
use crate::errors::{ConfigError, SendError};
use crate::fanout::{spawn_broadcast, FanoutStats};
use crate::model::{Datapoint, Event, Span};
use crate::processor::Processor;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const DATAPOINT_CHANNEL_CAPACITY: usize = 3000;
pub const EVENT_CHANNEL_CAPACITY: usize = 1000;
pub const DIMENSION_CHANNEL_CAPACITY: usize = 1000;
pub const SPAN_CHANNEL_CAPACITY: usize = 3000;

#[derive(Debug, Clone)]
pub struct WriterHandle {
    datapoints: mpsc::Sender<Vec<Datapoint>>,
    events: mpsc::Sender<Event>,
    dimensions: mpsc::Sender<Dimension>,
    spans: mpsc::Sender<Vec<Span>>,
}

fn try_send<T>(tx: &mpsc::Sender<T>, item: T, kind: &'static str) -> Result<(), SendError> {
    tx.try_send(item).map_err(|e| match e {
        TrySendError::Full(_) => SendError::Full(kind),
        TrySendError::Closed(_) => SendError::Closed(kind),
    })
}

impl WriterHandle {
    pub fn send_datapoints(&self, datapoints: Vec<Datapoint>) -> Result<(), SendError> {
        try_send(&self.datapoints, datapoints, "datapoints")
    }

    pub fn send_event(&self, event: Event) -> Result<(), SendError> {
        try_send(&self.events, event, "events")
    }

    pub fn send_dimension(&self, dimension: Dimension) -> Result<(), SendError> {
        try_send(&self.dimensions, dimension, "dimensions")
    }

    pub fn send_spans(&self, spans: Vec<Span>) -> Result<(), SendError> {
        try_send(&self.spans, spans, "spans")
    }
}

struct Inputs {
    datapoints: mpsc::Receiver<Vec<Datapoint>>,
    events: mpsc::Receiver<Event>,
    dimensions: mpsc::Receiver<Dimension>,
    spans: mpsc::Receiver<Vec<Span>>,
}

/// Per channel kind, how many backend copies the fan-out dropped.
#[derive(Debug, Default)]
pub struct FanoutDrops {
    pub datapoints: Arc<FanoutStats>,
    pub events: Arc<FanoutStats>,
    pub dimensions: Arc<FanoutStats>,
    pub spans: Arc<FanoutStats>,
}

pub struct MultiWriter {
    backends: Vec<BackendWriter>,
    inputs: Option<Inputs>,
    cancel: CancellationToken,
    /// Tasks fed by the input channels.
    handles: Vec<JoinHandle<()>>,
    /// Dimension client consumers, which only stop on cancellation.
    dimension_consumers: Vec<JoinHandle<()>>,
    fanout_drops: FanoutDrops,
}

impl MultiWriter {
    /// Builds every backend enabled in `config`.
    pub fn new(
        config: WriterConfig,
        cancel: CancellationToken,
    ) -> Result<(Self, WriterHandle), ConfigError> {
        config.validate()?;
        let config = Arc::new(config);
        let processor = Arc::new(Processor::new(&config)?);

        let mut backends = Vec::new();
        if config.is_signalfx_output_enabled() {
            backends.push(BackendWriter::signalfx(
                Arc::clone(&config),
                Arc::clone(&processor),
                cancel.child_token(),
            )?);
        }
        if let Some(splunk) = config.splunk.as_ref().filter(|s| s.enabled) {
            backends.push(BackendWriter::splunk(
                Arc::clone(&config),
                splunk,
                Arc::clone(&processor),
            )?);
        }

        Ok(Self::with_backends(backends, cancel))
    }

    /// Wires already-built backends behind a new set of input channels.
    #[must_use]
    pub fn with_backends(
        backends: Vec<BackendWriter>,
        cancel: CancellationToken,
    ) -> (Self, WriterHandle) {
        let (dp_tx, datapoints) = mpsc::channel(DATAPOINT_CHANNEL_CAPACITY);
        let (event_tx, events) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (dim_tx, dimensions) = mpsc::channel(DIMENSION_CHANNEL_CAPACITY);
        let (span_tx, spans) = mpsc::channel(SPAN_CHANNEL_CAPACITY);

        let writer = Self {
            backends,
            inputs: Some(Inputs {
                datapoints,
                events,
                dimensions,
                spans,
            }),
            cancel,
            handles: Vec::new(),
            dimension_consumers: Vec::new(),
            fanout_drops: FanoutDrops::default(),
        };
        let handle = WriterHandle {
            datapoints: dp_tx,
            events: event_tx,
            dimensions: dim_tx,
            spans: span_tx,
        };
        (writer, handle)
    }

    /// Starts every backend (and the fan-out tasks when there is more than one).
    /// Calling it again does nothing.
    pub fn start(&mut self) {
        let Some(inputs) = self.inputs.take() else {
            return;
        };

        self.dimension_consumers = self
            .backends
            .iter()
            .filter_map(BackendWriter::dimension_client)
            .map(DimensionClient::start)
            .collect();

        match self.backends.as_slice() {
            [] => {
                error!("No backends are enabled, nothing will be written");
            }
            [backend] => {
                let channels = BackendChannels {
                    datapoints: inputs.datapoints,
                    events: inputs.events,
                    dimensions: inputs.dimensions,
                    spans: inputs.spans,
                };
                self.handles.extend(backend.start(channels, &self.cancel));
            }
            backends => {
                let mut dp_outputs = Vec::with_capacity(backends.len());
                let mut event_outputs = Vec::with_capacity(backends.len());
                let mut dim_outputs = Vec::with_capacity(backends.len());
                let mut span_outputs = Vec::with_capacity(backends.len());

                for backend in backends {
                    let (dp_tx, datapoints) = mpsc::channel(DATAPOINT_CHANNEL_CAPACITY);
                    let (event_tx, events) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
                    let (dim_tx, dimensions) = mpsc::channel(DIMENSION_CHANNEL_CAPACITY);
                    let (span_tx, spans) = mpsc::channel(SPAN_CHANNEL_CAPACITY);
                    dp_outputs.push(dp_tx);
                    event_outputs.push(event_tx);
                    dim_outputs.push(dim_tx);
                    span_outputs.push(span_tx);

                    let channels = BackendChannels {
                        datapoints,
                        events,
                        dimensions,
                        spans,
                    };
                    self.handles.extend(backend.start(channels, &self.cancel));
                }

                let drops = &self.fanout_drops;
                self.handles.extend([
                    spawn_broadcast(
                        "datapoints",
                        inputs.datapoints,
                        dp_outputs,
                        Arc::clone(&drops.datapoints),
                        self.cancel.clone(),
                    ),
                    spawn_broadcast(
                        "events",
                        inputs.events,
                        event_outputs,
                        Arc::clone(&drops.events),
                        self.cancel.clone(),
                    ),
                    spawn_broadcast(
                        "dimensions",
                        inputs.dimensions,
                        dim_outputs,
                        Arc::clone(&drops.dimensions),
                        self.cancel.clone(),
                    ),
                    spawn_broadcast(
                        "spans",
                        inputs.spans,
                        span_outputs,
                        Arc::clone(&drops.spans),
                        self.cancel.clone(),
                    ),
                ]);
            }
        }

        info!(
            backends = ?self.backends.iter().map(BackendWriter::name).collect::<Vec<_>>(),
            "Writer started"
        );
    }

    /// Stops gracefully. Every [`WriterHandle`] must already be dropped, otherwise the
    /// input tasks keep waiting and the whole of `max_wait` is spent.
    ///
    /// Waits for the backends to send what they buffered, then sends the dimension
    /// updates still inside their send delay, and finally shuts down. Whatever is left
    /// when `max_wait` runs out is dropped.
    pub async fn close(mut self, max_wait: Duration) {
        let deadline = Instant::now() + max_wait;

        // tasks still running when time runs out stay behind for `shutdown` to join
        let flushed = async {
            while let Some(handle) = self.handles.last_mut() {
                let result = handle.await;
                self.handles.pop();
                if let Err(e) = result {
                    error!("Writer task failed while closing: {e}");
                }
            }
        };
        if tokio::time::timeout_at(deadline, flushed).await.is_err() {
            warn!("Timed out sending buffered data");
        }

        for client in self.backends.iter().filter_map(BackendWriter::dimension_client) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !client.drain(remaining).await {
                warn!(
                    pending = client.currently_delayed(),
                    "Timed out sending delayed dimension updates"
                );
            }
        }

        self.shutdown().await;
    }

    /// Cancels the whole pipeline and waits for its tasks. In-flight requests are not
    /// waited for.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        let handles = self.handles.drain(..).chain(self.dimension_consumers.drain(..));
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Writer task failed during shutdown: {e}");
            }
        }
        debug!("Writer stopped");
    }

    #[must_use]
    pub fn backends(&self) -> &[BackendWriter] {
        &self.backends
    }

    #[must_use]
    pub fn fanout_drops(&self) -> &FanoutDrops {
        &self.fanout_drops
    }

    /// Counters of the SignalFx dimension client, if that backend is enabled.
    #[must_use]
    pub fn dimension_stats(&self) -> Option<DimensionClientStats> {
        self.backends
            .iter()
            .find_map(BackendWriter::dimension_client)
            .map(|client| client.stats())
    }
}
