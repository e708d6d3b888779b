// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! One writer per enabled backend.
//!
//! A backend owns its own copy of every item: datapoints and spans go through
//! [`BatchWriter`]s, events are buffered and flushed on an interval, and dimension
//! updates are handed to the [`DimensionClient`] (SignalFx only).

use crate::batch_writer::{BatchStats, BatchWriter, BatchWriterConfig, PreprocessFn, SendFn};
use crate::config::{SplunkConfig, WriterConfig};
use crate::dimension::Dimension;
use crate::dimension_client::DimensionClient;
use crate::errors::ConfigError;
use crate::http::{build_client, ClientOptions};
use crate::model::{Datapoint, Event, Span};
use crate::processor::Processor;
use crate::signalfx::SignalFxSink;
use crate::sink::Sink;
use crate::splunk::SplunkSink;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Events held between flushes before new ones are dropped.
pub const EVENT_BUFFER_CAPACITY: usize = 1000;

/// Receiving ends of one backend's input channels.
#[derive(Debug)]
pub struct BackendChannels {
    pub datapoints: mpsc::Receiver<Vec<Datapoint>>,
    pub events: mpsc::Receiver<Event>,
    pub dimensions: mpsc::Receiver<Dimension>,
    pub spans: mpsc::Receiver<Vec<Span>>,
}

#[derive(Debug, Clone, Copy)]
struct Limits {
    max_buffered: usize,
    max_requests: usize,
    max_batch_size: usize,
}

pub struct BackendWriter {
    sink: Arc<dyn Sink>,
    processor: Arc<Processor>,
    config: Arc<WriterConfig>,
    limits: Limits,
    dimension_client: Option<DimensionClient>,
    datapoint_stats: Arc<BatchStats>,
    span_stats: Arc<BatchStats>,
    event_stats: Arc<BatchStats>,
}

impl BackendWriter {
    #[must_use]
    pub fn new(
        sink: Arc<dyn Sink>,
        processor: Arc<Processor>,
        config: Arc<WriterConfig>,
        dimension_client: Option<DimensionClient>,
    ) -> Self {
        let limits = Limits {
            max_buffered: config.max_datapoints_buffered,
            max_requests: config.max_requests,
            max_batch_size: config.datapoint_max_batch_size,
        };
        Self {
            sink,
            processor,
            config,
            limits,
            dimension_client,
            datapoint_stats: Arc::new(BatchStats::default()),
            span_stats: Arc::new(BatchStats::default()),
            event_stats: Arc::new(BatchStats::default()),
        }
    }

    /// SignalFx ingest plus the dimension API.
    pub fn signalfx(
        config: Arc<WriterConfig>,
        processor: Arc<Processor>,
        cancel: CancellationToken,
    ) -> Result<Self, ConfigError> {
        let token = config.access_token()?;
        let client = build_client(&ClientOptions {
            timeout: config.timeout(),
            https_proxy: config.https_proxy.clone(),
            skip_tls_verify: false,
        });
        let sink = SignalFxSink::new(&config, token.clone(), client)?;
        let dimension_client = DimensionClient::new(
            config.dimension_client_config()?,
            config.property_filters()?,
            token,
            cancel,
        );
        Ok(Self::new(
            Arc::new(sink),
            processor,
            config,
            Some(dimension_client),
        ))
    }

    /// Splunk HEC. Zero limits in `splunk` inherit the writer's.
    pub fn splunk(
        config: Arc<WriterConfig>,
        splunk: &SplunkConfig,
        processor: Arc<Processor>,
    ) -> Result<Self, ConfigError> {
        let client = build_client(&ClientOptions {
            timeout: config.timeout(),
            https_proxy: config.https_proxy.clone(),
            skip_tls_verify: splunk.skip_tls_verify,
        });
        let sink = SplunkSink::new(splunk.clone(), client).map_err(|source| {
            ConfigError::InvalidUrl {
                field: "splunk.url",
                source,
            }
        })?;

        let mut writer = Self::new(Arc::new(sink), processor, Arc::clone(&config), None);
        writer.limits = Limits {
            max_buffered: nonzero_or(splunk.max_buffered, config.max_datapoints_buffered),
            max_requests: nonzero_or(splunk.max_requests, config.max_requests),
            max_batch_size: nonzero_or(splunk.max_batch_size, config.datapoint_max_batch_size),
        };
        Ok(writer)
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.sink.name()
    }

    #[must_use]
    pub fn dimension_client(&self) -> Option<&DimensionClient> {
        self.dimension_client.as_ref()
    }

    #[must_use]
    pub fn datapoint_stats(&self) -> Arc<BatchStats> {
        Arc::clone(&self.datapoint_stats)
    }

    #[must_use]
    pub fn span_stats(&self) -> Arc<BatchStats> {
        Arc::clone(&self.span_stats)
    }

    #[must_use]
    pub fn event_stats(&self) -> Arc<BatchStats> {
        Arc::clone(&self.event_stats)
    }

    /// Spawns the tasks that consume `channels`. Each one stops when `cancel` fires, or
    /// once its inputs are closed and everything it buffered has been sent.
    ///
    /// The dimension client's consumer is started separately, see
    /// [`DimensionClient::start`].
    pub fn start(&self, channels: BackendChannels, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        let BackendChannels {
            datapoints,
            events,
            dimensions,
            spans,
        } = channels;

        let mut handles = vec![
            tokio::spawn(
                self.datapoint_writer()
                    .run(datapoints, cancel.clone()),
            ),
            tokio::spawn(self.span_writer().run(spans, cancel.clone())),
        ];

        let listener = EventAndDimensionListener {
            sink: Arc::clone(&self.sink),
            processor: Arc::clone(&self.processor),
            dimension_client: self.dimension_client.clone(),
            stats: Arc::clone(&self.event_stats),
            log_events: self.config.log_events,
        };
        let interval = self.config.event_send_interval();
        handles.push(tokio::spawn(listener.run(
            events,
            dimensions,
            interval,
            cancel.clone(),
        )));

        debug!(backend = self.name(), "Backend writer started");
        handles
    }

    fn datapoint_writer(&self) -> BatchWriter<Datapoint> {
        let processor = Arc::clone(&self.processor);
        let log_datapoints = self.config.log_datapoints;
        let log_dropped = self.config.log_dropped_datapoints;
        let preprocess: PreprocessFn<Datapoint> = Arc::new(move |dp: &mut Datapoint| {
            if !processor.preprocess_datapoint(dp) {
                if log_dropped {
                    debug!(metric = %dp.metric, "Dropping excluded datapoint");
                }
                return false;
            }
            if log_datapoints {
                debug!(datapoint = ?dp, "Sending datapoint");
            }
            true
        });

        let sink = Arc::clone(&self.sink);
        let send: SendFn<Datapoint> = Arc::new(move |batch: Vec<Datapoint>| {
            let sink = Arc::clone(&sink);
            Box::pin(async move { sink.send_datapoints(&batch).await })
        });

        BatchWriter::new(
            BatchWriterConfig {
                name: "datapoints",
                max_buffered: self.limits.max_buffered,
                max_batch_size: self.limits.max_batch_size,
                max_requests: self.limits.max_requests,
            },
            preprocess,
            send,
        )
        .with_stats(Arc::clone(&self.datapoint_stats))
    }

    fn span_writer(&self) -> BatchWriter<Span> {
        let processor = Arc::clone(&self.processor);
        let log_spans = self.config.log_trace_spans;
        let preprocess: PreprocessFn<Span> = Arc::new(move |span: &mut Span| {
            processor.preprocess_span(span);
            if log_spans {
                debug!(span = ?span, "Sending trace span");
            }
            true
        });

        let sink = Arc::clone(&self.sink);
        let send: SendFn<Span> = Arc::new(move |batch: Vec<Span>| {
            let sink = Arc::clone(&sink);
            Box::pin(async move { sink.send_spans(&batch).await })
        });

        BatchWriter::new(
            BatchWriterConfig {
                name: "trace spans",
                max_buffered: self.config.max_trace_spans_in_flight,
                max_batch_size: self.config.trace_span_max_batch_size,
                max_requests: self.limits.max_requests,
            },
            preprocess,
            send,
        )
        .with_stats(Arc::clone(&self.span_stats))
    }
}

fn nonzero_or(value: usize, fallback: usize) -> usize {
    if value == 0 {
        fallback
    } else {
        value
    }
}

struct EventAndDimensionListener {
    sink: Arc<dyn Sink>,
    processor: Arc<Processor>,
    dimension_client: Option<DimensionClient>,
    stats: Arc<BatchStats>,
    log_events: bool,
}

impl EventAndDimensionListener {
    async fn run(
        self,
        mut events: mpsc::Receiver<Event>,
        mut dimensions: mpsc::Receiver<Dimension>,
        interval: std::time::Duration,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut buffer: Vec<Event> = Vec::with_capacity(EVENT_BUFFER_CAPACITY);
        let mut sends = JoinSet::new();
        let mut events_open = true;
        let mut dimensions_open = true;

        while events_open || dimensions_open {
            tokio::select! {
                () = cancel.cancelled() => {
                    sends.detach_all();
                    return;
                }
                event = events.recv(), if events_open => match event {
                    Some(event) => self.buffer_event(&mut buffer, event),
                    None => events_open = false,
                },
                dim = dimensions.recv(), if dimensions_open => match dim {
                    Some(dim) => self.accept_dimension(dim),
                    None => dimensions_open = false,
                },
                _ = ticker.tick() => self.flush(&mut buffer, &mut sends),
                Some(result) = sends.join_next(), if !sends.is_empty() => log_join_error(result),
            }
        }

        self.flush(&mut buffer, &mut sends);
        let settled = async {
            while let Some(result) = sends.join_next().await {
                log_join_error(result);
            }
        };
        tokio::select! {
            () = cancel.cancelled() => {}
            () = settled => {}
        }
        sends.detach_all();
        debug!(backend = self.sink.name(), "Event listener stopped");
    }

    fn buffer_event(&self, buffer: &mut Vec<Event>, event: Event) {
        if buffer.len() >= EVENT_BUFFER_CAPACITY {
            self.stats.items_overwritten.fetch_add(1, Ordering::Relaxed);
            error!(
                event_type = %event.event_type,
                event_buffer_length = buffer.len(),
                "Dropping event due to overfull buffer"
            );
            return;
        }
        buffer.push(event);
    }

    fn flush(&self, buffer: &mut Vec<Event>, sends: &mut JoinSet<()>) {
        if buffer.is_empty() {
            return;
        }
        let batch = std::mem::replace(buffer, Vec::with_capacity(EVENT_BUFFER_CAPACITY));
        self.spawn_event_send(batch, sends);
    }

    fn spawn_event_send(&self, mut batch: Vec<Event>, sends: &mut JoinSet<()>) {
        let sink = Arc::clone(&self.sink);
        let processor = Arc::clone(&self.processor);
        let stats = Arc::clone(&self.stats);
        let log_events = self.log_events;
        sends.spawn(async move {
            for event in &mut batch {
                processor.preprocess_event(event);
                if log_events {
                    debug!(event = ?event, "Sending event");
                }
            }
            match sink.send_events(&batch).await {
                Ok(()) => {
                    stats
                        .items_sent
                        .fetch_add(batch.len() as u64, Ordering::Relaxed);
                    debug!(backend = sink.name(), "Sent {} events", batch.len());
                }
                Err(e) => stats.record_failure("events", batch.len(), &e),
            }
        });
    }

    fn accept_dimension(&self, dim: Dimension) {
        let Some(client) = &self.dimension_client else {
            return;
        };
        if let Err(e) = client.accept_dimension(dim.clone()) {
            warn!(
                dim_name = %dim.name,
                dim_value = %dim.value,
                "Dropping dimension update: {e}"
            );
        }
    }
}

fn log_join_error(result: Result<(), JoinError>) {
    if let Err(e) = result {
        error!("Event send task failed: {e}");
    }
}
