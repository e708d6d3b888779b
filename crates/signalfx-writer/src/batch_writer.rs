// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded buffering and concurrent batch sending for one item type of one backend.
//!
//! Items received on the input channel are preprocessed, then buffered up to
//! `max_buffered`; past that the oldest buffered item is overwritten. Whenever fewer than
//! `max_requests` sends are running, the buffer is drained into batches of at most
//! `max_batch_size`. Failed batches are logged and discarded.

use crate::errors::ShippingError;
use crate::throttle::LogThrottle;
use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Returns `false` to drop the item.
pub type PreprocessFn<T> = Arc<dyn Fn(&mut T) -> bool + Send + Sync>;
pub type SendFn<T> = Arc<dyn Fn(Vec<T>) -> BoxFuture<'static, Result<(), ShippingError>> + Send + Sync>;

#[derive(Debug, Clone, Copy)]
pub struct BatchWriterConfig {
    pub name: &'static str,
    pub max_buffered: usize,
    pub max_batch_size: usize,
    pub max_requests: usize,
}

#[derive(Debug, Default)]
pub struct BatchStats {
    pub items_sent: AtomicU64,
    pub items_failed: AtomicU64,
    pub items_rejected: AtomicU64,
    pub items_overwritten: AtomicU64,
    pub items_filtered: AtomicU64,
    pub batches_sent: AtomicU64,
}

impl BatchStats {
    #[must_use]
    pub fn items_sent(&self) -> u64 {
        self.items_sent.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn items_failed(&self) -> u64 {
        self.items_failed.load(Ordering::Relaxed)
    }

    /// Items in batches the backend refused outright (bad request, auth, payload).
    #[must_use]
    pub fn items_rejected(&self) -> u64 {
        self.items_rejected.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn items_overwritten(&self) -> u64 {
        self.items_overwritten.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn items_filtered(&self) -> u64 {
        self.items_filtered.load(Ordering::Relaxed)
    }

    /// Counts a discarded batch. Rejections are logged louder than transient failures
    /// since resending the same items would never succeed.
    pub(crate) fn record_failure(&self, writer: &'static str, count: usize, e: &ShippingError) {
        if e.is_permanent() {
            self.items_rejected.fetch_add(count as u64, Ordering::Relaxed);
            error!(writer, count, "Backend rejected batch, dropping it: {e}");
        } else {
            self.items_failed.fetch_add(count as u64, Ordering::Relaxed);
            warn!(writer, count, "Error shipping batch: {e}");
        }
    }
}

pub struct BatchWriter<T> {
    config: BatchWriterConfig,
    preprocess: PreprocessFn<T>,
    send: SendFn<T>,
    buffer: VecDeque<T>,
    stats: Arc<BatchStats>,
    throttle: LogThrottle,
}

impl<T: Send + 'static> BatchWriter<T> {
    #[must_use]
    pub fn new(config: BatchWriterConfig, preprocess: PreprocessFn<T>, send: SendFn<T>) -> Self {
        let config = BatchWriterConfig {
            max_buffered: config.max_buffered.max(1),
            max_batch_size: config.max_batch_size.max(1),
            max_requests: config.max_requests.max(1),
            ..config
        };
        Self {
            config,
            preprocess,
            send,
            buffer: VecDeque::new(),
            stats: Arc::new(BatchStats::default()),
            throttle: LogThrottle::default(),
        }
    }

    /// Reports into `stats` instead of a fresh set of counters.
    #[must_use]
    pub fn with_stats(mut self, stats: Arc<BatchStats>) -> Self {
        self.stats = stats;
        self
    }

    #[must_use]
    pub fn stats(&self) -> Arc<BatchStats> {
        Arc::clone(&self.stats)
    }

    /// Runs until `cancel` fires or the input channel closes. Sends still in flight at
    /// that point are left to finish on their own.
    pub async fn run(mut self, mut rx: mpsc::Receiver<Vec<T>>, cancel: CancellationToken) {
        let mut in_flight: JoinSet<(usize, Result<(), ShippingError>)> = JoinSet::new();

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                received = rx.recv() => {
                    let Some(items) = received else {
                        // input closed: flush what's left and wait for it
                        while !self.buffer.is_empty() || !in_flight.is_empty() {
                            self.dispatch(&mut in_flight);
                            if let Some(result) = in_flight.join_next().await {
                                self.record(result);
                            }
                        }
                        break;
                    };
                    self.buffer_items(items);
                }
                Some(result) = in_flight.join_next(), if !in_flight.is_empty() => {
                    self.record(result);
                }
            }
            self.dispatch(&mut in_flight);
        }

        in_flight.detach_all();
        debug!(writer = self.config.name, "Batch writer stopped");
    }

    fn buffer_items(&mut self, items: Vec<T>) {
        for mut item in items {
            if !(self.preprocess)(&mut item) {
                self.stats.items_filtered.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            if self.buffer.len() >= self.config.max_buffered {
                self.buffer.pop_front();
                self.stats.items_overwritten.fetch_add(1, Ordering::Relaxed);
                if let Some(suppressed) = self.throttle.check(self.config.name) {
                    warn!(
                        writer = self.config.name,
                        suppressed,
                        "An item was overwritten in the write buffer, please consider increasing the max buffered option to something greater than {}",
                        self.config.max_buffered
                    );
                }
            }
            self.buffer.push_back(item);
        }
    }

    fn dispatch(&mut self, in_flight: &mut JoinSet<(usize, Result<(), ShippingError>)>) {
        while in_flight.len() < self.config.max_requests && !self.buffer.is_empty() {
            let take = self.buffer.len().min(self.config.max_batch_size);
            let batch: Vec<T> = self.buffer.drain(..take).collect();
            let send = Arc::clone(&self.send);
            in_flight.spawn(async move { (take, send(batch).await) });
        }
    }

    fn record(
        &self,
        result: Result<(usize, Result<(), ShippingError>), tokio::task::JoinError>,
    ) {
        match result {
            Ok((count, Ok(()))) => {
                self.stats.items_sent.fetch_add(count as u64, Ordering::Relaxed);
                self.stats.batches_sent.fetch_add(1, Ordering::Relaxed);
                debug!(writer = self.config.name, count, "Sent batch");
            }
            Ok((count, Err(e))) => self.stats.record_failure(self.config.name, count, &e),
            Err(e) => {
                error!(writer = self.config.name, "Batch send task failed: {e}");
            }
        }
    }
}
