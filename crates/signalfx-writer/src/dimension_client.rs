// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Debounced, deduplicated and retried dimension property/tag updates.
//!
//! # Lifecycle
//!
//! ```text
//! accept_dimension ──> filters ──> pending set + delay queue ──> consumer task
//!                                    ^  (one entry per key)          │
//!                                    │                   dedup check, request sender
//!                                    └── 404 / 5xx / transport ──────┘
//! ```
//!
//! An update that arrives while another one for the same key is still queued is folded
//! into the queued entry, which keeps its original due time. Successful updates are
//! recorded in the [`Deduplicator`] so no-op updates are never sent.

use crate::access_token::AccessToken;
use crate::dedup::Deduplicator;
use crate::delay_queue::DelayQueue;
use crate::dimension::{DedupIdentity, Dimension, DimensionKey};
use crate::errors::DimensionError;
use crate::http::{build_client, header_map, ClientOptions};
use crate::property_filters::PropertyFilterSet;
use crate::request_sender::{RequestOutcome, RequestSender};
use reqwest::header::{HeaderMap, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

/// Path segments appended to the dimension URL for PATCH (merge) updates.
const PATCH_SUFFIX: [&str; 2] = ["_", "agent"];

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone)]
pub struct DimensionClientConfig {
    pub api_url: Url,
    /// Updates to the same key within this window are coalesced into one request.
    pub send_delay: Duration,
    pub max_buffered: usize,
    pub max_requests: usize,
    pub history_size: usize,
    pub max_retries: u32,
    pub log_updates: bool,
    pub extra_headers: BTreeMap<String, String>,
    pub timeout: Duration,
    pub https_proxy: Option<String>,
}

impl DimensionClientConfig {
    #[must_use]
    pub fn new(api_url: Url) -> Self {
        Self {
            api_url,
            send_delay: Duration::from_secs(30),
            max_buffered: 10_000,
            max_requests: 20,
            history_size: 10_000,
            max_retries: 10,
            log_updates: false,
            extra_headers: BTreeMap::new(),
            timeout: Duration::from_secs(10),
            https_proxy: None,
        }
    }
}

/// Point-in-time copy of the client's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DimensionClientStats {
    pub currently_delayed: u64,
    pub dropped: u64,
    pub flappy_updates: u64,
    pub client_errors: u64,
    pub retried_updates: u64,
    pub retries_exhausted: u64,
    pub invalid_dimensions: u64,
    pub duplicates: u64,
    pub successful_updates: u64,
}

#[derive(Debug, Default)]
struct Counters {
    dropped: AtomicU64,
    flappy_updates: AtomicU64,
    client_errors: AtomicU64,
    retried_updates: AtomicU64,
    retries_exhausted: AtomicU64,
    invalid_dimensions: AtomicU64,
    duplicates: AtomicU64,
    successful_updates: AtomicU64,
}

impl Counters {
    fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug)]
struct PendingDimension {
    dim: Dimension,
    /// Resubmissions this update has already been through.
    retries: u32,
}

/// Every key in `set` has exactly one entry in `queue`.
#[derive(Debug)]
struct Pending {
    set: HashMap<DimensionKey, PendingDimension>,
    queue: DelayQueue<DimensionKey>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PatchBody<'a> {
    custom_properties: &'a BTreeMap<String, String>,
    tags: Vec<String>,
    tags_to_remove: Vec<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ReplaceBody<'a> {
    key: &'a str,
    value: &'a str,
    custom_properties: &'a BTreeMap<String, String>,
    tags: Vec<String>,
}

struct Inner {
    config: DimensionClientConfig,
    filters: PropertyFilterSet,
    token: AccessToken,
    extra_headers: HeaderMap,
    client: reqwest::Client,
    sender: RequestSender,
    dedup: Deduplicator,
    pending: Mutex<Pending>,
    notify: Notify,
    counters: Counters,
    /// Updates accepted but not yet finished: queued, in flight, or about to be retried.
    outstanding: AtomicUsize,
    /// Set by [`DimensionClient::drain`]: queued updates are sent without waiting.
    draining: AtomicBool,
    cancel: CancellationToken,
}

/// Cloneable handle to the dimension update pipeline.
#[derive(Clone)]
pub struct DimensionClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for DimensionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DimensionClient")
            .field("api_url", &self.inner.config.api_url.as_str())
            .field("stats", &self.stats())
            .finish()
    }
}

impl DimensionClient {
    #[must_use]
    pub fn new(
        config: DimensionClientConfig,
        filters: PropertyFilterSet,
        token: AccessToken,
        cancel: CancellationToken,
    ) -> Self {
        let client = build_client(&ClientOptions {
            timeout: config.timeout,
            https_proxy: config.https_proxy.clone(),
            skip_tls_verify: false,
        });
        Self::with_client(config, filters, token, cancel, client)
    }

    #[must_use]
    pub fn with_client(
        config: DimensionClientConfig,
        filters: PropertyFilterSet,
        token: AccessToken,
        cancel: CancellationToken,
        client: reqwest::Client,
    ) -> Self {
        let sender = RequestSender::new(client.clone(), config.max_requests);
        let pending = Pending {
            set: HashMap::new(),
            queue: DelayQueue::new(config.send_delay, config.max_buffered),
        };
        Self {
            inner: Arc::new(Inner {
                extra_headers: header_map(&config.extra_headers),
                dedup: Deduplicator::new(config.history_size),
                filters,
                token,
                client,
                sender,
                pending: Mutex::new(pending),
                notify: Notify::new(),
                counters: Counters::default(),
                outstanding: AtomicUsize::new(0),
                draining: AtomicBool::new(false),
                cancel,
                config,
            }),
        }
    }

    /// Spawns the consumer task. It runs until the cancellation token fires.
    pub fn start(&self) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            debug!("Dimension client started");
            inner.process_queue().await;
            inner.sender.close();
            debug!("Dimension client stopped");
        })
    }

    /// Queues `dim` for sending after the send delay, coalescing it with any update for
    /// the same key that is still waiting.
    ///
    /// Only invalid input and a full buffer are reported. Delivery failures are handled
    /// (and counted) inside the client.
    pub fn accept_dimension(&self, dim: Dimension) -> Result<(), DimensionError> {
        self.inner.accept(dim, 0)
    }

    /// Sends everything still queued without waiting out the send delay, then waits up to
    /// `max_wait` for those requests (and any retries they trigger) to finish. Returns
    /// `false` if updates were still outstanding when the time ran out.
    ///
    /// Updates accepted after this call are sent immediately too.
    pub async fn drain(&self, max_wait: Duration) -> bool {
        let inner = &self.inner;
        inner.draining.store(true, Ordering::Release);
        inner.notify.notify_one();

        let settled = async {
            while inner.outstanding.load(Ordering::Acquire) > 0 {
                tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
            }
        };
        tokio::time::timeout(max_wait, settled).await.is_ok()
    }

    /// Number of keys waiting in the delay queue.
    #[allow(clippy::expect_used)]
    #[must_use]
    pub fn currently_delayed(&self) -> usize {
        self.inner.pending.lock().expect("lock poisoned").set.len()
    }

    #[must_use]
    pub fn stats(&self) -> DimensionClientStats {
        let c = &self.inner.counters;
        DimensionClientStats {
            currently_delayed: self.currently_delayed() as u64,
            dropped: c.dropped.load(Ordering::Relaxed),
            flappy_updates: c.flappy_updates.load(Ordering::Relaxed),
            client_errors: c.client_errors.load(Ordering::Relaxed),
            retried_updates: c.retried_updates.load(Ordering::Relaxed),
            retries_exhausted: c.retries_exhausted.load(Ordering::Relaxed),
            invalid_dimensions: c.invalid_dimensions.load(Ordering::Relaxed),
            duplicates: c.duplicates.load(Ordering::Relaxed),
            successful_updates: c.successful_updates.load(Ordering::Relaxed),
        }
    }

    #[must_use]
    pub fn deduplicator(&self) -> &Deduplicator {
        &self.inner.dedup
    }
}

impl Inner {
    fn accept(&self, dim: Dimension, retries: u32) -> Result<(), DimensionError> {
        if !dim.is_valid() {
            Counters::incr(&self.counters.invalid_dimensions);
            return Err(DimensionError::InvalidDimension {
                name: dim.name,
                value: dim.value,
            });
        }

        if self.cancel.is_cancelled() {
            return Err(DimensionError::ClientStopped);
        }

        let Some(dim) = self.filters.filter_dimension(dim) else {
            return Ok(());
        };

        self.enqueue(dim, retries)
    }

    #[allow(clippy::expect_used)]
    fn enqueue(&self, dim: Dimension, retries: u32) -> Result<(), DimensionError> {
        let key = dim.key();
        let mut pending = self.pending.lock().expect("lock poisoned");

        if let Some(queued) = pending.set.get_mut(&key) {
            Counters::incr(&self.counters.flappy_updates);
            if queued.dim.merge_into_existing != dim.merge_into_existing {
                warn!(
                    dim = %key,
                    "Dimension is updated with both merging and non-merging, which will result in race conditions and inconsistent data"
                );
            }
            fold_into_queued(queued, dim, retries);
            return Ok(());
        }

        if pending.queue.push(key.clone(), Instant::now()).is_err() {
            Counters::incr(&self.counters.dropped);
            return Err(DimensionError::BufferFull);
        }
        pending.set.insert(key, PendingDimension { dim, retries });
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        drop(pending);

        self.notify.notify_one();
        Ok(())
    }

    async fn process_queue(self: &Arc<Self>) {
        loop {
            let next_due = self.next_due();
            let Some(due) = next_due else {
                tokio::select! {
                    () = self.cancel.cancelled() => return,
                    () = self.notify.notified() => continue,
                }
            };

            if !self.draining.load(Ordering::Acquire) {
                tokio::select! {
                    () = self.cancel.cancelled() => return,
                    () = tokio::time::sleep_until(due) => {}
                    // a drain may have started
                    () = self.notify.notified() => continue,
                }
            }

            let Some(entry) = self.take_head(due) else {
                continue;
            };
            // Waiting for a request permit must not hold up shutdown.
            tokio::select! {
                () = self.cancel.cancelled() => return,
                () = self.set_properties_on_dimension(entry) => {}
            }
        }
    }

    #[allow(clippy::expect_used)]
    fn next_due(&self) -> Option<Instant> {
        self.pending.lock().expect("lock poisoned").queue.next_due()
    }

    #[allow(clippy::expect_used)]
    fn take_head(&self, due: Instant) -> Option<PendingDimension> {
        let mut pending = self.pending.lock().expect("lock poisoned");
        let head = pending.queue.pop_due(due)?;
        pending.set.remove(&head.item)
    }

    async fn set_properties_on_dimension(self: &Arc<Self>, entry: PendingDimension) {
        let PendingDimension { dim, retries } = entry;

        if self.dedup.is_duplicate(&dim) {
            Counters::incr(&self.counters.duplicates);
            debug!(dim = %dim.key(), "Skipping duplicate dimension update");
            self.finish();
            return;
        }

        let request = match self.build_request(&dim) {
            Ok(request) => request,
            Err(e) => {
                error!(dim = %dim.key(), "Unable to build dimension request: {e}");
                self.finish();
                return;
            }
        };

        let inner = Arc::clone(self);
        self.sender
            .send(request, move |outcome| {
                inner.handle_outcome(dim, retries, outcome);
            })
            .await;
    }

    fn handle_outcome(&self, dim: Dimension, retries: u32, outcome: RequestOutcome) {
        self.record_outcome(dim, retries, outcome);
        self.finish();
    }

    fn finish(&self) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
    }

    fn record_outcome(&self, dim: Dimension, retries: u32, outcome: RequestOutcome) {
        match outcome {
            RequestOutcome::Success { .. } => {
                self.dedup.add(&dim);
                Counters::incr(&self.counters.successful_updates);
                if self.config.log_updates {
                    info!(dim = %dim.key(), properties = ?dim.properties, tags = ?dim.tags, "Updated dimension");
                }
            }
            RequestOutcome::Failed { status, error } if is_terminal(status) => {
                Counters::incr(&self.counters.client_errors);
                error!(
                    dim = %dim.key(),
                    status = ?status,
                    "Unable to update dimension, not retrying: {error}"
                );
            }
            RequestOutcome::Failed { status, error } => {
                let key = dim.key();
                if retries >= self.config.max_retries {
                    Counters::incr(&self.counters.retries_exhausted);
                    error!(
                        dim = %key,
                        status = ?status,
                        retries,
                        "Unable to update dimension, giving up: {error}"
                    );
                    return;
                }

                warn!(dim = %key, status = ?status, "Unable to update dimension, retrying: {error}");
                Counters::incr(&self.counters.retried_updates);
                if let Err(e) = self.accept(dim, retries + 1) {
                    error!(dim = %key, "Failed to retry dimension update: {e}");
                }
            }
        }
    }

    fn build_request(&self, dim: &Dimension) -> Result<reqwest::Request, DimensionError> {
        let url = dimension_url(&self.config.api_url, dim)?;
        let (tags, tags_to_remove) = dim.split_tags();

        let (method, body) = if dim.merge_into_existing {
            let body = PatchBody {
                custom_properties: &dim.properties,
                tags,
                tags_to_remove,
            };
            (Method::PATCH, serde_json::to_vec(&body))
        } else {
            let body = ReplaceBody {
                key: &dim.name,
                value: &dim.value,
                custom_properties: &dim.properties,
                tags,
            };
            (Method::PUT, serde_json::to_vec(&body))
        };
        let body = body.map_err(|e| DimensionError::RequestBuild(e.to_string()))?;

        let request = self
            .client
            .request(method, url)
            .headers(self.extra_headers.clone())
            .header(CONTENT_TYPE, "application/json");
        self.token
            .authorize(request)
            .body(body)
            .build()
            .map_err(|e| DimensionError::RequestBuild(e.without_url().to_string()))
    }
}

/// Client errors other than 404 won't be fixed by resending. 404s can come from races
/// inside the dimension API, so they are retried like server errors.
fn is_terminal(status: Option<StatusCode>) -> bool {
    status.is_some_and(|s| s.is_client_error() && s != StatusCode::NOT_FOUND)
}

/// Folds `incoming` into the entry already queued for its key. The entry keeps its due
/// time. A resubmitted (older) update never overrides what a newer one set.
fn fold_into_queued(queued: &mut PendingDimension, incoming: Dimension, retries: u32) {
    let is_retry = retries > 0;
    let both_merge = queued.dim.merge_into_existing && incoming.merge_into_existing;

    match (both_merge, is_retry) {
        (true, false) => queued.dim.merge_from(&incoming),
        (true, true) => {
            let mut older = incoming;
            older.merge_from(&queued.dim);
            queued.dim.replace_contents(&older);
        }
        (false, false) => queued.dim = incoming,
        // a queued full replace already supersedes whatever failed before it
        (false, true) if !queued.dim.merge_into_existing => {}
        (false, true) => {
            let mut older = incoming;
            older.merge_from(&queued.dim);
            queued.dim = older;
        }
    }

    queued.retries = queued.retries.min(retries);
}

/// `{api}/v2/dimension/{name}/{value}`, plus `/_/agent` for merge updates. Segments are
/// percent-escaped and any path prefix on `api_url` is kept.
pub fn dimension_url(api_url: &Url, dim: &Dimension) -> Result<Url, DimensionError> {
    let mut url = api_url.clone();
    {
        let mut segments = url.path_segments_mut().map_err(|()| {
            DimensionError::RequestBuild(format!("api url {api_url} cannot be a base"))
        })?;
        segments
            .pop_if_empty()
            .extend(["v2", "dimension", dim.name.as_str(), dim.value.as_str()]);
        if dim.merge_into_existing {
            segments.extend(PATCH_SUFFIX);
        }
    }
    Ok(url)
}
