// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Memory of the last dimension state confirmed by the backend.
//!
//! A cache miss (never seen, or evicted) is treated as "not a duplicate", so eviction
//! only ever costs an extra request.

use crate::dimension::{DedupIdentity, Dimension, DimensionKey};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use tracing::warn;

const MIN_HISTORY_SIZE: NonZeroUsize = NonZeroUsize::MIN;

pub struct Deduplicator {
    history: Mutex<LruCache<DimensionKey, Dimension>>,
}

impl Deduplicator {
    #[must_use]
    pub fn new(history_size: usize) -> Self {
        let capacity = NonZeroUsize::new(history_size).unwrap_or(MIN_HISTORY_SIZE);
        Self {
            history: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// True if sending `dim` would change nothing relative to the last confirmed state.
    #[allow(clippy::expect_used)]
    pub fn is_duplicate(&self, dim: &Dimension) -> bool {
        let mut history = self.history.lock().expect("lock poisoned");
        let Some(cached) = history.get(&dim.key()) else {
            return false;
        };

        if cached.merge_into_existing != dim.merge_into_existing {
            warn!(
                dim = %dim.key(),
                "Dimension is updated with both merging and non-merging, which will result in race conditions and inconsistent data"
            );
            return false;
        }

        dim.equal_for_dedup(cached)
    }

    /// Records `dim` as confirmed. Merge updates accumulate into the cached state.
    #[allow(clippy::expect_used)]
    pub fn add(&self, dim: &Dimension) {
        let mut history = self.history.lock().expect("lock poisoned");
        let key = dim.key();

        if dim.merge_into_existing {
            if let Some(cached) = history.get_mut(&key) {
                cached.merge_from(dim);
                cached.merge_into_existing = true;
                return;
            }
        }

        history.put(key, dim.clone());
    }

    #[allow(clippy::expect_used)]
    #[must_use]
    pub fn get(&self, key: &DimensionKey) -> Option<Dimension> {
        self.history
            .lock()
            .expect("lock poisoned")
            .peek(key)
            .cloned()
    }
}
