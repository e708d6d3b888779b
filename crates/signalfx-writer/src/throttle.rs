// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

pub(crate) const DEFAULT_LOG_INTERVAL: Duration = Duration::from_secs(20);

/// Lets a given message key through at most once per interval, counting what it held back.
#[derive(Debug)]
pub(crate) struct LogThrottle {
    interval: Duration,
    last: Mutex<HashMap<String, (Instant, u64)>>,
}

impl LogThrottle {
    pub(crate) fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `Some(suppressed)` when a message for `key` should be logged now.
    #[allow(clippy::expect_used)]
    pub(crate) fn check(&self, key: &str) -> Option<u64> {
        let now = Instant::now();
        let mut last = self.last.lock().expect("lock poisoned");
        match last.get_mut(key) {
            Some((at, suppressed)) if now.duration_since(*at) < self.interval => {
                *suppressed += 1;
                None
            }
            Some((at, suppressed)) => {
                let held_back = *suppressed;
                *at = now;
                *suppressed = 0;
                Some(held_back)
            }
            None => {
                last.insert(key.to_string(), (now, 0));
                Some(0)
            }
        }
    }
}

impl Default for LogThrottle {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_INTERVAL)
    }
}
