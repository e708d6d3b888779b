// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Tee of one input channel onto several backend channels.
//!
//! Every output receives its own owned copy of each item, so a backend mutating an item
//! during preprocessing never affects what another backend sees. A backend whose channel
//! is full loses that copy (counted); the other backends are not held up by it.

use crate::throttle::LogThrottle;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Copies dropped because an output channel was full, per channel kind.
#[derive(Debug, Default)]
pub struct FanoutStats {
    pub dropped: AtomicU64,
}

impl FanoutStats {
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Spawns a task forwarding every item from `rx` to all `outputs`.
///
/// Ends when `cancel` fires or the input closes.
pub fn spawn_broadcast<T>(
    kind: &'static str,
    mut rx: mpsc::Receiver<T>,
    outputs: Vec<mpsc::Sender<T>>,
    stats: Arc<FanoutStats>,
    cancel: CancellationToken,
) -> JoinHandle<()>
where
    T: Clone + Send + 'static,
{
    tokio::spawn(async move {
        let throttle = LogThrottle::default();
        loop {
            let item = tokio::select! {
                () = cancel.cancelled() => break,
                item = rx.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            };
            broadcast(kind, item, &outputs, &stats, &throttle);
        }
        debug!(kind, "Fan-out stopped");
    })
}

fn broadcast<T: Clone>(
    kind: &'static str,
    item: T,
    outputs: &[mpsc::Sender<T>],
    stats: &FanoutStats,
    throttle: &LogThrottle,
) {
    let Some((last, rest)) = outputs.split_last() else {
        return;
    };

    let forward = |output: &mpsc::Sender<T>, copy: T| match output.try_send(copy) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => {
            stats.dropped.fetch_add(1, Ordering::Relaxed);
            if let Some(suppressed) = throttle.check(kind) {
                warn!(kind, suppressed, "Backend channel is full, dropping its copy");
            }
        }
        Err(TrySendError::Closed(_)) => {
            debug!(kind, "Backend channel is closed");
        }
    };

    for output in rest {
        forward(output, item.clone());
    }
    forward(last, item);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_every_output_gets_an_independent_copy() {
        let (in_tx, in_rx) = mpsc::channel(10);
        let (a_tx, mut a_rx) = mpsc::channel(10);
        let (b_tx, mut b_rx) = mpsc::channel(10);
        let stats = Arc::new(FanoutStats::default());
        let cancel = CancellationToken::new();
        let handle = spawn_broadcast(
            "test",
            in_rx,
            vec![a_tx, b_tx],
            Arc::clone(&stats),
            cancel.clone(),
        );

        in_tx.send(vec![1, 2]).await.expect("send");
        let mut a = a_rx.recv().await.expect("a copy");
        let b = b_rx.recv().await.expect("b copy");
        a.push(3);

        assert_eq!(a, vec![1, 2, 3]);
        assert_eq!(b, vec![1, 2]);

        drop(in_tx);
        handle.await.expect("fan-out task");
        assert_eq!(stats.dropped(), 0);
    }

    #[tokio::test]
    async fn test_full_output_only_drops_its_copy() {
        let (slow_tx, mut slow_rx) = mpsc::channel(1);
        let (fast_tx, mut fast_rx) = mpsc::channel(10);
        let stats = FanoutStats::default();
        let throttle = LogThrottle::default();
        let outputs = vec![slow_tx, fast_tx];

        for i in 0..3 {
            broadcast("test", i, &outputs, &stats, &throttle);
        }

        assert_eq!(stats.dropped(), 2);
        assert_eq!(slow_rx.recv().await, Some(0));
        for expected in 0..3 {
            assert_eq!(fast_rx.recv().await, Some(expected));
        }
    }

    #[tokio::test]
    async fn test_cancel_stops_fanout() {
        let (_in_tx, in_rx) = mpsc::channel::<u8>(1);
        let (out_tx, _out_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let handle = spawn_broadcast(
            "test",
            in_rx,
            vec![out_tx],
            Arc::new(FanoutStats::default()),
            cancel.clone(),
        );
        cancel.cancel();
        handle.await.expect("fan-out task");
    }
}
