// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Shared helpers for integration tests

#![allow(dead_code)]

pub mod mock_server;

use std::time::Duration;

/// Polls `check` until it holds, panicking after `timeout`.
pub async fn wait_until(timeout: Duration, check: impl Fn() -> bool) {
    tokio::time::timeout(timeout, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition was not met in time");
}
