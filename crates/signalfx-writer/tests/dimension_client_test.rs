// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

mod common;

use common::mock_server::MockServer;
use common::wait_until;
use signalfx_writer::access_token::AccessToken;
use signalfx_writer::dimension::{DedupIdentity, Dimension};
use signalfx_writer::dimension_client::{DimensionClient, DimensionClientConfig};
use signalfx_writer::errors::DimensionError;
use signalfx_writer::property_filters::PropertyFilterSet;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

const SEND_DELAY: Duration = Duration::from_millis(200);
const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    server: MockServer,
    client: DimensionClient,
    cancel: CancellationToken,
}

impl Harness {
    async fn start(customize: impl FnOnce(&mut DimensionClientConfig)) -> Self {
        let server = MockServer::start().await;
        let mut config =
            DimensionClientConfig::new(Url::parse(&server.url()).expect("valid mock url"));
        config.send_delay = SEND_DELAY;
        config.extra_headers = [("X-Test".to_string(), "yes".to_string())].into();
        customize(&mut config);

        let cancel = CancellationToken::new();
        let client = DimensionClient::new(
            config,
            PropertyFilterSet::default(),
            AccessToken::new("test-token").expect("valid token"),
            cancel.clone(),
        );
        client.start();

        Harness {
            server,
            client,
            cancel,
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn test_box_patch() -> Dimension {
    Dimension::new("host", "test-box")
        .with_property("a", "b")
        .with_property("c", "d")
        .with_tag("active", true)
        .merging()
}

#[tokio::test]
async fn test_patch_sent_after_send_delay() {
    let h = Harness::start(|_| {}).await;

    h.client
        .accept_dimension(test_box_patch())
        .expect("update should be accepted");
    assert!(h.server.requests().is_empty(), "nothing is sent before the delay");
    assert_eq!(h.client.stats().currently_delayed, 1);

    let requests = h.server.wait_for_requests(1, WAIT).await;
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert_eq!(request.method, "PATCH");
    assert_eq!(request.path, "/v2/dimension/host/test-box/_/agent");
    assert_eq!(request.header("x-sf-token"), Some("test-token"));
    assert_eq!(request.header("content-type"), Some("application/json"));
    assert_eq!(request.header("x-test"), Some("yes"));
    assert_eq!(
        request.json(),
        serde_json::json!({"customProperties": {"a": "b", "c": "d"}, "tags": ["active"], "tagsToRemove": []})
    );

    wait_until(WAIT, || h.client.stats().successful_updates == 1).await;
    assert_eq!(h.client.stats().currently_delayed, 0);
}

#[tokio::test]
async fn test_put_replaces_dimension() {
    let h = Harness::start(|_| {}).await;

    h.client
        .accept_dimension(
            Dimension::new("container_id", "abc/def")
                .with_property("image", "nginx")
                .with_tag("web", true)
                .with_tag("old", false),
        )
        .expect("update should be accepted");

    let requests = h.server.wait_for_requests(1, WAIT).await;
    assert_eq!(requests[0].method, "PUT");
    assert_eq!(requests[0].path, "/v2/dimension/container_id/abc%2Fdef");
    assert_eq!(
        requests[0].json(),
        serde_json::json!({"key": "container_id", "value": "abc/def", "customProperties": {"image": "nginx"}, "tags": ["web"]})
    );
}

#[tokio::test]
async fn test_updates_within_delay_are_coalesced() {
    let h = Harness::start(|_| {}).await;

    for (k, v) in [("a", "1"), ("b", "2"), ("a", "3"), ("c", "4")] {
        h.client
            .accept_dimension(Dimension::new("host", "x").with_property(k, v).merging())
            .expect("update should be accepted");
    }
    h.client
        .accept_dimension(Dimension::new("host", "x").with_tag("t", true).merging())
        .expect("update should be accepted");

    wait_until(WAIT, || h.client.stats().successful_updates == 1).await;
    tokio::time::sleep(SEND_DELAY * 2).await;

    let requests = h.server.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(
        requests[0].json(),
        serde_json::json!({"customProperties": {"a": "3", "b": "2", "c": "4"}, "tags": ["t"], "tagsToRemove": []})
    );
    assert_eq!(h.client.stats().flappy_updates, 4);
}

#[tokio::test]
async fn test_different_keys_sent_in_enqueue_order() {
    let h = Harness::start(|c| c.max_requests = 1).await;

    for value in ["first", "second", "third"] {
        h.client
            .accept_dimension(Dimension::new("host", value).with_property("p", "v"))
            .expect("update should be accepted");
    }

    let requests = h.server.wait_for_requests(3, WAIT).await;
    let paths: Vec<_> = requests.iter().map(|r| r.path.as_str()).collect();
    assert_eq!(
        paths,
        vec![
            "/v2/dimension/host/first",
            "/v2/dimension/host/second",
            "/v2/dimension/host/third"
        ]
    );
}

#[tokio::test]
async fn test_confirmed_update_is_not_resent() {
    let h = Harness::start(|_| {}).await;
    let dim = Dimension::new("host", "x").with_property("a", "1");

    h.client.accept_dimension(dim.clone()).expect("accepted");
    wait_until(WAIT, || h.client.stats().successful_updates == 1).await;

    h.client.accept_dimension(dim).expect("accepted");
    wait_until(WAIT, || h.client.stats().duplicates == 1).await;

    assert_eq!(h.server.requests().len(), 1);
}

#[tokio::test]
async fn test_merge_accumulates_confirmed_state() {
    let h = Harness::start(|_| {}).await;

    h.client
        .accept_dimension(Dimension::new("host", "x").with_property("a", "1"))
        .expect("accepted");
    wait_until(WAIT, || h.client.stats().successful_updates == 1).await;

    h.client
        .accept_dimension(Dimension::new("host", "x").with_property("b", "2").merging())
        .expect("accepted");
    wait_until(WAIT, || h.client.stats().successful_updates == 2).await;

    let cached = h
        .client
        .deduplicator()
        .get(&Dimension::new("host", "x").key())
        .expect("confirmed state should be cached");
    assert_eq!(cached.properties.get("a").map(String::as_str), Some("1"));
    assert_eq!(cached.properties.get("b").map(String::as_str), Some("2"));
}

#[tokio::test]
async fn test_full_queue_drops_and_counts() {
    let h = Harness::start(|c| {
        c.max_buffered = 2;
        c.send_delay = Duration::from_secs(60);
    })
    .await;

    h.client
        .accept_dimension(Dimension::new("host", "1"))
        .expect("accepted");
    h.client
        .accept_dimension(Dimension::new("host", "2"))
        .expect("accepted");
    for _ in 0..3 {
        assert!(matches!(
            h.client.accept_dimension(Dimension::new("host", "3")),
            Err(DimensionError::BufferFull)
        ));
    }

    let stats = h.client.stats();
    assert_eq!(stats.dropped, 3);
    assert_eq!(stats.currently_delayed, 2);
}

#[tokio::test]
async fn test_server_error_is_retried_until_success() {
    let h = Harness::start(|_| {}).await;
    h.server.set_status(500);

    h.client.accept_dimension(test_box_patch()).expect("accepted");
    let first = h.server.wait_for_requests(1, WAIT).await;
    assert_eq!(first.len(), 1);
    h.server.set_status(200);

    wait_until(WAIT, || h.client.stats().successful_updates == 1).await;
    tokio::time::sleep(SEND_DELAY * 2).await;

    let requests = h.server.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].path, requests[1].path);
    assert_eq!(requests[0].json(), requests[1].json());
    assert_eq!(h.client.stats().retried_updates, 1);
}

#[tokio::test]
async fn test_client_error_is_not_retried() {
    let h = Harness::start(|_| {}).await;
    h.server.set_status(400);

    h.client.accept_dimension(test_box_patch()).expect("accepted");
    wait_until(WAIT, || h.client.stats().client_errors == 1).await;
    tokio::time::sleep(SEND_DELAY * 3).await;

    assert_eq!(h.server.requests().len(), 1);
    let stats = h.client.stats();
    assert_eq!(stats.retried_updates, 0);
    assert_eq!(stats.successful_updates, 0);
    assert_eq!(stats.currently_delayed, 0);
}

#[tokio::test]
async fn test_not_found_is_retried() {
    let h = Harness::start(|_| {}).await;
    h.server.set_status(404);

    h.client.accept_dimension(test_box_patch()).expect("accepted");
    h.server.wait_for_requests(1, WAIT).await;
    h.server.set_status(200);

    wait_until(WAIT, || h.client.stats().successful_updates == 1).await;
    let stats = h.client.stats();
    assert_eq!(stats.retried_updates, 1);
    assert_eq!(stats.client_errors, 0);
}

#[tokio::test]
async fn test_retries_are_capped() {
    let h = Harness::start(|c| {
        c.max_retries = 2;
        c.send_delay = Duration::from_millis(50);
    })
    .await;
    h.server.set_status(503);

    h.client.accept_dimension(test_box_patch()).expect("accepted");
    wait_until(WAIT, || h.client.stats().retries_exhausted == 1).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(h.server.requests().len(), 3);
    let stats = h.client.stats();
    assert_eq!(stats.retried_updates, 2);
    assert_eq!(stats.currently_delayed, 0);
}

#[tokio::test]
async fn test_invalid_dimension_is_rejected() {
    let h = Harness::start(|_| {}).await;

    assert!(matches!(
        h.client
            .accept_dimension(Dimension::new("", "x").with_property("a", "b")),
        Err(DimensionError::InvalidDimension { .. })
    ));
    assert_eq!(h.client.stats().invalid_dimensions, 1);
    assert_eq!(h.client.stats().currently_delayed, 0);
}

#[tokio::test]
async fn test_cancel_stops_sending() {
    let h = Harness::start(|_| {}).await;

    h.client.accept_dimension(test_box_patch()).expect("accepted");
    h.cancel.cancel();
    tokio::time::sleep(SEND_DELAY * 2).await;

    assert!(h.server.requests().is_empty());
    assert!(matches!(
        h.client.accept_dimension(Dimension::new("host", "y")),
        Err(DimensionError::ClientStopped)
    ));
}

#[tokio::test]
async fn test_drain_sends_queued_updates_without_waiting() {
    let h = Harness::start(|c| c.send_delay = Duration::from_secs(60)).await;

    h.client.accept_dimension(test_box_patch()).expect("accepted");
    h.client
        .accept_dimension(Dimension::new("container_id", "abc").with_property("x", "y"))
        .expect("accepted");

    assert!(h.client.drain(WAIT).await, "drain should finish in time");

    let mut paths: Vec<_> = h.server.requests().into_iter().map(|r| r.path).collect();
    paths.sort();
    assert_eq!(
        paths,
        vec![
            "/v2/dimension/container_id/abc".to_string(),
            "/v2/dimension/host/test-box/_/agent".to_string(),
        ]
    );
    let stats = h.client.stats();
    assert_eq!(stats.successful_updates, 2);
    assert_eq!(stats.currently_delayed, 0);
}

#[tokio::test]
async fn test_drain_waits_for_retries() {
    let h = Harness::start(|c| {
        c.send_delay = Duration::from_secs(60);
        c.max_retries = 1;
    })
    .await;
    h.server.set_status(500);

    h.client.accept_dimension(test_box_patch()).expect("accepted");
    assert!(h.client.drain(WAIT).await);

    assert_eq!(h.server.requests().len(), 2);
    assert_eq!(h.client.stats().retries_exhausted, 1);
}

#[tokio::test]
async fn test_drain_gives_up_after_max_wait() {
    let h = Harness::start(|_| {}).await;

    h.client.accept_dimension(test_box_patch()).expect("accepted");
    // consumer is gone, nothing can settle the queued update
    h.cancel.cancel();

    assert!(!h.client.drain(Duration::from_millis(100)).await);
    assert_eq!(h.client.stats().currently_delayed, 1);
}
