// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded-concurrency HTTP request issuing.
//!
//! [`RequestSender::send`] waits for one of `max_requests` permits, then runs the request
//! on its own task and reports the result through a completion callback. The caller is
//! only held up while all permits are taken, never for a response.

use reqwest::StatusCode;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    Success {
        status: StatusCode,
        body: String,
    },
    /// Non-2xx response (`status` set) or transport error (`status` is `None`).
    Failed {
        status: Option<StatusCode>,
        error: String,
    },
}

#[derive(Debug, Clone)]
pub struct RequestSender {
    client: reqwest::Client,
    permits: Arc<Semaphore>,
}

impl RequestSender {
    #[must_use]
    pub fn new(client: reqwest::Client, max_requests: usize) -> Self {
        Self {
            client,
            permits: Arc::new(Semaphore::new(max_requests.max(1))),
        }
    }

    /// Issues `request` once a permit is free and calls `on_complete` with the result.
    pub async fn send<F>(&self, request: reqwest::Request, on_complete: F)
    where
        F: FnOnce(RequestOutcome) + Send + 'static,
    {
        let permit = match Arc::clone(&self.permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                on_complete(RequestOutcome::Failed {
                    status: None,
                    error: "request sender is closed".to_string(),
                });
                return;
            }
        };

        let client = self.client.clone();
        tokio::spawn(async move {
            let outcome = execute(&client, request).await;
            drop(permit);
            on_complete(outcome);
        });
    }

    /// Stops handing out permits. Requests already running finish normally.
    pub fn close(&self) {
        self.permits.close();
    }
}

async fn execute(client: &reqwest::Client, request: reqwest::Request) -> RequestOutcome {
    let url = request.url().clone();
    match client.execute(request).await {
        Ok(response) => {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            if status.is_success() {
                RequestOutcome::Success { status, body }
            } else {
                debug!(%url, %status, "Request failed with non-2xx response");
                RequestOutcome::Failed {
                    status: Some(status),
                    error: format!("{status}: {body}"),
                }
            }
        }
        Err(e) => RequestOutcome::Failed {
            status: e.status(),
            error: e.without_url().to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Server;
    use tokio::sync::mpsc;

    fn request(client: &reqwest::Client, url: &str) -> reqwest::Request {
        client.get(url).build().expect("request should build")
    }

    #[tokio::test]
    async fn test_success_and_failure_outcomes() {
        let mut server = Server::new_async().await;
        let ok = server
            .mock("GET", "/ok")
            .with_status(200)
            .with_body("done")
            .create_async()
            .await;
        let bad = server
            .mock("GET", "/bad")
            .with_status(400)
            .with_body("nope")
            .create_async()
            .await;

        let client = reqwest::Client::new();
        let sender = RequestSender::new(client.clone(), 2);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let ok_tx = tx.clone();
        sender
            .send(request(&client, &format!("{}/ok", server.url())), move |o| {
                let _ = ok_tx.send(o);
            })
            .await;
        let first = rx.recv().await.expect("outcome");
        assert_eq!(
            first,
            RequestOutcome::Success {
                status: StatusCode::OK,
                body: "done".to_string()
            }
        );

        sender
            .send(request(&client, &format!("{}/bad", server.url())), move |o| {
                let _ = tx.send(o);
            })
            .await;
        let second = rx.recv().await.expect("outcome");
        assert!(matches!(
            second,
            RequestOutcome::Failed { status: Some(StatusCode::BAD_REQUEST), ref error } if error.contains("nope")
        ));

        ok.assert_async().await;
        bad.assert_async().await;
    }

    #[tokio::test]
    async fn test_transport_error_has_no_status() {
        let client = reqwest::Client::new();
        let sender = RequestSender::new(client.clone(), 1);
        let (tx, mut rx) = mpsc::unbounded_channel();

        sender
            .send(request(&client, "http://127.0.0.1:1/unreachable"), move |o| {
                let _ = tx.send(o);
            })
            .await;

        let outcome = rx.recv().await.expect("outcome");
        assert!(matches!(outcome, RequestOutcome::Failed { status: None, .. }));
    }

    #[tokio::test]
    async fn test_closed_sender_fails_immediately() {
        let client = reqwest::Client::new();
        let sender = RequestSender::new(client.clone(), 1);
        sender.close();

        let (tx, mut rx) = mpsc::unbounded_channel();
        sender
            .send(request(&client, "http://127.0.0.1:1/"), move |o| {
                let _ = tx.send(o);
            })
            .await;

        assert!(matches!(
            rx.recv().await,
            Some(RequestOutcome::Failed { status: None, .. })
        ));
    }
}
