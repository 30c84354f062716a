//! HTTP client utilities for upstream dispatch
//!
//! One pooled client is shared by every request; streaming calls use a
//! second instance with a longer overall timeout.

use std::time::Duration;

use axum::body::Bytes;
use axum::http::StatusCode;
use once_cell::sync::Lazy;
use reqwest::header::HeaderMap;
use reqwest::{Client, Method};

use super::error::{RelayError, RelayResult};
use crate::config;

fn build_client(timeout_secs: u64) -> Client {
    Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .connect_timeout(Duration::from_secs(10))
        .build()
        .expect("relay http client")
}

static HTTP_CLIENT: Lazy<Client> =
    Lazy::new(|| build_client(config::options().request_timeout_secs));

static STREAM_CLIENT: Lazy<Client> =
    Lazy::new(|| build_client(config::options().stream_timeout_secs));

/// Shared client for buffered requests and image sub-fetches.
pub fn http() -> &'static Client {
    &HTTP_CLIENT
}

/// Shared client for streaming requests (longer timeout).
pub fn streaming() -> &'static Client {
    &STREAM_CLIENT
}

/// Send the rewritten request upstream. Network-level failures map to
/// `do_request_failed`; non-2xx statuses are returned to the caller intact.
pub async fn dispatch(
    client: &Client,
    method: Method,
    url: &str,
    headers: HeaderMap,
    body: Bytes,
) -> RelayResult<reqwest::Response> {
    tracing::debug!(%method, url, "dispatching upstream request");
    client
        .request(method, url)
        .headers(headers)
        .body(body)
        .send()
        .await
        .map_err(|e| {
            let message = if e.is_timeout() {
                format!("upstream request timed out: {}", e)
            } else if e.is_connect() {
                format!("upstream connection failed: {}", e)
            } else {
                format!("upstream request error: {}", e)
            };
            RelayError::one_api("do_request_failed", StatusCode::BAD_GATEWAY, message)
        })
}
