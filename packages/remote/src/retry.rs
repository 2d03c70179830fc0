//! HTTP retry with exponential backoff.
//!
//! Every request the client makes goes through [`send`] (or
//! [`send_json`] on top of it). Connection failures, timeouts, HTTP 429,
//! and HTTP 5xx are retried up to [`MAX_RETRIES`] times with delays of 2s,
//! 4s, 8s, 16s, 32s. Other 4xx responses are permanent.

use std::time::Duration;

use serde::de::DeserializeOwned;

use crate::RemoteError;

/// Maximum number of retries after the first attempt.
pub const MAX_RETRIES: u32 = 5;

/// Maximum length of the response body preview included in error logs.
const BODY_PREVIEW_LEN: usize = 500;

/// What to do with a response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Success,
    Transient,
    Permanent,
}

/// Classifies an HTTP status for retry purposes.
#[must_use]
pub fn classify(status: reqwest::StatusCode) -> StatusClass {
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        StatusClass::Transient
    } else if status.is_client_error() {
        StatusClass::Permanent
    } else {
        StatusClass::Success
    }
}

/// Delay before retry number `attempt` (1-based).
#[must_use]
pub fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(1u64 << attempt.min(16))
}

/// Returns `true` if the error is likely transient and worth retrying.
fn is_transient(e: &reqwest::Error) -> bool {
    e.is_timeout() || e.is_connect() || e.is_body() || e.is_decode() || e.is_request()
}

/// Sends the request built by `build_request`, retrying transient
/// failures. Returns the first successful response.
///
/// The closure is called once per attempt because a
/// [`reqwest::RequestBuilder`] is consumed by `send()`.
///
/// # Errors
///
/// Returns [`RemoteError`] on a permanent failure or once retries are
/// exhausted.
#[allow(clippy::future_not_send)]
pub async fn send<F>(build_request: F) -> Result<reqwest::Response, RemoteError>
where
    F: Fn() -> reqwest::RequestBuilder,
{
    let mut attempt = 0u32;

    loop {
        if attempt > 0 {
            let delay = backoff_delay(attempt);
            log::warn!("  retry {attempt}/{MAX_RETRIES} in {delay:?}...");
            tokio::time::sleep(delay).await;
        }

        match build_request().send().await {
            Err(e) => {
                if is_transient(&e) && attempt < MAX_RETRIES {
                    log::warn!("  transient error: {e}");
                    attempt += 1;
                    continue;
                }
                return Err(RemoteError::Http(e));
            }
            Ok(response) => {
                let status = response.status();
                match classify(status) {
                    StatusClass::Success => return Ok(response),
                    StatusClass::Transient if attempt < MAX_RETRIES => {
                        log::warn!("  HTTP {status} from {}", response.url());
                        attempt += 1;
                    }
                    StatusClass::Transient | StatusClass::Permanent => {
                        let url = response.url().to_string();
                        if let Ok(body) = response.text().await {
                            let preview: String = body.chars().take(BODY_PREVIEW_LEN).collect();
                            log::error!("HTTP {status} for {url}: {preview}");
                        }
                        return Err(RemoteError::HttpStatus {
                            url,
                            status: status.as_u16(),
                        });
                    }
                }
            }
        }
    }
}

/// [`send`], then parses the body as JSON into `T`.
///
/// # Errors
///
/// Returns [`RemoteError`] if the request fails or the body is not valid
/// JSON of the expected shape.
#[allow(clippy::future_not_send)]
pub async fn send_json<T, F>(build_request: F) -> Result<T, RemoteError>
where
    T: DeserializeOwned,
    F: Fn() -> reqwest::RequestBuilder,
{
    let response = send(build_request).await?;
    let text = response.text().await?;
    Ok(serde_json::from_str(&text)?)
}
