//! Shared HTTP plumbing for backend adapters

use std::time::Duration;

use tracing::{debug, warn};

use super::error::RouterError;

/// Maximum number of retries for transient errors
pub(super) const MAX_RETRIES: u32 = 3;

/// Initial backoff delay for retries
pub(super) const INITIAL_BACKOFF_MS: u64 = 1000;

/// Check if an HTTP status code is retryable
pub(super) fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
}

/// Send a request, retrying transient failures with exponential backoff
///
/// `build` must produce a fresh RequestBuilder each attempt (bodies are
/// consumed on send). A 429 honours the server's `retry-after` when present.
pub(super) async fn send_with_retry(
    build: impl Fn() -> reqwest::RequestBuilder,
) -> Result<reqwest::Response, RouterError> {
    let mut backoff = Duration::from_millis(INITIAL_BACKOFF_MS);
    let mut last_error: Option<RouterError> = None;

    for attempt in 0..=MAX_RETRIES {
        if attempt > 0 {
            debug!(attempt, ?backoff, "Retrying backend request");
            tokio::time::sleep(backoff).await;
            backoff *= 2;
        }

        match build().send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                if response.status().is_success() {
                    return Ok(response);
                }

                if status == 429 {
                    let retry_after = response
                        .headers()
                        .get("retry-after")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|s| s.parse::<u64>().ok())
                        .map(Duration::from_secs);
                    if let Some(delay) = retry_after {
                        backoff = delay;
                    }
                    last_error = Some(RouterError::RateLimited {
                        retry_after: backoff,
                    });
                    continue;
                }

                let message = response.text().await.unwrap_or_default();
                let error = RouterError::ApiError { status, message };
                if is_retryable_status(status) {
                    warn!(status, "Retryable backend error");
                    last_error = Some(error);
                    continue;
                }
                return Err(error);
            }
            Err(e) => {
                warn!(error = %e, "Backend request failed");
                last_error = Some(RouterError::Network(e));
            }
        }
    }

    Err(last_error.unwrap_or(RouterError::Timeout(Duration::from_millis(0))))
}
