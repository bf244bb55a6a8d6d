//! HTTP retry policy with exponential backoff.
//!
//! # Default policy
//!
//! - Max retries: 2 (3 total attempts per model)
//! - Initial delay: 500ms, doubling per retry
//! - Max delay: 8 seconds
//! - Jitter: down-jitter up to 25% (multiplier in [0.75, 1.0])
//!
//! # Retryable conditions
//!
//! - HTTP 429, 500, 502, 503, 504 (overridable per call site)
//! - Connection errors and requests that got no response headers in time
//!
//! A `Retry-After` / `Retry-After-Ms` header inside (0, 60s) replaces the
//! computed backoff for that attempt.

use std::time::Duration;

use reqwest::{RequestBuilder, Response, StatusCode, header::HeaderMap};

/// Statuses the generation service uses for transient overload.
#[must_use]
pub fn is_transient_status(status: StatusCode) -> bool {
    matches!(status.as_u16(), 429 | 500 | 502 | 503 | 504)
}

/// Retry policy, parameterized per call site.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retries (not counting the initial request).
    pub max_retries: u32,
    /// Backoff before the first retry; doubles for each retry after that.
    pub initial_delay: Duration,
    /// Upper bound on computed backoff.
    pub max_delay: Duration,
    /// Down-jitter factor (0.25 = up to 25% reduction).
    pub jitter_factor: f64,
    /// Which HTTP statuses are worth another attempt.
    pub retryable_status: fn(StatusCode) -> bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            jitter_factor: 0.25,
            retryable_status: is_transient_status,
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Delay before retry number `backoff_step + 1`.
    #[must_use]
    pub fn delay_for(&self, backoff_step: u32, headers: Option<&HeaderMap>) -> Duration {
        calculate_retry_delay(backoff_step, self, headers)
    }
}

/// Parse `Retry-After` or `Retry-After-Ms` headers.
///
/// Returns `Some(duration)` if a valid value is found and `0 < duration < 60s`.
#[must_use]
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    if let Some(val) = headers.get("retry-after-ms")
        && let Ok(s) = val.to_str()
        && let Ok(ms) = s.trim().parse::<f64>()
        && ms.is_finite()
        && ms > 0.0
    {
        let duration = Duration::from_secs_f64(ms / 1000.0);
        if duration < Duration::from_secs(60) {
            return Some(duration);
        }
    }

    if let Some(val) = headers.get("retry-after")
        && let Ok(s) = val.to_str()
        && let Ok(secs) = s.trim().parse::<u64>()
    {
        let duration = Duration::from_secs(secs);
        if duration > Duration::ZERO && duration < Duration::from_secs(60) {
            return Some(duration);
        }
    }

    None
}

/// Exponential backoff with down-jitter; `Retry-After` wins when valid.
#[must_use]
pub fn calculate_retry_delay(
    backoff_step: u32,
    policy: &RetryPolicy,
    headers: Option<&HeaderMap>,
) -> Duration {
    if let Some(headers) = headers
        && let Some(delay) = parse_retry_after(headers)
    {
        return delay;
    }

    let base = policy.initial_delay.as_secs_f64() * 2.0_f64.powi(backoff_step.min(30) as i32);
    let capped = base.min(policy.max_delay.as_secs_f64());

    let jitter = 1.0 - rand::random::<f64>() * policy.jitter_factor;
    Duration::from_secs_f64(capped * jitter)
}

/// Transport-level failure of one attempt.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
    #[error("no response within {}s", .0.as_secs_f64())]
    ResponseTimeout(Duration),
}

impl SendError {
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(e) => is_retryable_error(e),
            Self::ResponseTimeout(_) => true,
        }
    }
}

/// Outcome of a retried request.
///
/// Success and failure are distinct variants so an error response can never
/// be read as a stream.
#[derive(Debug)]
pub enum RetryOutcome {
    /// 2xx status.
    Success(Response),
    /// Non-2xx status, either non-retryable or after exhausting retries.
    /// The response is kept for error body inspection.
    HttpError { response: Response, attempts: u32 },
    /// Transport failure after exhausting retries.
    ConnectionError { attempts: u32, source: SendError },
    /// Transport failure that retrying cannot fix.
    NonRetryable(SendError),
}

impl RetryOutcome {
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

/// Send a request with automatic retries.
///
/// `build_request` is called once per attempt. `response_timeout` bounds the
/// wait for response headers only; reading the body is not covered.
pub async fn send_with_retry<F>(
    build_request: F,
    response_timeout: Option<Duration>,
    policy: &RetryPolicy,
) -> RetryOutcome
where
    F: Fn() -> RequestBuilder,
{
    let mut attempt: u32 = 0;
    loop {
        let can_retry = attempt < policy.max_retries;

        match send_once(build_request(), response_timeout).await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return RetryOutcome::Success(response);
                }

                if can_retry && (policy.retryable_status)(status) {
                    let delay = calculate_retry_delay(attempt, policy, Some(response.headers()));
                    tracing::debug!(
                        status = %status,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis(),
                        "Retrying request after error status"
                    );
                    drop(response);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    continue;
                }

                return RetryOutcome::HttpError {
                    response,
                    attempts: attempt + 1,
                };
            }
            Err(e) => {
                if !e.is_retryable() {
                    return RetryOutcome::NonRetryable(e);
                }
                if !can_retry {
                    return RetryOutcome::ConnectionError {
                        attempts: attempt + 1,
                        source: e,
                    };
                }

                let delay = calculate_retry_delay(attempt, policy, None);
                tracing::debug!(
                    error = %e,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis(),
                    "Retrying request after connection error"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

async fn send_once(
    request: RequestBuilder,
    response_timeout: Option<Duration>,
) -> Result<Response, SendError> {
    match response_timeout {
        Some(limit) => match tokio::time::timeout(limit, request.send()).await {
            Ok(result) => result.map_err(SendError::from),
            Err(_) => Err(SendError::ResponseTimeout(limit)),
        },
        None => request.send().await.map_err(SendError::from),
    }
}

fn is_retryable_error(error: &reqwest::Error) -> bool {
    error.is_connect() || error.is_timeout() || error.is_request()
}
