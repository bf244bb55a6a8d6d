//! Streaming client for the text-generation service.
//!
//! # Architecture
//!
//! - [`gemini`] - the Gemini `streamGenerateContent` gateway with model failover
//! - [`retry`] - per-attempt retry policy with exponential backoff
//! - [`generation`] - the [`Generation`] handle returned to callers
//!
//! A call to [`TextGenerator::generate`] spawns one transport task. Text
//! chunks flow to the caller over a bounded channel as they are parsed; the
//! usage/finish snapshot arrives through the completion handle once the
//! upstream connection closes.
//!
//! # Error Handling
//!
//! Failures before a stream is established are retried, then failed over to
//! the next model. Failures after that are reported as
//! [`GenerationError::Stream`]; chunks already delivered stay delivered.

pub mod gemini;
pub mod generation;
pub mod retry;
pub mod sse_types;

pub use gemini::{GatewaySettings, GatewayTimeouts, GeminiGateway};
pub use generation::{CandidateFailure, Generation, GenerationError, TextGenerator};
pub use yijing_types;

use std::time::Duration;
use tokio::sync::mpsc;

/// Canonical Gemini API base URL.
pub const GEMINI_API_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

// Note: reqwest only exposes tcp_keepalive (idle time); interval/retries use platform defaults.
const TCP_KEEPALIVE_SECS: u64 = 60;

const POOL_MAX_IDLE_PER_HOST: usize = 100;
const POOL_IDLE_TIMEOUT_SECS: u64 = 90;

const MAX_SSE_BUFFER_BYTES: usize = 4 * 1024 * 1024;

const MAX_SSE_PARSE_ERRORS: usize = 3;

const MAX_ERROR_BODY_BYTES: usize = 32 * 1024;

/// Hardened client: no redirects, keepalive, bounded connect time.
///
/// `https_only` is switched off only for local test servers.
pub fn http_client(connect_timeout: Duration, https_only: bool) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(connect_timeout)
        .redirect(reqwest::redirect::Policy::none())
        .https_only(https_only)
        .tcp_keepalive(Some(Duration::from_secs(TCP_KEEPALIVE_SECS)))
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
        .pool_idle_timeout(Some(Duration::from_secs(POOL_IDLE_TIMEOUT_SECS)))
        .build()
}

fn find_sse_event_boundary(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = buffer.windows(2).position(|w| w == b"\n\n");
    let crlf = buffer.windows(4).position(|w| w == b"\r\n\r\n");
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a <= b { (a, 2) } else { (b, 4) }),
        (Some(a), None) => Some((a, 2)),
        (None, Some(b)) => Some((b, 4)),
        (None, None) => None,
    }
}

fn drain_next_sse_event(buffer: &mut Vec<u8>) -> Option<Vec<u8>> {
    let (pos, delim_len) = find_sse_event_boundary(buffer)?;
    let event = buffer[..pos].to_vec();
    buffer.drain(..pos + delim_len);
    Some(event)
}

/// Join the `data:` lines of one event with `\n`. Comment (`:`) and other
/// field lines are ignored.
fn extract_sse_data(event: &str) -> Option<String> {
    let mut data = String::new();
    let mut found = false;

    for line in event.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);

        if let Some(mut rest) = line.strip_prefix("data:") {
            if let Some(stripped) = rest.strip_prefix(' ') {
                rest = stripped;
            }

            if found {
                data.push('\n');
            }
            data.push_str(rest);
            found = true;
        }
    }

    if found { Some(data) } else { None }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum SseParseAction {
    /// Nothing to forward.
    Continue,
    /// Forward these text chunks, in order.
    Emit(Vec<String>),
    /// Upstream reported an error inside the stream.
    Error(String),
    /// Valid JSON in a shape the parser does not understand. Counts toward
    /// the parse-error budget.
    Malformed(String),
}

/// Turns one decoded JSON payload into stream actions. Parsers keep any
/// metadata (usage, finish reason) as internal state.
pub(crate) trait SseParser {
    fn parse(&mut self, json: &serde_json::Value) -> SseParseAction;
    fn provider_name(&self) -> &'static str;
}

/// How a stream ended when it did not fail.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum StreamEnd {
    /// Upstream closed the connection.
    Closed,
    /// The chunk receiver was dropped.
    ReceiverDropped,
}

enum PayloadVerdict {
    Continue,
    Stop(Result<StreamEnd, String>),
}

async fn dispatch_payload<P: SseParser>(
    data: &str,
    parser: &mut P,
    tx: &mpsc::Sender<String>,
    parse_errors: &mut usize,
) -> PayloadVerdict {
    if data.trim() == "[DONE]" || data.trim().is_empty() {
        return PayloadVerdict::Continue;
    }

    let json = match serde_json::from_str::<serde_json::Value>(data) {
        Ok(json) => json,
        Err(e) => {
            *parse_errors = parse_errors.saturating_add(1);
            tracing::warn!(
                %e,
                payload_bytes = data.len(),
                provider = parser.provider_name(),
                "Invalid SSE JSON payload"
            );
            if *parse_errors >= MAX_SSE_PARSE_ERRORS {
                return PayloadVerdict::Stop(Err(format!("Invalid stream payload: {e}")));
            }
            return PayloadVerdict::Continue;
        }
    };

    // A payload may batch several response objects in one array.
    let payloads = match json {
        serde_json::Value::Array(items) => items,
        other => vec![other],
    };

    for payload in &payloads {
        match parser.parse(payload) {
            SseParseAction::Continue => *parse_errors = 0,
            SseParseAction::Emit(chunks) => {
                *parse_errors = 0;
                for chunk in chunks {
                    if tx.send(chunk).await.is_err() {
                        return PayloadVerdict::Stop(Ok(StreamEnd::ReceiverDropped));
                    }
                }
            }
            SseParseAction::Error(message) => return PayloadVerdict::Stop(Err(message)),
            SseParseAction::Malformed(reason) => {
                *parse_errors = parse_errors.saturating_add(1);
                tracing::warn!(
                    %reason,
                    provider = parser.provider_name(),
                    "Unrecognized SSE payload"
                );
                if *parse_errors >= MAX_SSE_PARSE_ERRORS {
                    return PayloadVerdict::Stop(Err(format!("Invalid stream payload: {reason}")));
                }
            }
        }
    }
    PayloadVerdict::Continue
}

/// Read an SSE response to completion, forwarding parsed text chunks.
///
/// Handles:
/// - idle timeout between network reads
/// - buffer size limit
/// - UTF-8 validation
/// - event boundary detection, including a final event without a trailing blank line
/// - `[DONE]` markers (ignored)
/// - consecutive parse error threshold
pub(crate) async fn process_sse_stream<P: SseParser>(
    response: reqwest::Response,
    parser: &mut P,
    tx: &mpsc::Sender<String>,
    idle_timeout: Duration,
) -> Result<StreamEnd, String> {
    use futures_util::StreamExt;

    let mut stream = response.bytes_stream();
    let mut buffer: Vec<u8> = Vec::new();
    let mut parse_errors = 0usize;

    loop {
        let Ok(next) = tokio::time::timeout(idle_timeout, stream.next()).await else {
            return Err(format!("Stream idle for more than {idle_timeout:?}"));
        };

        let Some(chunk) = next else { break };
        let chunk = chunk.map_err(|e| format!("Stream read failed: {e}"))?;
        buffer.extend_from_slice(&chunk);

        if buffer.len() > MAX_SSE_BUFFER_BYTES {
            return Err("SSE buffer exceeded maximum size (4 MiB)".to_string());
        }

        while let Some(event) = drain_next_sse_event(&mut buffer) {
            if event.is_empty() {
                continue;
            }
            let Ok(event) = std::str::from_utf8(&event) else {
                return Err("Received invalid UTF-8 from SSE stream".to_string());
            };
            let Some(data) = extract_sse_data(event) else {
                continue;
            };
            if let PayloadVerdict::Stop(end) =
                dispatch_payload(&data, parser, tx, &mut parse_errors).await
            {
                return end;
            }
        }
    }

    // Connection closed; whatever is left is the final event.
    if !buffer.is_empty() {
        let Ok(event) = std::str::from_utf8(&buffer) else {
            return Err("Received invalid UTF-8 from SSE stream".to_string());
        };
        if let Some(data) = extract_sse_data(event)
            && let PayloadVerdict::Stop(end) =
                dispatch_payload(&data, parser, tx, &mut parse_errors).await
        {
            return end;
        }
    }

    Ok(StreamEnd::Closed)
}

pub async fn read_capped_error_body(response: reqwest::Response) -> String {
    use futures_util::StreamExt;
    let mut body = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let Ok(chunk) = chunk else { break };
        body.extend_from_slice(&chunk);
        if body.len() > MAX_ERROR_BODY_BYTES {
            body.truncate(MAX_ERROR_BODY_BYTES);
            let text = String::from_utf8_lossy(&body);
            return format!("{text}...(truncated)");
        }
    }
    String::from_utf8_lossy(&body).into_owned()
}
