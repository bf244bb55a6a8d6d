//! Gemini `streamGenerateContent` gateway.
//!
//! Each call walks an ordered, de-duplicated candidate list (primary model,
//! then fallbacks). A candidate gets the full retry policy; once every
//! attempt on it has failed, the next one is tried. The first candidate
//! that answers with 2xx is streamed to completion and there is no failover
//! after that point, even if it produces no text.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::mpsc;
use yijing_types::{
    ApiKey, FinishReason, GenerationReport, GenerationUsage, ModelName, candidate_models,
};

use crate::generation::{CandidateFailure, Generation, GenerationError, TextGenerator};
use crate::retry::{RetryOutcome, RetryPolicy, send_with_retry};
use crate::sse_types::gemini as typed;
use crate::{
    GEMINI_API_BASE_URL, SseParseAction, SseParser, StreamEnd, http_client, process_sse_stream,
    read_capped_error_body,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewayTimeouts {
    /// TCP/TLS connect.
    pub connect: Duration,
    /// Wait for response headers on each attempt.
    pub response: Duration,
    /// Longest gap between two network reads once streaming.
    pub stream_idle: Duration,
}

impl Default for GatewayTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(5),
            response: Duration::from_secs(60),
            stream_idle: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub api_key: ApiKey,
    pub base_url: String,
    pub model: ModelName,
    pub fallback_models: Vec<ModelName>,
    pub temperature: f32,
    pub max_output_tokens: u32,
    pub stop_sequences: Vec<String>,
    pub timeouts: GatewayTimeouts,
    pub retry: RetryPolicy,
    pub https_only: bool,
}

impl GatewaySettings {
    /// Production defaults for everything except the key and primary model.
    #[must_use]
    pub fn new(api_key: ApiKey, model: ModelName) -> Self {
        Self {
            api_key,
            base_url: GEMINI_API_BASE_URL.to_string(),
            model,
            fallback_models: Vec::new(),
            temperature: 1.0,
            max_output_tokens: 1500,
            stop_sequences: Vec::new(),
            timeouts: GatewayTimeouts::default(),
            retry: RetryPolicy::default(),
            https_only: true,
        }
    }
}

/// Build the request body for the Gemini API.
///
/// Note: Gemini API uses mixed casing:
/// - `system_instruction` (snake_case)
/// - `generationConfig` (camelCase)
fn build_request_body(settings: &GatewaySettings, system_prompt: &str, user_prompt: &str) -> Value {
    let mut generation_config = serde_json::Map::new();
    generation_config.insert("temperature".into(), json!(settings.temperature));
    generation_config.insert("maxOutputTokens".into(), json!(settings.max_output_tokens));
    if !settings.stop_sequences.is_empty() {
        generation_config.insert("stopSequences".into(), json!(settings.stop_sequences));
    }

    let mut body = serde_json::Map::new();
    if !system_prompt.trim().is_empty() {
        body.insert(
            "system_instruction".into(),
            json!({ "parts": [{ "text": system_prompt }] }),
        );
    }
    body.insert(
        "contents".into(),
        json!([{ "role": "user", "parts": [{ "text": user_prompt }] }]),
    );
    body.insert("generationConfig".into(), Value::Object(generation_config));
    Value::Object(body)
}

// ========================================================================
// Gemini SSE Parser
// ========================================================================

/// Parser state for one Gemini stream. Usage and finish reason keep only the
/// latest values seen.
#[derive(Debug, Default)]
struct GeminiParser {
    usage: Option<GenerationUsage>,
    finish_reason: Option<FinishReason>,
}

impl SseParser for GeminiParser {
    fn parse(&mut self, json: &Value) -> SseParseAction {
        let response: typed::Response = match serde_json::from_value(json.clone()) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(%e, "Failed to parse Gemini SSE event");
                let salvaged = salvage_text(json);
                return if salvaged.is_empty() {
                    SseParseAction::Malformed(e.to_string())
                } else {
                    SseParseAction::Emit(salvaged)
                };
            }
        };

        if let Some(error) = response.error {
            return SseParseAction::Error(error.describe());
        }

        if let Some(usage) = response.usage_metadata {
            self.usage = Some(usage.into());
        }

        let mut chunks = Vec::new();
        for candidate in response.candidates.unwrap_or_default() {
            // Text first: the final event carries content and finishReason together.
            if let Some(parts) = candidate.content.and_then(|c| c.parts) {
                chunks.extend(
                    parts
                        .into_iter()
                        .filter_map(|part| part.text)
                        .filter(|text| !text.is_empty()),
                );
            }
            if let Some(reason) = candidate.finish_reason {
                let reason = FinishReason::parse(&reason);
                if !reason.is_success() {
                    tracing::info!(finish_reason = %reason, "Gemini stream reported non-STOP finish");
                }
                self.finish_reason = Some(reason);
            }
        }

        if chunks.is_empty() {
            SseParseAction::Continue
        } else {
            SseParseAction::Emit(chunks)
        }
    }

    fn provider_name(&self) -> &'static str {
        "Gemini"
    }
}

/// Text parts from an event the typed model rejected, such as one with an
/// odd field type elsewhere in the payload.
fn salvage_text(json: &Value) -> Vec<String> {
    json.get("candidates")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|candidate| candidate.pointer("/content/parts").and_then(Value::as_array))
        .flatten()
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .filter(|text| !text.is_empty())
        .map(str::to_owned)
        .collect()
}

// ========================================================================
// Gateway
// ========================================================================

#[derive(Debug)]
struct GatewayInner {
    client: reqwest::Client,
    settings: GatewaySettings,
    candidates: Vec<ModelName>,
}

/// Cheap to clone; clones share one HTTP connection pool.
#[derive(Debug, Clone)]
pub struct GeminiGateway {
    inner: Arc<GatewayInner>,
}

impl GeminiGateway {
    pub fn new(settings: GatewaySettings) -> reqwest::Result<Self> {
        let client = http_client(settings.timeouts.connect, settings.https_only)?;
        let candidates = candidate_models(&settings.model, &settings.fallback_models);
        Ok(Self {
            inner: Arc::new(GatewayInner {
                client,
                settings,
                candidates,
            }),
        })
    }

    /// Models in the order they will be tried.
    #[must_use]
    pub fn candidates(&self) -> &[ModelName] {
        &self.inner.candidates
    }
}

impl TextGenerator for GeminiGateway {
    fn generate(&self, system_prompt: &str, user_prompt: &str) -> Generation {
        let inner = Arc::clone(&self.inner);
        let body = build_request_body(&inner.settings, system_prompt, user_prompt);
        Generation::spawn(move |tx| async move { inner.run(body, tx).await })
    }
}

impl GatewayInner {
    fn stream_url(&self, model: &ModelName) -> String {
        format!(
            "{}/models/{}:streamGenerateContent?alt=sse",
            self.settings.base_url.trim_end_matches('/'),
            model.as_str()
        )
    }

    async fn run(
        &self,
        body: Value,
        tx: mpsc::Sender<String>,
    ) -> Result<GenerationReport, GenerationError> {
        let mut failures: Vec<CandidateFailure> = Vec::new();

        for model in &self.candidates {
            let url = self.stream_url(model);
            let api_key = self.settings.api_key.expose_secret();

            let outcome = send_with_retry(
                || {
                    self.client
                        .post(&url)
                        .header("x-goog-api-key", api_key)
                        .header("content-type", "application/json")
                        .json(&body)
                },
                Some(self.settings.timeouts.response),
                &self.settings.retry,
            )
            .await;

            let failure = match outcome {
                RetryOutcome::Success(response) => {
                    tracing::info!(model = %model, "Generation stream established");
                    return self.stream(model, response, &tx).await;
                }
                RetryOutcome::HttpError { response, attempts } => {
                    let status = response.status();
                    let body = read_capped_error_body(response).await;
                    CandidateFailure {
                        model: model.to_string(),
                        attempts,
                        message: format!("HTTP {status}: {}", body.trim()),
                    }
                }
                RetryOutcome::ConnectionError { attempts, source } => CandidateFailure {
                    model: model.to_string(),
                    attempts,
                    message: source.to_string(),
                },
                RetryOutcome::NonRetryable(source) => CandidateFailure {
                    model: model.to_string(),
                    attempts: 1,
                    message: source.to_string(),
                },
            };

            tracing::warn!(
                model = %failure.model,
                attempts = failure.attempts,
                error = %failure.message,
                "Model unavailable, trying next candidate"
            );
            failures.push(failure);
        }

        Err(GenerationError::Exhausted { failures })
    }

    async fn stream(
        &self,
        model: &ModelName,
        response: reqwest::Response,
        tx: &mpsc::Sender<String>,
    ) -> Result<GenerationReport, GenerationError> {
        let mut parser = GeminiParser::default();
        let end = process_sse_stream(
            response,
            &mut parser,
            tx,
            self.settings.timeouts.stream_idle,
        )
        .await;

        match end {
            Ok(StreamEnd::Closed) => Ok(GenerationReport {
                model: model.to_string(),
                usage: parser.usage,
                finish_reason: parser.finish_reason,
            }),
            Ok(StreamEnd::ReceiverDropped) => Err(GenerationError::Cancelled),
            Err(message) => {
                tracing::warn!(model = %model, error = %message, "Generation stream failed");
                Err(GenerationError::Stream {
                    model: model.to_string(),
                    message,
                })
            }
        }
    }
}
