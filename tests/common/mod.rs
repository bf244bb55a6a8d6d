//! Shared test utilities and fixtures
//!
//! A mock Gemini endpoint, a gateway pointed at it, and a file-backed
//! database seeded with two hexagrams and one silver-paying account.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};
use yijing_engine::{DivinationOrchestrator, DivinationStream, ReplyEvent};
use yijing_providers::retry::RetryPolicy;
use yijing_providers::{GatewaySettings, GeminiGateway};
use yijing_store::{Database, ReadingDetail, StoreSettings, TextsFile};
use yijing_types::{ApiKey, ModelName, UserId};

pub const PRIMARY: &str = "gemini-2.5-pro";
pub const FALLBACK: &str = "gemini-2.5-flash";

/// 乾 with a moving first line.
pub const HEAVEN: [i64; 6] = [9, 7, 7, 7, 7, 7];

pub fn user() -> UserId {
    UserId::new("google:1001").unwrap()
}

pub fn model_path(model: &str) -> String {
    format!("/models/{model}:streamGenerateContent")
}

/// One SSE event carrying a text part.
pub fn chunk(text: &str) -> String {
    let payload = serde_json::json!({
        "candidates": [{ "content": { "role": "model", "parts": [{ "text": text }] } }]
    });
    format!("data: {payload}\n\n")
}

/// Closing event with a finish reason and usage snapshot.
pub fn finish(prompt_tokens: u64, output_tokens: u64) -> String {
    let payload = serde_json::json!({
        "candidates": [{ "content": { "parts": [] }, "finishReason": "STOP" }],
        "usageMetadata": {
            "promptTokenCount": prompt_tokens,
            "candidatesTokenCount": output_tokens,
            "totalTokenCount": prompt_tokens + output_tokens
        }
    });
    format!("data: {payload}\n\n")
}

/// In-band error event, as Gemini sends when it fails after streaming began.
pub fn stream_error(message: &str) -> String {
    let payload = serde_json::json!({
        "error": { "code": 503, "message": message, "status": "UNAVAILABLE" }
    });
    format!("data: {payload}\n\n")
}

pub fn sse(body: impl Into<String>) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("content-type", "text/event-stream")
        .set_body_string(body.into())
}

pub async fn mount(server: &MockServer, model: &str, response: ResponseTemplate, calls: u64) {
    Mock::given(method("POST"))
        .and(path(model_path(model)))
        .and(query_param("alt", "sse"))
        .respond_with(response)
        .expect(calls)
        .mount(server)
        .await;
}

/// Gateway against `base_url` with millisecond backoff.
pub fn gateway(base_url: &str, fallbacks: &[&str]) -> Arc<GeminiGateway> {
    let mut settings = GatewaySettings::new(
        ApiKey::new("test-key"),
        ModelName::parse(PRIMARY).unwrap(),
    );
    settings.base_url = base_url.to_string();
    settings.fallback_models = fallbacks
        .iter()
        .map(|m| ModelName::parse(m).unwrap())
        .collect();
    settings.https_only = false;
    settings.timeouts.connect = Duration::from_millis(500);
    settings.retry = RetryPolicy {
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        jitter_factor: 0.0,
        ..RetryPolicy::default()
    };
    Arc::new(GeminiGateway::new(settings).unwrap())
}

/// A local address nothing listens on.
pub fn dead_endpoint() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}")
}

pub struct Fixture {
    pub db: Arc<Database>,
    _dir: TempDir,
}

impl Fixture {
    /// Fresh database with reference texts and an account holding `silver`.
    pub fn new(silver: u32) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path().join("yijing.db"), StoreSettings::default()).unwrap();
        let texts: TextsFile = serde_json::from_value(serde_json::json!({
            "hexagrams": [
                {
                    "id": 1,
                    "name": "乾 乾為天",
                    "binary_code": "111111",
                    "judgment": "元亨利貞",
                    "lines": [
                        {"position": "初九", "position_num": 1, "text": "潛龍勿用"},
                        {"position": "上九", "position_num": 6, "text": "亢龍有悔"}
                    ]
                },
                {
                    "id": 2,
                    "name": "坤 坤為地",
                    "binary_code": "000000",
                    "judgment": "元亨利牝馬之貞"
                }
            ]
        }))
        .unwrap();
        db.import_texts(&texts).unwrap();
        db.create_account(&user(), Some("Tester")).unwrap();
        if silver > 0 {
            db.grant_credits(&user(), 0, silver).unwrap();
        }
        Self {
            db: Arc::new(db),
            _dir: dir,
        }
    }

    pub fn orchestrator(&self, gateway: Arc<GeminiGateway>) -> DivinationOrchestrator {
        DivinationOrchestrator::with_database(Arc::clone(&self.db), gateway, None)
    }

    pub fn silver(&self) -> u32 {
        self.db.load_wallet(&user()).unwrap().unwrap().silver
    }

    pub fn readings(&self) -> Vec<ReadingDetail> {
        self.db
            .list_readings(&user(), 50, 0, true)
            .unwrap()
            .into_iter()
            .map(|summary| self.db.reading_detail(&user(), summary.id).unwrap().unwrap())
            .collect()
    }
}

pub async fn drain(stream: &mut DivinationStream) -> Vec<ReplyEvent> {
    let mut events = Vec::new();
    while let Some(event) = stream.next_event().await {
        events.push(event);
    }
    events
}

pub fn text_of(events: &[ReplyEvent]) -> String {
    events
        .iter()
        .filter_map(|event| match event {
            ReplyEvent::Text(text) => Some(text.as_str()),
            _ => None,
        })
        .collect()
}
