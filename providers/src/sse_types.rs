//! Typed SSE payloads.

pub mod gemini {
    use serde::Deserialize;
    use yijing_types::GenerationUsage;

    /// Token usage data returned by the Gemini API.
    ///
    /// Every count is cumulative for the request so far.
    #[derive(Debug, Deserialize, Default)]
    #[serde(rename_all = "camelCase")]
    pub struct UsageMetadata {
        #[serde(default)]
        pub prompt_token_count: u64,
        #[serde(default)]
        pub cached_content_token_count: u64,
        #[serde(default)]
        pub thoughts_token_count: u64,
        #[serde(default)]
        pub candidates_token_count: u64,
        #[serde(default)]
        pub total_token_count: u64,
    }

    impl From<UsageMetadata> for GenerationUsage {
        fn from(usage: UsageMetadata) -> Self {
            Self {
                prompt_tokens: usage.prompt_token_count,
                cached_tokens: usage.cached_content_token_count,
                thought_tokens: usage.thoughts_token_count,
                output_tokens: usage.candidates_token_count,
                total_tokens: usage.total_token_count,
            }
        }
    }

    /// Top-level Gemini SSE response.
    ///
    /// Gemini doesn't use event types. Each SSE chunk is a complete response
    /// object with candidates.
    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Response {
        pub candidates: Option<Vec<Candidate>>,
        pub error: Option<ErrorInfo>,
        pub usage_metadata: Option<UsageMetadata>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Candidate {
        pub content: Option<Content>,
        pub finish_reason: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Content {
        pub parts: Option<Vec<Part>>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Part {
        pub text: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    pub struct ErrorInfo {
        pub message: Option<String>,
        pub code: Option<i32>,
        pub status: Option<String>,
    }

    impl ErrorInfo {
        #[must_use]
        pub fn message_or_default(&self) -> &str {
            self.message.as_deref().unwrap_or("Unknown error")
        }

        #[must_use]
        pub fn describe(&self) -> String {
            match (self.code, self.status.as_deref()) {
                (Some(code), Some(status)) => {
                    format!("{code} {status}: {}", self.message_or_default())
                }
                (Some(code), None) => format!("{code}: {}", self.message_or_default()),
                (None, Some(status)) => format!("{status}: {}", self.message_or_default()),
                (None, None) => self.message_or_default().to_string(),
            }
        }
    }

}
