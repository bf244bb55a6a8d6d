//! Token accounting and completion status reported by the generation service.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Token counts from the most recent usage snapshot of a generation.
///
/// The upstream service repeats cumulative usage on many stream events; the
/// latest snapshot replaces earlier ones rather than being summed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationUsage {
    pub prompt_tokens: u64,
    pub cached_tokens: u64,
    pub thought_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

impl GenerationUsage {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Why the service stopped producing text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum FinishReason {
    Stop,
    MaxTokens,
    Safety,
    Recitation,
    Language,
    Blocklist,
    ProhibitedContent,
    Spii,
    Other,
    Unknown(String),
}

impl FinishReason {
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw {
            "STOP" => Self::Stop,
            "MAX_TOKENS" => Self::MaxTokens,
            "SAFETY" => Self::Safety,
            "RECITATION" => Self::Recitation,
            "LANGUAGE" => Self::Language,
            "BLOCKLIST" => Self::Blocklist,
            "PROHIBITED_CONTENT" => Self::ProhibitedContent,
            "SPII" => Self::Spii,
            "OTHER" => Self::Other,
            other => Self::Unknown(other.to_string()),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Stop => "STOP",
            Self::MaxTokens => "MAX_TOKENS",
            Self::Safety => "SAFETY",
            Self::Recitation => "RECITATION",
            Self::Language => "LANGUAGE",
            Self::Blocklist => "BLOCKLIST",
            Self::ProhibitedContent => "PROHIBITED_CONTENT",
            Self::Spii => "SPII",
            Self::Other => "OTHER",
            Self::Unknown(raw) => raw,
        }
    }

    /// Natural completion. `MAX_TOKENS` still yields usable text but is reported as truncation.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Stop)
    }
}

impl From<String> for FinishReason {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<FinishReason> for String {
    fn from(value: FinishReason) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for FinishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Summary of a finished generation: which model answered and what it reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationReport {
    pub model: String,
    pub usage: Option<GenerationUsage>,
    pub finish_reason: Option<FinishReason>,
}

impl GenerationReport {
    #[must_use]
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            usage: None,
            finish_reason: None,
        }
    }
}
