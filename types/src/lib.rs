//! Core domain types for Yijing.
//!
//! This crate contains pure domain types with no IO, no async, and minimal dependencies.
//! Everything here can be used from any layer of the application.

#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

mod hexagram;
mod ids;
mod request;
mod usage;
mod wallet;

pub use hexagram::{
    HexagramCode, HexagramCodeError, HexagramContext, HexagramFigure, HexagramRecord,
    LINE_COUNT, LineText, Throw, ThrowError, Trigram, line_label, parse_throws,
};
pub use ids::{EmptyUserIdError, ReadingId, UserId};
pub use request::{
    ClientApp, ClientContext, MAX_QUESTION_CHARS, MAX_USER_NAME_CHARS, Question,
    RequestInputError, UserName,
};
pub use usage::{FinishReason, GenerationReport, GenerationUsage};
pub use wallet::{
    ConsumeOutcome, ConsumePlan, ConsumeRejection, Consumption, CreditTier, WalletState,
    daily_quota_limit, quota_day,
};

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ============================================================================
// Generation service credentials & models
// ============================================================================

/// API key for the generation service. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ApiKey(<redacted>)")
    }
}

impl ApiKey {
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    #[must_use]
    pub fn expose_secret(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Error)]
pub enum ModelParseError {
    #[error("model name must not be empty")]
    Empty,
    #[error("model name {0:?} contains characters not allowed in a URL path segment")]
    InvalidCharacters(String),
}

/// Generation model identifier, e.g. `gemini-2.5-pro`.
///
/// The name is interpolated into the request path, so it is restricted to
/// ASCII alphanumerics, `-`, `.` and `_`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ModelName(String);

impl ModelName {
    pub fn parse(raw: &str) -> Result<Self, ModelParseError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ModelParseError::Empty);
        }
        if !trimmed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_'))
        {
            return Err(ModelParseError::InvalidCharacters(trimmed.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ModelName {
    type Error = ModelParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ModelName> for String {
    fn from(value: ModelName) -> Self {
        value.0
    }
}

impl fmt::Display for ModelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Primary model followed by fallbacks, duplicates removed, first occurrence wins.
#[must_use]
pub fn candidate_models(primary: &ModelName, fallbacks: &[ModelName]) -> Vec<ModelName> {
    let mut out: Vec<ModelName> = Vec::with_capacity(fallbacks.len() + 1);
    for model in std::iter::once(primary).chain(fallbacks) {
        if !out.contains(model) {
            out.push(model.clone());
        }
    }
    out
}
