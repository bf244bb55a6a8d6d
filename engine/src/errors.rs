//! Request-level failures and their HTTP-style classification.

use std::fmt;

use serde::Serialize;
use thiserror::Error;
use yijing_types::{ConsumeRejection, RequestInputError, ThrowError};

/// Broad category an outer layer maps to a response code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Input,
    Unauthorized,
    RateLimited,
    PaymentRequired,
    ReferenceData,
    Upstream,
    Internal,
}

impl ErrorClass {
    #[must_use]
    pub const fn status_code(self) -> u16 {
        match self {
            Self::Input => 400,
            Self::Unauthorized => 401,
            Self::PaymentRequired => 402,
            Self::RateLimited => 429,
            Self::ReferenceData | Self::Internal => 500,
            Self::Upstream => 503,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Input => "missing_or_invalid_fields",
            Self::Unauthorized => "invalid_or_expired_token",
            Self::RateLimited => "rate_limited",
            Self::PaymentRequired => "insufficient_coins",
            Self::ReferenceData | Self::Internal => "server_error",
            Self::Upstream => "llm_unavailable",
        }
    }
}

/// Why a generation delivered nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The stream closed normally without any text.
    EmptyResponse,
    /// The backend failed before (or while) producing text.
    Upstream(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyResponse => f.write_str("empty response"),
            Self::Upstream(message) => f.write_str(message),
        }
    }
}

#[derive(Debug, Error)]
pub enum DivinationError {
    #[error("invalid throws: {0}")]
    InvalidThrows(#[from] ThrowError),
    #[error("invalid request: {0}")]
    InvalidInput(#[from] RequestInputError),
    #[error("no hexagram recorded for code {code}")]
    HexagramNotFound { code: String },
    #[error("daily quota reached")]
    DailyQuotaReached,
    #[error("insufficient coins")]
    NoCoins,
    #[error("account not found")]
    AccountNotFound,
    #[error("generation failed: {0}")]
    Generation(FailureReason),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl DivinationError {
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidThrows(_) | Self::InvalidInput(_) => ErrorClass::Input,
            Self::HexagramNotFound { .. } => ErrorClass::ReferenceData,
            Self::DailyQuotaReached => ErrorClass::RateLimited,
            Self::NoCoins => ErrorClass::PaymentRequired,
            Self::AccountNotFound => ErrorClass::Unauthorized,
            Self::Generation(_) => ErrorClass::Upstream,
            Self::Internal(_) => ErrorClass::Internal,
        }
    }

    #[must_use]
    pub fn status_code(&self) -> u16 {
        self.class().status_code()
    }
}

impl From<ConsumeRejection> for DivinationError {
    fn from(rejection: ConsumeRejection) -> Self {
        match rejection {
            ConsumeRejection::DailyQuotaReached => Self::DailyQuotaReached,
            ConsumeRejection::NoCoins => Self::NoCoins,
            ConsumeRejection::AccountNotFound => Self::AccountNotFound,
        }
    }
}
