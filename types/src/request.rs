//! Validated inputs of a divination request.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MAX_QUESTION_CHARS: usize = 500;
pub const MAX_USER_NAME_CHARS: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestInputError {
    #[error("question must not be empty")]
    EmptyQuestion,
    #[error("question is too long ({0} characters, max {MAX_QUESTION_CHARS})")]
    QuestionTooLong(usize),
    #[error("user name is too long ({0} characters, max {MAX_USER_NAME_CHARS})")]
    UserNameTooLong(usize),
    #[error("unknown client app {0:?}; expected web, ios or android")]
    UnknownClientApp(String),
}

/// A trimmed question of 1..=500 characters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(into = "String")]
pub struct Question(String);

impl Question {
    pub fn new(raw: &str) -> Result<Self, RequestInputError> {
        let trimmed = raw.trim();
        let chars = trimmed.chars().count();
        if chars == 0 {
            return Err(RequestInputError::EmptyQuestion);
        }
        if chars > MAX_QUESTION_CHARS {
            return Err(RequestInputError::QuestionTooLong(chars));
        }
        Ok(Self(trimmed.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<Question> for String {
    fn from(value: Question) -> Self {
        value.0
    }
}

impl fmt::Display for Question {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Optional caller-supplied display name; blank input means "no name".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserName(String);

impl UserName {
    pub fn parse(raw: Option<&str>) -> Result<Option<Self>, RequestInputError> {
        let Some(trimmed) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
            return Ok(None);
        };
        let chars = trimmed.chars().count();
        if chars > MAX_USER_NAME_CHARS {
            return Err(RequestInputError::UserNameTooLong(chars));
        }
        Ok(Some(Self(trimmed.to_string())))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientApp {
    Web,
    Ios,
    Android,
}

impl ClientApp {
    pub fn parse(raw: &str) -> Result<Self, RequestInputError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "web" => Ok(Self::Web),
            "ios" => Ok(Self::Ios),
            "android" => Ok(Self::Android),
            _ => Err(RequestInputError::UnknownClientApp(raw.to_string())),
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Web => "web",
            Self::Ios => "ios",
            Self::Android => "android",
        }
    }
}

/// Which client surface issued the request. Logged only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientContext {
    pub app: ClientApp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}
