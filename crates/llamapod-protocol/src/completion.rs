//! Typed completion request and result.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default `max_tokens` when the caller does not supply one.
pub const DEFAULT_MAX_TOKENS: u32 = 500;

/// Default sampling temperature when the caller does not supply one.
pub const DEFAULT_TEMPERATURE: f64 = 0.7;

/// A single-prompt completion request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f64,
}

impl CompletionRequest {
    /// Request with default generation parameters.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }
}

/// Failure half of [`CompletionResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionFailure {
    /// Human-readable description.
    pub message: String,

    /// Structured error body returned by the upstream server, if it was JSON.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,

    /// Raw upstream body when it could not be interpreted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_text: Option<String>,
}

impl CompletionFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: None,
            raw_text: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_raw_text(mut self, raw_text: impl Into<String>) -> Self {
        self.raw_text = Some(raw_text.into());
        self
    }
}

/// Outcome of a completion call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CompletionResult {
    Success { text: String },
    Failure(CompletionFailure),
}

impl CompletionResult {
    pub fn success(text: impl Into<String>) -> Self {
        Self::Success { text: text.into() }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self::Failure(CompletionFailure::new(message))
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Generated text, if the call succeeded.
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Success { text } => Some(text),
            Self::Failure(_) => None,
        }
    }

    /// Failure payload, if the call failed.
    pub fn failure_ref(&self) -> Option<&CompletionFailure> {
        match self {
            Self::Success { .. } => None,
            Self::Failure(failure) => Some(failure),
        }
    }
}

impl From<CompletionFailure> for CompletionResult {
    fn from(failure: CompletionFailure) -> Self {
        Self::Failure(failure)
    }
}
