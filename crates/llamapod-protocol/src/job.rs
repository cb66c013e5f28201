//! Serverless job envelope.
//!
//! A job arrives as `{ "id": "...", "input": { "prompt": "...", ... } }` and
//! produces either `{ "result": "..." }` or
//! `{ "error": "...", "details": ..., "response_text": "..." }`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::completion::{
    CompletionRequest, CompletionResult, DEFAULT_MAX_TOKENS, DEFAULT_TEMPERATURE,
};

/// A unit of work submitted by the serverless platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub input: JobInput,
}

/// Caller-supplied generation input.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
}

impl JobInput {
    /// Build a completion request, filling in defaults for absent parameters.
    ///
    /// A missing prompt becomes an empty one; the proxy rejects it.
    pub fn to_completion_request(&self) -> CompletionRequest {
        CompletionRequest {
            prompt: self.prompt.clone().unwrap_or_default(),
            max_tokens: self.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            temperature: self.temperature.unwrap_or(DEFAULT_TEMPERATURE),
        }
    }
}

/// Handler output returned to the platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobOutput {
    Result {
        result: String,
    },
    Error {
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response_text: Option<String>,
    },
}

impl JobOutput {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            error: message.into(),
            details: None,
            response_text: None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}

impl From<CompletionResult> for JobOutput {
    fn from(result: CompletionResult) -> Self {
        match result {
            CompletionResult::Success { text } => Self::Result { result: text },
            CompletionResult::Failure(failure) => Self::Error {
                error: failure.message,
                details: failure.details,
                response_text: failure.raw_text,
            },
        }
    }
}

/// Terminal job state reported by the synchronous job endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Completed,
    Failed,
}

/// Response envelope for a synchronously executed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResponse {
    pub id: String,
    pub status: JobStatus,
    pub output: JobOutput,
}

impl JobResponse {
    /// Wrap handler output, deriving the status from its variant.
    pub fn new(id: impl Into<String>, output: JobOutput) -> Self {
        let status = if output.is_error() {
            JobStatus::Failed
        } else {
            JobStatus::Completed
        };
        Self {
            id: id.into(),
            status,
            output,
        }
    }
}
