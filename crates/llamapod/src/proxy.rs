//! Completion proxy.
//!
//! Forwards a single prompt to the inference server's OpenAI-compatible chat
//! endpoint and folds every failure into a [`CompletionResult::Failure`].

use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use thiserror::Error;

use llamapod_protocol::{
    ChatCompletionRequest, CompletionFailure, CompletionRequest, CompletionResult,
    first_choice_content,
};

use crate::runner::RunnerState;

/// Fixed timeout for a completion call.
pub const COMPLETION_TIMEOUT: Duration = Duration::from_secs(120);

/// Accepted sampling temperature range.
pub const TEMPERATURE_RANGE: std::ops::RangeInclusive<f64> = 0.0..=2.0;

/// Request-level failures. None of these are fatal to the process.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("llama.cpp server is not ready; initialization failed")]
    NotReady,

    #[error("no prompt provided")]
    MissingPrompt,

    #[error("invalid {name}: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error("failed to get response from server: upstream returned {status}")]
    Upstream {
        status: StatusCode,
        details: Option<Value>,
        raw_text: Option<String>,
    },

    #[error("failed to get response from server: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("unexpected response format from server")]
    UnexpectedFormat { raw_text: String },

    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl From<ProxyError> for CompletionFailure {
    fn from(err: ProxyError) -> Self {
        let message = err.to_string();
        match err {
            ProxyError::Upstream {
                details: Some(details),
                ..
            } => CompletionFailure::new(message).with_details(details),
            ProxyError::Upstream {
                raw_text: Some(raw),
                ..
            }
            | ProxyError::UnexpectedFormat { raw_text: raw } => {
                CompletionFailure::new(message).with_raw_text(raw)
            }
            _ => CompletionFailure::new(message),
        }
    }
}

/// Validate caller input before anything touches the network.
pub fn validate(request: &CompletionRequest) -> Result<(), ProxyError> {
    if request.prompt.is_empty() {
        return Err(ProxyError::MissingPrompt);
    }
    if request.max_tokens == 0 {
        return Err(ProxyError::InvalidParameter {
            name: "max_tokens",
            reason: "must be greater than zero".to_string(),
        });
    }
    if !request.temperature.is_finite() || !TEMPERATURE_RANGE.contains(&request.temperature) {
        return Err(ProxyError::InvalidParameter {
            name: "temperature",
            reason: format!(
                "{} is outside {}..={}",
                request.temperature,
                TEMPERATURE_RANGE.start(),
                TEMPERATURE_RANGE.end()
            ),
        });
    }
    Ok(())
}

/// Client for `POST {base_url}/v1/chat/completions`.
#[derive(Debug, Clone)]
pub struct CompletionProxy {
    client: Client,
    state: Arc<RunnerState>,
}

impl CompletionProxy {
    pub fn new(state: Arc<RunnerState>) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(COMPLETION_TIMEOUT).build()?;
        Ok(Self { client, state })
    }

    pub fn state(&self) -> &RunnerState {
        &self.state
    }

    /// Run one completion, converting every error into a failure result.
    pub async fn complete(&self, request: &CompletionRequest) -> CompletionResult {
        match self.try_complete(request).await {
            Ok(text) => CompletionResult::success(text),
            Err(err) => {
                match &err {
                    ProxyError::NotReady
                    | ProxyError::MissingPrompt
                    | ProxyError::InvalidParameter { .. } => debug!("rejected request: {}", err),
                    _ => warn!("Error communicating with LLM server: {}", err),
                }
                CompletionResult::Failure(err.into())
            }
        }
    }

    /// Run one completion, returning the generated text.
    pub async fn try_complete(&self, request: &CompletionRequest) -> Result<String, ProxyError> {
        if !self.state.is_ready() {
            return Err(ProxyError::NotReady);
        }
        validate(request)?;

        let payload = ChatCompletionRequest::single_turn(
            request.prompt.as_str(),
            self.state.model_identifier().map(str::to_string),
            request.max_tokens,
            request.temperature,
        );
        let body =
            serde_json::to_vec(&payload).map_err(|e| ProxyError::Unexpected(e.to_string()))?;

        let url = format!(
            "{}/v1/chat/completions",
            self.state.base_url().trim_end_matches('/')
        );
        let mut builder = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body);
        if let Some(token) = self.state.auth_token() {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await.map_err(ProxyError::Transport)?;
        let status = response.status();
        let text = response.text().await.map_err(ProxyError::Transport)?;

        if !status.is_success() {
            let details = serde_json::from_str::<Value>(&text).ok();
            let raw_text = details.is_none().then_some(text);
            return Err(ProxyError::Upstream {
                status,
                details,
                raw_text,
            });
        }

        let Ok(value) = serde_json::from_str::<Value>(&text) else {
            return Err(ProxyError::UnexpectedFormat { raw_text: text });
        };
        match first_choice_content(&value) {
            Some(content) => Ok(content.to_string()),
            None => Err(ProxyError::UnexpectedFormat { raw_text: text }),
        }
    }
}
