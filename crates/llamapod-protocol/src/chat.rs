//! OpenAI-compatible chat completion payloads.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    /// Message authored by the user.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Body of `POST /v1/chat/completions`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    pub messages: Vec<ChatMessage>,

    /// Model identifier as the server knows it (the GGUF file name).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    pub max_tokens: u32,

    pub temperature: f64,
}

impl ChatCompletionRequest {
    /// Single-turn request carrying one user message.
    pub fn single_turn(
        prompt: impl Into<String>,
        model: Option<String>,
        max_tokens: u32,
        temperature: f64,
    ) -> Self {
        Self {
            messages: vec![ChatMessage::user(prompt)],
            model,
            max_tokens,
            temperature,
        }
    }
}

/// Extract `choices[0].message.content` from a chat completion body.
///
/// Returns `None` when the body does not have that shape, including an empty
/// `choices` array or a non-string `content`.
pub fn first_choice_content(body: &Value) -> Option<&str> {
    body.get("choices")?
        .as_array()?
        .first()?
        .get("message")?
        .get("content")?
        .as_str()
}
