//! `llama_cpp.server` configuration document.

use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::settings::{SERVER_HOST, Settings};

/// Top-level document passed via `--config_file`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub models: Vec<ModelConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

/// Per-model runtime parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub model: String,
    pub n_gpu_layers: i32,
    pub n_ctx: u32,
    pub n_batch: u32,
    pub n_threads: u32,
    pub offload_kqv: bool,
    pub use_mlock: bool,
    pub rope_freq_scale: f64,
    pub chat_format: String,
}

impl ServerConfig {
    /// Build the document for a single model served from the models directory.
    pub fn from_settings(settings: &Settings, model_file: &str) -> Self {
        Self {
            host: SERVER_HOST.to_string(),
            port: settings.server_port,
            models: vec![ModelConfig {
                model: settings.model_path(model_file),
                n_gpu_layers: settings.n_gpu_layers,
                n_ctx: settings.n_ctx,
                n_batch: settings.n_batch,
                n_threads: settings.n_threads,
                offload_kqv: settings.offload_kqv,
                use_mlock: settings.use_mlock,
                rope_freq_scale: settings.rope_freq_scale,
                chat_format: settings.chat_format.clone(),
            }],
            api_key: settings.api_token().map(str::to_string),
        }
    }

    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Same document with the API key masked, for logs.
    pub fn redacted(&self) -> Self {
        Self {
            api_key: self.api_key.as_ref().map(|_| "***".to_string()),
            ..self.clone()
        }
    }

    /// Write the document, creating parent directories as needed.
    pub async fn write_to(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let body = self.to_json_pretty().map_err(io::Error::other)?;
        tokio::fs::write(path, body).await
    }

    pub async fn read_from(path: &Path) -> io::Result<Self> {
        let body = tokio::fs::read_to_string(path).await?;
        serde_json::from_str(&body).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}
