//! Runner settings.
//!
//! Settings come from built-in defaults, an optional TOML file, and the
//! process environment, in that order of precedence (last wins). Environment
//! variables use their bare names (`SERVER_PORT`, `HF_MODEL_REPO`, ...).

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File, FileFormat, Map};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Port the inference server listens on when `SERVER_PORT` is unset.
pub const DEFAULT_SERVER_PORT: u16 = 9095;

/// Bind address written into the server config document.
pub const SERVER_HOST: &str = "0.0.0.0";

/// Canonical health polling bound.
pub const DEFAULT_HEALTH_TIMEOUT_SECS: u64 = 600;

const REDACTED: &str = "***";

/// Errors raised while loading or validating settings.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The config sources could not be read or deserialized.
    #[error("failed to load settings: {0}")]
    Load(#[from] config::ConfigError),

    /// A mandatory value is absent or empty.
    #[error("{0} environment variable not set")]
    Missing(&'static str),

    /// A value is present but unusable.
    #[error("invalid setting {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Effective runner settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server_port: u16,
    pub hugging_face_token: Option<String>,
    pub hf_model_repo: Option<String>,
    pub hf_model_file: Option<String>,
    pub server_config_file: String,
    pub models_dir: String,
    pub n_gpu_layers: i32,
    pub n_ctx: u32,
    pub n_batch: u32,
    pub n_threads: u32,
    pub offload_kqv: bool,
    pub use_mlock: bool,
    pub rope_freq_scale: f64,
    pub chat_format: String,
    pub api_token: Option<String>,
    /// Skip the pip/`hf auth` install steps (pre-baked images).
    pub skip_setup: bool,
    pub health_timeout_secs: u64,
    pub health_poll_interval_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_port: DEFAULT_SERVER_PORT,
            hugging_face_token: None,
            hf_model_repo: None,
            hf_model_file: None,
            server_config_file: "server_config.json".to_string(),
            models_dir: "models".to_string(),
            n_gpu_layers: -1,
            n_ctx: 40000,
            n_batch: 512,
            n_threads: 8,
            offload_kqv: true,
            use_mlock: true,
            rope_freq_scale: 4.0,
            chat_format: "gemma".to_string(),
            api_token: None,
            skip_setup: false,
            health_timeout_secs: DEFAULT_HEALTH_TIMEOUT_SECS,
            health_poll_interval_ms: 1000,
        }
    }
}

/// The values initialization cannot proceed without.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSource {
    pub hf_token: String,
    pub model_repo: String,
    pub model_file: String,
}

impl Settings {
    /// Load settings from the optional TOML file and the process environment.
    pub fn load(config_file: Option<&Path>) -> Result<Self, SettingsError> {
        Self::load_from(config_file, None)
    }

    /// Load settings, reading environment values from `env` instead of the
    /// process environment when it is provided.
    pub fn load_from(
        config_file: Option<&Path>,
        env: Option<Map<String, String>>,
    ) -> Result<Self, SettingsError> {
        let mut builder = Config::builder();
        if let Some(path) = config_file {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
        }

        let built = builder
            .add_source(Environment::default().ignore_empty(true).source(env))
            .build()?;

        Ok(built.try_deserialize()?)
    }

    /// Check the mandatory values, in the order an operator would set them.
    pub fn require_model_source(&self) -> Result<ModelSource, SettingsError> {
        let hf_token = required(&self.hugging_face_token, "HUGGING_FACE_TOKEN")?;
        let model_repo = required(&self.hf_model_repo, "HF_MODEL_REPO")?;
        let model_file = required(&self.hf_model_file, "HF_MODEL_FILE")?;
        self.validate()?;
        Ok(ModelSource {
            hf_token,
            model_repo,
            model_file,
        })
    }

    fn validate(&self) -> Result<(), SettingsError> {
        if self.server_port == 0 {
            return Err(SettingsError::Invalid {
                name: "SERVER_PORT",
                reason: "port must be non-zero".to_string(),
            });
        }
        if self.health_poll_interval_ms == 0 {
            return Err(SettingsError::Invalid {
                name: "HEALTH_POLL_INTERVAL_MS",
                reason: "interval must be non-zero".to_string(),
            });
        }
        if self.server_config_file.trim().is_empty() {
            return Err(SettingsError::Invalid {
                name: "SERVER_CONFIG_FILE",
                reason: "path must not be empty".to_string(),
            });
        }
        if !self.rope_freq_scale.is_finite() {
            return Err(SettingsError::Invalid {
                name: "ROPE_FREQ_SCALE",
                reason: format!("{} is not a finite number", self.rope_freq_scale),
            });
        }
        Ok(())
    }

    /// URL the runner uses to reach the inference server.
    pub fn base_url(&self) -> String {
        format!("http://localhost:{}", self.server_port)
    }

    /// Optional API token, with empty values treated as unset.
    pub fn api_token(&self) -> Option<&str> {
        self.api_token.as_deref().filter(|t| !t.trim().is_empty())
    }

    /// Where the server config document is written.
    pub fn config_path(&self) -> PathBuf {
        expand(&self.server_config_file)
    }

    pub fn models_dir(&self) -> PathBuf {
        expand(&self.models_dir)
    }

    /// Model path as written into the server config document. Uses the
    /// expanded models directory, the same one setup downloads into.
    pub fn model_path(&self, model_file: &str) -> String {
        self.models_dir().join(model_file).display().to_string()
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs)
    }

    pub fn health_poll_interval(&self) -> Duration {
        Duration::from_millis(self.health_poll_interval_ms)
    }

    /// Copy with every secret replaced, for display.
    pub fn redacted(&self) -> Self {
        let mask = |v: &Option<String>| v.as_ref().map(|_| REDACTED.to_string());
        Self {
            hugging_face_token: mask(&self.hugging_face_token),
            api_token: mask(&self.api_token),
            ..self.clone()
        }
    }
}

fn required(value: &Option<String>, name: &'static str) -> Result<String, SettingsError> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or(SettingsError::Missing(name))
}

fn expand(text: &str) -> PathBuf {
    match shellexpand::full(text) {
        Ok(expanded) => PathBuf::from(expanded.as_ref()),
        Err(_) => PathBuf::from(text),
    }
}
