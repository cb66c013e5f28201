//! Runner initialization.
//!
//! [`Initializer::initialize`] validates settings, runs setup, writes the
//! server config, launches `llama_cpp.server`, and waits for `/health`. On
//! success it returns a [`Runner`] that owns the process and hands out the
//! read-only [`RunnerState`] shared with request handlers.

use std::sync::Arc;

use log::{info, warn};
use thiserror::Error;

use llamapod_protocol::RunnerStatus;

use crate::health::{HealthProbe, PollError, PollPolicy};
use crate::process::{LlamaCppLauncher, ProcessError, ServerLauncher, ServerProcess};
use crate::server_config::ServerConfig;
use crate::settings::{Settings, SettingsError};
use crate::setup::{self, CommandRunner, SetupError, SystemCommandRunner};

/// Fatal initialization failures. Every variant ends the process.
#[derive(Debug, Error)]
pub enum InitError {
    #[error("configuration error: {0}")]
    Config(#[from] SettingsError),

    #[error("setup failed: {0}")]
    Setup(#[from] SetupError),

    #[error("failed to start llama_cpp.server: {0}")]
    Launch(#[from] ProcessError),

    #[error("failed to build health client: {0}")]
    HealthClient(#[source] reqwest::Error),

    #[error(
        "llama_cpp.server did not become ready within {timeout:?} after {attempts} attempts (last unexpected error: {})",
        .last_error.as_deref().unwrap_or("none")
    )]
    StartupTimeout {
        attempts: u32,
        timeout: std::time::Duration,
        last_error: Option<String>,
    },

    #[error("llama_cpp.server {status} before becoming ready")]
    ProcessExited { status: String },
}

impl From<PollError> for InitError {
    fn from(err: PollError) -> Self {
        match err {
            PollError::TimedOut {
                attempts,
                timeout,
                last_error,
            } => Self::StartupTimeout {
                attempts,
                timeout,
                last_error,
            },
            PollError::Exited { status, .. } => Self::ProcessExited { status },
        }
    }
}

/// Read-only view of the runner shared with request handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerState {
    ready: bool,
    base_url: String,
    model_identifier: Option<String>,
    auth_token: Option<String>,
}

impl RunnerState {
    /// A state that is not yet ready.
    pub fn new(
        base_url: impl Into<String>,
        model_identifier: Option<String>,
        auth_token: Option<String>,
    ) -> Self {
        Self {
            ready: false,
            base_url: base_url.into(),
            model_identifier,
            auth_token,
        }
    }

    /// Mark the state ready. Consumes the value so readiness can only be set
    /// while the state is still exclusively owned.
    pub fn into_ready(mut self) -> Self {
        self.ready = true;
        self
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn model_identifier(&self) -> Option<&str> {
        self.model_identifier.as_deref()
    }

    pub fn auth_token(&self) -> Option<&str> {
        self.auth_token.as_deref()
    }

    pub fn status(&self) -> RunnerStatus {
        RunnerStatus {
            is_ready: self.ready,
            server_url: self.base_url.clone(),
            model_file: self.model_identifier.clone(),
            api_token: self.auth_token.is_some(),
        }
    }
}

/// A ready inference server and its owned process.
#[derive(Debug)]
pub struct Runner {
    state: Arc<RunnerState>,
    process: ServerProcess,
}

impl Runner {
    pub fn state(&self) -> Arc<RunnerState> {
        Arc::clone(&self.state)
    }

    pub fn pid(&self) -> u32 {
        self.process.pid
    }

    /// Terminate the inference server.
    pub async fn shutdown(mut self) -> Result<(), ProcessError> {
        self.process.terminate().await
    }
}

/// Drives the bring-up sequence.
pub struct Initializer<'a> {
    settings: &'a Settings,
    commands: Arc<dyn CommandRunner>,
    launcher: Arc<dyn ServerLauncher>,
}

impl<'a> Initializer<'a> {
    /// Initializer using real commands and `python3 -m llama_cpp.server`.
    pub fn new(settings: &'a Settings) -> Self {
        Self {
            settings,
            commands: Arc::new(SystemCommandRunner),
            launcher: Arc::new(LlamaCppLauncher::default()),
        }
    }

    pub fn with_command_runner(mut self, commands: Arc<dyn CommandRunner>) -> Self {
        self.commands = commands;
        self
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn ServerLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    /// Write the server config document without setup or launch.
    pub async fn write_server_config(&self) -> Result<ServerConfig, InitError> {
        let source = self.settings.require_model_source()?;
        let document = ServerConfig::from_settings(self.settings, &source.model_file);
        let path = self.settings.config_path();
        document
            .write_to(&path)
            .await
            .map_err(|source| SetupError::Io {
                path: path.clone(),
                source,
            })?;
        Ok(document)
    }

    pub async fn initialize(self) -> Result<Runner, InitError> {
        info!("Initializing llama.cpp runner...");
        let settings = self.settings;
        let source = settings.require_model_source()?;

        let models_dir = settings.models_dir();
        tokio::fs::create_dir_all(&models_dir)
            .await
            .map_err(|source| SetupError::Io {
                path: models_dir.clone(),
                source,
            })?;

        let model_present = tokio::fs::try_exists(models_dir.join(&source.model_file))
            .await
            .unwrap_or(false);
        if model_present {
            info!("Model {} already present, skipping download", source.model_file);
        }
        let steps = setup::plan(settings, &source, model_present);
        setup::run_all(self.commands.as_ref(), &steps).await?;

        let document = self.write_server_config().await?;
        match document.redacted().to_json_pretty() {
            Ok(json) => info!(
                "Generated {} with content:\n{}",
                settings.config_path().display(),
                json
            ),
            Err(e) => warn!("Failed to render server config for logging: {}", e),
        }

        let probe = HealthProbe::new(&settings.base_url(), settings.api_token())
            .map_err(InitError::HealthClient)?;

        let mut process = self.launcher.launch(&settings.config_path()).await?;

        let policy = PollPolicy::from_settings(settings);
        let waited = probe
            .wait_until_ready(policy, || process.exit_description())
            .await;

        if let Err(err) = waited {
            warn!("llama_cpp.server failed to start: {}", err);
            if let Err(kill_err) = process.terminate().await {
                warn!("Failed to terminate llama_cpp.server: {}", kill_err);
            }
            return Err(err.into());
        }

        let state = RunnerState::new(
            settings.base_url(),
            Some(source.model_file),
            settings.api_token().map(str::to_string),
        )
        .into_ready();

        Ok(Runner {
            state: Arc::new(state),
            process,
        })
    }
}

/// Initialize with the real command runner and launcher.
pub async fn initialize(settings: &Settings) -> Result<Runner, InitError> {
    Initializer::new(settings).initialize().await
}
