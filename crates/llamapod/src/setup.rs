//! Dependency installation and model download.
//!
//! Setup is a fixed list of external commands run one after another. The
//! first failure aborts the rest.

use std::io;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use log::{debug, info, warn};
use thiserror::Error;
use tokio::process::Command;

use crate::settings::{ModelSource, Settings};

/// Wheel index carrying CUDA builds of llama-cpp-python.
pub const LLAMA_CPP_WHEEL_INDEX: &str = "https://abetlen.github.io/llama-cpp-python/whl/cu124";

/// Errors raised by setup steps.
#[derive(Debug, Error)]
pub enum SetupError {
    /// The command could not be started.
    #[error("failed to start `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    /// The command ran and exited unsuccessfully.
    #[error("`{command}` {status}: {stderr}")]
    StepFailed {
        command: String,
        status: String,
        stderr: String,
    },

    /// A filesystem operation failed.
    #[error("failed to prepare {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// One external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupStep {
    pub program: String,
    pub args: Vec<String>,
    secrets: Vec<String>,
}

impl SetupStep {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            secrets: Vec::new(),
        }
    }

    /// Mask `secret` wherever it appears when the step is displayed.
    pub fn redacting(mut self, secret: impl Into<String>) -> Self {
        let secret = secret.into();
        if !secret.is_empty() {
            self.secrets.push(secret);
        }
        self
    }

    /// Command line safe for logs and error messages.
    pub fn display(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            if self.secrets.iter().any(|s| arg.contains(s.as_str())) {
                let mut masked = arg.clone();
                for secret in &self.secrets {
                    masked = masked.replace(secret.as_str(), "***");
                }
                line.push_str(&masked);
            } else {
                line.push_str(arg);
            }
        }
        line
    }
}

/// Executes setup steps.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, step: &SetupStep) -> Result<(), SetupError>;
}

/// Runs steps as real child processes, logging their output.
#[derive(Debug, Default)]
pub struct SystemCommandRunner;

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(&self, step: &SetupStep) -> Result<(), SetupError> {
        let command = step.display();
        info!("Executing command: {}", command);

        let output = Command::new(&step.program)
            .args(&step.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| SetupError::Spawn {
                command: command.clone(),
                source,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stdout.trim().is_empty() {
            debug!("STDOUT:\n{}", stdout.trim_end());
        }
        if !stderr.trim().is_empty() {
            debug!("STDERR:\n{}", stderr.trim_end());
        }

        if output.status.success() {
            Ok(())
        } else {
            warn!("Command failed ({}): {}", output.status, command);
            Err(SetupError::StepFailed {
                command,
                status: output.status.to_string(),
                stderr: stderr.trim().to_string(),
            })
        }
    }
}

/// Steps needed to bring a fresh image to a runnable state.
///
/// Install and login steps are skipped when `skip_setup` is set; the
/// download is skipped when the model file is already on disk.
pub fn plan(settings: &Settings, source: &ModelSource, model_present: bool) -> Vec<SetupStep> {
    let mut steps = Vec::new();

    if !settings.skip_setup {
        steps.push(SetupStep::new(
            "pip",
            [
                "install",
                "llama-cpp-python[server]",
                "--extra-index-url",
                LLAMA_CPP_WHEEL_INDEX,
            ],
        ));
        steps.push(SetupStep::new("pip", ["install", "-U", "huggingface_hub"]));
        steps.push(
            SetupStep::new("hf", ["auth", "login", "--token", source.hf_token.as_str()])
                .redacting(source.hf_token.as_str()),
        );
    }

    if !model_present {
        let models_dir = settings.models_dir().display().to_string();
        let local_dir = format!("{}/", models_dir.trim_end_matches('/'));
        steps.push(
            SetupStep::new(
                "hf",
                [
                    "download",
                    source.model_repo.as_str(),
                    source.model_file.as_str(),
                    "--local-dir",
                    local_dir.as_str(),
                ],
            )
            .redacting(source.hf_token.as_str()),
        );
    }

    steps
}

/// Run every step in order, stopping at the first failure.
pub async fn run_all(runner: &dyn CommandRunner, steps: &[SetupStep]) -> Result<(), SetupError> {
    for (index, step) in steps.iter().enumerate() {
        debug!("setup step {}/{}: {}", index + 1, steps.len(), step.display());
        runner.run(step).await?;
    }
    Ok(())
}
