//! Health polling for the inference server.
//!
//! Each probe is classified into a [`ProbeOutcome`]. Only `Ready` ends the
//! wait early. Every other outcome counts as a miss until the deadline passes
//! or the server process exits.

use std::time::{Duration, Instant};

use log::{debug, info, warn};
use reqwest::{Client, StatusCode};
use thiserror::Error;

use crate::settings::Settings;

/// Per-probe request timeout.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Log a progress line every this many attempts.
const PROGRESS_EVERY: u32 = 10;

/// Classification of a single health probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// `/health` answered 200.
    Ready,
    /// Nothing is listening yet (connection refused).
    NotListening,
    /// The server answered with a non-200 status.
    Unhealthy(StatusCode),
    /// Any other transport failure.
    Unexpected(String),
}

/// Why the wait for readiness ended without success.
#[derive(Debug, Error)]
pub enum PollError {
    #[error(
        "server did not become ready within {timeout:?} ({attempts} attempts, last unexpected error: {})",
        .last_error.as_deref().unwrap_or("none")
    )]
    TimedOut {
        attempts: u32,
        timeout: Duration,
        last_error: Option<String>,
    },

    #[error("server process {status} before becoming ready (after {attempts} attempts)")]
    Exited { attempts: u32, status: String },
}

/// Polling cadence and bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub timeout: Duration,
}

impl PollPolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            interval: settings.health_poll_interval(),
            timeout: settings.health_timeout(),
        }
    }
}

/// Successful wait summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollReport {
    pub attempts: u32,
    pub elapsed: Duration,
}

/// Probes `GET {base_url}/health`.
#[derive(Debug, Clone)]
pub struct HealthProbe {
    client: Client,
    url: String,
    api_token: Option<String>,
}

impl HealthProbe {
    pub fn new(base_url: &str, api_token: Option<&str>) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(PROBE_TIMEOUT).build()?;
        Ok(Self {
            client,
            url: format!("{}/health", base_url.trim_end_matches('/')),
            api_token: api_token.map(str::to_string),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Issue one probe.
    pub async fn probe(&self) -> ProbeOutcome {
        let mut request = self.client.get(&self.url);
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }

        match request.send().await {
            Ok(response) if response.status() == StatusCode::OK => ProbeOutcome::Ready,
            Ok(response) => ProbeOutcome::Unhealthy(response.status()),
            Err(e) if e.is_connect() => ProbeOutcome::NotListening,
            Err(e) => ProbeOutcome::Unexpected(e.to_string()),
        }
    }

    /// Probe until ready, the deadline passes, or `exited` reports that the
    /// server process is gone.
    ///
    /// `exited` is checked after every missed probe and returns a description
    /// of the exit once the process has stopped.
    pub async fn wait_until_ready<F>(
        &self,
        policy: PollPolicy,
        mut exited: F,
    ) -> Result<PollReport, PollError>
    where
        F: FnMut() -> Option<String>,
    {
        info!("Waiting for llama_cpp.server to become ready at {}...", self.url);

        let start = Instant::now();
        let mut attempts: u32 = 0;
        let mut last_error: Option<String> = None;

        loop {
            attempts += 1;

            match self.probe().await {
                ProbeOutcome::Ready => {
                    let elapsed = start.elapsed();
                    info!(
                        "llama_cpp.server is ready after {} attempts ({:.1}s)",
                        attempts,
                        elapsed.as_secs_f64()
                    );
                    return Ok(PollReport { attempts, elapsed });
                }
                ProbeOutcome::NotListening => {
                    debug!("health attempt {}: server not listening yet", attempts);
                }
                ProbeOutcome::Unhealthy(status) if status.is_client_error() => {
                    // Usually a token mismatch; keep polling but make it visible.
                    warn!("health attempt {}: server answered {}", attempts, status);
                }
                ProbeOutcome::Unhealthy(status) => {
                    debug!("health attempt {}: server answered {}", attempts, status);
                }
                ProbeOutcome::Unexpected(err) => {
                    warn!("Health check failed with unexpected error: {}", err);
                    last_error = Some(err);
                }
            }

            if let Some(status) = exited() {
                return Err(PollError::Exited { attempts, status });
            }

            let elapsed = start.elapsed();
            if elapsed >= policy.timeout {
                return Err(PollError::TimedOut {
                    attempts,
                    timeout: policy.timeout,
                    last_error,
                });
            }

            if attempts % PROGRESS_EVERY == 1 {
                info!(
                    "Server not ready yet, retrying... (attempt {}) - {:.1} minutes elapsed",
                    attempts,
                    elapsed.as_secs_f64() / 60.0
                );
            }

            tokio::time::sleep(policy.interval.min(policy.timeout - elapsed)).await;
        }
    }
}
