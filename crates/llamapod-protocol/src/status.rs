//! Runner status report.

use serde::{Deserialize, Serialize};

/// Snapshot of the runner's readiness and connection settings.
///
/// `api_token` only says whether a token is configured; the token itself is
/// never reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerStatus {
    pub is_ready: bool,
    pub server_url: String,
    #[serde(default)]
    pub model_file: Option<String>,
    pub api_token: bool,
}
