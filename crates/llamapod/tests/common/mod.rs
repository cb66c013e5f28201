//! Test utilities: a fake llama.cpp server and fake setup/launch seams.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::{
    Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::IntoResponse,
    routing::{get, post},
};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::process::Command;

use llamapod::Settings;
use llamapod::process::{ProcessError, ServerLauncher, ServerProcess};
use llamapod::setup::{CommandRunner, SetupError, SetupStep};

/// Request captured by the fake completion endpoint.
#[derive(Debug, Clone)]
pub struct Captured {
    pub authorization: Option<String>,
    pub body: Value,
}

/// Scriptable stand-in for `llama_cpp.server`.
#[derive(Debug, Clone)]
pub struct FakeLlamaServer {
    pub health_calls: Arc<AtomicUsize>,
    pub completion_calls: Arc<AtomicUsize>,
    pub health_auth: Arc<Mutex<Vec<Option<String>>>>,
    pub last_completion: Arc<Mutex<Option<Captured>>>,
    /// Number of non-200 health answers before the first 200. `None` never
    /// becomes healthy.
    ready_after: Option<usize>,
    completion_status: StatusCode,
    completion_body: String,
}

impl Default for FakeLlamaServer {
    fn default() -> Self {
        Self {
            health_calls: Arc::default(),
            completion_calls: Arc::default(),
            health_auth: Arc::default(),
            last_completion: Arc::default(),
            ready_after: Some(0),
            completion_status: StatusCode::OK,
            completion_body: r#"{"choices":[{"message":{"role":"assistant","content":"hello"}}]}"#
                .to_string(),
        }
    }
}

impl FakeLlamaServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ready_after(mut self, misses: usize) -> Self {
        self.ready_after = Some(misses);
        self
    }

    pub fn never_ready(mut self) -> Self {
        self.ready_after = None;
        self
    }

    pub fn completion(mut self, status: StatusCode, body: impl Into<String>) -> Self {
        self.completion_status = status;
        self.completion_body = body.into();
        self
    }

    pub fn health_count(&self) -> usize {
        self.health_calls.load(Ordering::SeqCst)
    }

    pub fn completion_count(&self) -> usize {
        self.completion_calls.load(Ordering::SeqCst)
    }

    pub fn last_completion(&self) -> Option<Captured> {
        self.last_completion.lock().unwrap().clone()
    }

    /// Serve on an ephemeral local port.
    pub async fn spawn(self) -> (Self, SocketAddr) {
        let app = Router::new()
            .route("/health", get(health))
            .route("/v1/chat/completions", post(completions))
            .with_state(self.clone());
        let addr = spawn_router(app).await;
        (self, addr)
    }
}

async fn health(State(server): State<FakeLlamaServer>, headers: HeaderMap) -> StatusCode {
    let seen = server.health_calls.fetch_add(1, Ordering::SeqCst);
    server.health_auth.lock().unwrap().push(authorization(&headers));
    match server.ready_after {
        Some(misses) if seen >= misses => StatusCode::OK,
        _ => StatusCode::SERVICE_UNAVAILABLE,
    }
}

async fn completions(
    State(server): State<FakeLlamaServer>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    server.completion_calls.fetch_add(1, Ordering::SeqCst);
    *server.last_completion.lock().unwrap() = Some(Captured {
        authorization: authorization(&headers),
        body: serde_json::from_slice(&body).unwrap_or(Value::Null),
    });
    (
        server.completion_status,
        [(header::CONTENT_TYPE, "application/json")],
        server.completion_body.clone(),
    )
}

fn authorization(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Serve `app` on `127.0.0.1:0` in the background.
pub async fn spawn_router(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Settings pointing at `port`, with scratch paths under `dir`.
pub fn test_settings(dir: &Path, port: u16) -> Settings {
    Settings {
        server_port: port,
        hugging_face_token: Some("hf_test_token".to_string()),
        hf_model_repo: Some("org/tiny-GGUF".to_string()),
        hf_model_file: Some("tiny.gguf".to_string()),
        server_config_file: dir.join("server_config.json").display().to_string(),
        models_dir: dir.join("models").display().to_string(),
        health_timeout_secs: 5,
        health_poll_interval_ms: 50,
        ..Settings::default()
    }
}

/// Records setup steps instead of running them.
#[derive(Debug, Default)]
pub struct FakeCommands {
    pub seen: Mutex<Vec<String>>,
    pub fail_on: Option<usize>,
}

impl FakeCommands {
    pub fn failing_on(step: usize) -> Self {
        Self {
            fail_on: Some(step),
            ..Self::default()
        }
    }

    pub fn count(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

#[async_trait]
impl CommandRunner for FakeCommands {
    async fn run(&self, step: &SetupStep) -> Result<(), SetupError> {
        let mut seen = self.seen.lock().unwrap();
        seen.push(step.display());
        if Some(seen.len()) == self.fail_on {
            return Err(SetupError::StepFailed {
                command: step.display(),
                status: "exit status: 1".to_string(),
                stderr: "network unreachable".to_string(),
            });
        }
        Ok(())
    }
}

/// Launches a stand-in process instead of `llama_cpp.server`.
#[derive(Debug)]
pub struct FakeLauncher {
    program: &'static str,
    args: Vec<&'static str>,
    pub launched: Mutex<Vec<u32>>,
}

impl FakeLauncher {
    /// A process that stays up until terminated.
    pub fn long_running() -> Self {
        Self {
            program: "sleep",
            args: vec!["30"],
            launched: Mutex::default(),
        }
    }

    /// A process that exits on its own right away.
    pub fn crashing() -> Self {
        Self {
            program: "sh",
            args: vec!["-c", "exit 3"],
            launched: Mutex::default(),
        }
    }

    pub fn pids(&self) -> Vec<u32> {
        self.launched.lock().unwrap().clone()
    }
}

#[async_trait]
impl ServerLauncher for FakeLauncher {
    async fn launch(&self, _config_path: &Path) -> Result<ServerProcess, ProcessError> {
        let mut cmd = Command::new(self.program);
        cmd.args(&self.args);
        let process = ServerProcess::spawn("fake-llama", cmd)?;
        self.launched.lock().unwrap().push(process.pid);
        Ok(process)
    }
}

/// True while a process with `pid` exists (including zombies).
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    // SAFETY: signal 0 only performs the existence/permission check.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

/// Wait up to two seconds for `pid` to stop running. Zombies count as
/// stopped since a killed orphan is reaped asynchronously.
#[cfg(target_os = "linux")]
pub async fn wait_gone(pid: u32) -> bool {
    for _ in 0..40 {
        let running = std::fs::read_to_string(format!("/proc/{pid}/stat"))
            .map(|stat| {
                stat.rsplit_once(") ")
                    .is_some_and(|(_, rest)| !rest.starts_with('Z'))
            })
            .unwrap_or(false);
        if !running {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    false
}
