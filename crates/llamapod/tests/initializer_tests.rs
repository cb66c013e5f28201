//! Runner bring-up against fake setup commands, a stand-in process and a
//! fake health endpoint.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use llamapod::server_config::ServerConfig;
use llamapod::{InitError, Initializer, Settings, SettingsError};

mod common;
use common::{FakeCommands, FakeLauncher, FakeLlamaServer, pid_alive, test_settings};

struct Harness {
    commands: Arc<FakeCommands>,
    launcher: Arc<FakeLauncher>,
}

impl Harness {
    fn new(commands: FakeCommands, launcher: FakeLauncher) -> Self {
        Self {
            commands: Arc::new(commands),
            launcher: Arc::new(launcher),
        }
    }

    fn initializer<'a>(&self, settings: &'a Settings) -> Initializer<'a> {
        Initializer::new(settings)
            .with_command_runner(self.commands.clone())
            .with_launcher(self.launcher.clone())
    }
}

#[tokio::test]
async fn test_missing_keys_fail_before_side_effects() {
    let dir = TempDir::new().unwrap();
    let cases: [(&str, fn(&mut Settings)); 3] = [
        ("HUGGING_FACE_TOKEN", |s| s.hugging_face_token = None),
        ("HF_MODEL_REPO", |s| s.hf_model_repo = None),
        ("HF_MODEL_FILE", |s| s.hf_model_file = Some("  ".to_string())),
    ];

    for (key, clear) in cases {
        let mut settings = test_settings(dir.path(), 1);
        clear(&mut settings);
        let harness = Harness::new(FakeCommands::default(), FakeLauncher::long_running());

        let err = harness.initializer(&settings).initialize().await.unwrap_err();

        assert!(err.to_string().contains(key), "{err}");
        match err {
            InitError::Config(SettingsError::Missing(name)) => assert_eq!(name, key),
            other => panic!("expected missing {key}, got {other:?}"),
        }
        assert_eq!(harness.commands.count(), 0, "{key}: setup ran");
        assert!(harness.launcher.pids().is_empty(), "{key}: server launched");
        assert!(!dir.path().join("server_config.json").exists());
    }
}

#[tokio::test]
async fn test_setup_failure_aborts_before_launch() {
    let dir = TempDir::new().unwrap();
    let (_server, addr) = FakeLlamaServer::new().spawn().await;
    let settings = test_settings(dir.path(), addr.port());
    let harness = Harness::new(FakeCommands::failing_on(2), FakeLauncher::long_running());

    let err = harness.initializer(&settings).initialize().await.unwrap_err();

    assert!(matches!(err, InitError::Setup(_)), "got {err:?}");
    assert_eq!(harness.commands.count(), 2);
    assert!(harness.launcher.pids().is_empty());
}

#[tokio::test]
async fn test_ready_after_misses_stops_polling() {
    let dir = TempDir::new().unwrap();
    let (server, addr) = FakeLlamaServer::new().ready_after(3).spawn().await;
    let settings = test_settings(dir.path(), addr.port());
    let harness = Harness::new(FakeCommands::default(), FakeLauncher::long_running());

    let runner = harness.initializer(&settings).initialize().await.unwrap();

    let state = runner.state();
    assert!(state.is_ready());
    assert_eq!(state.base_url(), format!("http://localhost:{}", addr.port()));
    assert_eq!(state.model_identifier(), Some("tiny.gguf"));
    assert_eq!(server.health_count(), 4);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server.health_count(), 4, "polling continued after ready");

    // pip, pip, hf auth login, hf download
    assert_eq!(harness.commands.count(), 4);
    assert_eq!(harness.launcher.pids(), vec![runner.pid()]);

    runner.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_present_model_skips_download() {
    let dir = TempDir::new().unwrap();
    let (_server, addr) = FakeLlamaServer::new().spawn().await;
    let settings = test_settings(dir.path(), addr.port());
    std::fs::create_dir_all(settings.models_dir()).unwrap();
    std::fs::write(settings.models_dir().join("tiny.gguf"), b"gguf").unwrap();
    let harness = Harness::new(FakeCommands::default(), FakeLauncher::long_running());

    let runner = harness.initializer(&settings).initialize().await.unwrap();

    let seen = harness.commands.seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 3);
    assert!(seen.iter().all(|step| !step.contains("download")));
    runner.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_skip_setup_runs_nothing_but_download() {
    let dir = TempDir::new().unwrap();
    let (_server, addr) = FakeLlamaServer::new().spawn().await;
    let mut settings = test_settings(dir.path(), addr.port());
    settings.skip_setup = true;
    let harness = Harness::new(FakeCommands::default(), FakeLauncher::long_running());

    let runner = harness.initializer(&settings).initialize().await.unwrap();

    let seen = harness.commands.seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 1);
    assert!(seen[0].starts_with("hf download org/tiny-GGUF tiny.gguf"));
    assert!(!seen[0].contains("hf_test_token"));
    runner.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_timeout_terminates_server() {
    let dir = TempDir::new().unwrap();
    let (server, addr) = FakeLlamaServer::new().never_ready().spawn().await;
    let mut settings = test_settings(dir.path(), addr.port());
    settings.health_timeout_secs = 1;
    settings.health_poll_interval_ms = 100;
    let harness = Harness::new(FakeCommands::default(), FakeLauncher::long_running());

    let err = harness.initializer(&settings).initialize().await.unwrap_err();

    match err {
        InitError::StartupTimeout { attempts, .. } => assert!(attempts >= 2),
        other => panic!("expected startup timeout, got {other:?}"),
    }
    assert!(server.health_count() >= 2);

    let pids = harness.launcher.pids();
    assert_eq!(pids.len(), 1);
    assert!(!pid_alive(pids[0]), "server still running after timeout");
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_cancelled_bring_up_kills_server() {
    let dir = TempDir::new().unwrap();
    let (server, addr) = FakeLlamaServer::new().never_ready().spawn().await;
    let settings = test_settings(dir.path(), addr.port());
    let harness = Harness::new(FakeCommands::default(), FakeLauncher::long_running());

    let cancelled = tokio::time::timeout(
        Duration::from_millis(300),
        harness.initializer(&settings).initialize(),
    )
    .await;

    assert!(cancelled.is_err(), "bring-up finished before cancellation");
    assert!(server.health_count() >= 1);
    let pids = harness.launcher.pids();
    assert_eq!(pids.len(), 1);
    assert!(
        common::wait_gone(pids[0]).await,
        "server survived cancelled bring-up"
    );
}

#[tokio::test]
async fn test_early_exit_fails_fast() {
    let dir = TempDir::new().unwrap();
    let (_server, addr) = FakeLlamaServer::new().never_ready().spawn().await;
    let settings = test_settings(dir.path(), addr.port());
    let harness = Harness::new(FakeCommands::default(), FakeLauncher::crashing());

    let started = std::time::Instant::now();
    let err = harness.initializer(&settings).initialize().await.unwrap_err();

    match err {
        InitError::ProcessExited { status } => assert!(status.contains('3'), "{status}"),
        other => panic!("expected process exit, got {other:?}"),
    }
    assert!(started.elapsed() < Duration::from_secs(settings.health_timeout_secs));
}

#[tokio::test]
async fn test_api_token_used_for_health_and_config() {
    let dir = TempDir::new().unwrap();
    let (server, addr) = FakeLlamaServer::new().ready_after(1).spawn().await;
    let mut settings = test_settings(dir.path(), addr.port());
    settings.api_token = Some("tok".to_string());
    let harness = Harness::new(FakeCommands::default(), FakeLauncher::long_running());

    let runner = harness.initializer(&settings).initialize().await.unwrap();

    let auth = server.health_auth.lock().unwrap().clone();
    assert!(!auth.is_empty());
    assert!(auth.iter().all(|a| a.as_deref() == Some("Bearer tok")));
    assert_eq!(runner.state().auth_token(), Some("tok"));

    let written = ServerConfig::read_from(&settings.config_path()).await.unwrap();
    assert_eq!(written.api_key.as_deref(), Some("tok"));
    runner.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_server_config_written() {
    let dir = TempDir::new().unwrap();
    let (_server, addr) = FakeLlamaServer::new().spawn().await;
    let settings = test_settings(dir.path(), addr.port());
    let harness = Harness::new(FakeCommands::default(), FakeLauncher::long_running());

    let runner = harness.initializer(&settings).initialize().await.unwrap();

    let written = ServerConfig::read_from(&settings.config_path()).await.unwrap();
    assert_eq!(written, ServerConfig::from_settings(&settings, "tiny.gguf"));
    assert_eq!(written.host, "0.0.0.0");
    assert_eq!(written.port, addr.port());
    assert_eq!(written.models.len(), 1);
    assert!(written.models[0].model.ends_with("models/tiny.gguf"));
    assert!(written.api_key.is_none());
    runner.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_kills_server() {
    let dir = TempDir::new().unwrap();
    let (_server, addr) = FakeLlamaServer::new().spawn().await;
    let settings = test_settings(dir.path(), addr.port());
    let harness = Harness::new(FakeCommands::default(), FakeLauncher::long_running());

    let runner = harness.initializer(&settings).initialize().await.unwrap();
    let pid = runner.pid();
    assert!(pid_alive(pid));

    runner.shutdown().await.unwrap();
    assert!(!pid_alive(pid));
}
