//! Inference server subprocess.
//!
//! The server runs in its own process group so that termination reaches any
//! workers it forks. Only the runner owns the handle.

use std::io;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use thiserror::Error;
use tokio::process::{Child, Command};

/// How long `terminate` waits after SIGTERM before escalating to SIGKILL.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(10);

/// Errors raised while launching or stopping the server process.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to start {service}: {source}")]
    Spawn {
        service: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to get PID for {0}")]
    NoPid(String),

    #[error("failed to kill {service} (PID {pid}): {source}")]
    Kill {
        service: String,
        pid: u32,
        #[source]
        source: io::Error,
    },
}

/// Handle to the launched server.
#[derive(Debug)]
pub struct ServerProcess {
    /// Process ID (also the process group ID).
    pub pid: u32,
    /// Service name used in logs.
    pub service: String,
    child: Child,
    grace: Duration,
}

impl ServerProcess {
    /// Spawn `cmd` in a new process group.
    pub fn spawn(service: impl Into<String>, mut cmd: Command) -> Result<Self, ProcessError> {
        let service = service.into();
        cmd.stdin(Stdio::null()).kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            service: service.clone(),
            source,
        })?;
        let pid = child.id().ok_or_else(|| ProcessError::NoPid(service.clone()))?;

        Ok(Self {
            pid,
            service,
            child,
            grace: TERMINATE_GRACE,
        })
    }

    /// Override the SIGTERM grace period.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Check if the process is still running.
    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// How the process ended, or `None` while it is still running.
    pub fn exit_description(&mut self) -> Option<String> {
        match self.child.try_wait() {
            Ok(None) => None,
            Ok(Some(status)) => Some(describe_exit(status)),
            Err(e) => {
                warn!("Error checking process {} status: {:?}", self.pid, e);
                Some("exited (status unavailable)".to_string())
            }
        }
    }

    /// Stop the server: SIGTERM to the group, then SIGKILL after the grace
    /// period. Reaps the child so it does not linger as a zombie.
    pub async fn terminate(&mut self) -> Result<(), ProcessError> {
        if !self.is_running() {
            // The leader is gone; workers it forked may still hold the group.
            #[cfg(unix)]
            self.signal_group(libc::SIGKILL);
            debug!("{} (PID {}) already exited", self.service, self.pid);
            return Ok(());
        }

        info!("Terminating {} (PID {})", self.service, self.pid);
        #[cfg(unix)]
        self.signal_group(libc::SIGTERM);

        match tokio::time::timeout(self.grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!("{} (PID {}) exited: {}", self.service, self.pid, status);
                return Ok(());
            }
            Ok(Err(e)) => warn!("Error waiting for process {}: {:?}", self.pid, e),
            Err(_) => warn!(
                "{} (PID {}) ignored SIGTERM for {:?}, killing",
                self.service, self.pid, self.grace
            ),
        }

        #[cfg(unix)]
        self.signal_group(libc::SIGKILL);
        if let Err(source) = self.child.kill().await {
            if self.is_running() {
                return Err(ProcessError::Kill {
                    service: self.service.clone(),
                    pid: self.pid,
                    source,
                });
            }
        }
        Ok(())
    }

    #[cfg(unix)]
    fn signal_group(&self, signal: libc::c_int) {
        let Ok(pgid) = libc::pid_t::try_from(self.pid) else {
            return;
        };
        // SAFETY: killpg only sends a signal; the group was created at spawn.
        let rc = unsafe { libc::killpg(pgid, signal) };
        if rc != 0 {
            debug!(
                "killpg({}, {}) failed: {}",
                pgid,
                signal,
                io::Error::last_os_error()
            );
        }
    }
}

impl Drop for ServerProcess {
    /// `kill_on_drop` only reaches the leader, so kill the whole group when
    /// the handle is dropped without `terminate` (e.g. cancelled bring-up).
    fn drop(&mut self) {
        if self.is_running() {
            warn!(
                "{} (PID {}) dropped while running, killing its process group",
                self.service, self.pid
            );
            #[cfg(unix)]
            self.signal_group(libc::SIGKILL);
        }
    }
}

/// Describe how a process ended, naming the signal when one killed it.
pub fn describe_exit(status: ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("exited with code {code}");
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return match signal_name(signal) {
                Some(name) => format!("killed by {name} (signal {signal})"),
                None => format!("killed by signal {signal}"),
            };
        }
    }
    "exited (unknown status)".to_string()
}

#[cfg(unix)]
fn signal_name(signal: libc::c_int) -> Option<&'static str> {
    const NAMES: [(libc::c_int, &str); 7] = [
        (libc::SIGTERM, "SIGTERM"),
        (libc::SIGKILL, "SIGKILL"),
        (libc::SIGINT, "SIGINT"),
        (libc::SIGHUP, "SIGHUP"),
        (libc::SIGSEGV, "SIGSEGV"),
        (libc::SIGABRT, "SIGABRT"),
        (libc::SIGBUS, "SIGBUS"),
    ];
    NAMES
        .iter()
        .find(|(number, _)| *number == signal)
        .map(|(_, name)| *name)
}

/// Starts the inference server from a config document.
#[async_trait]
pub trait ServerLauncher: Send + Sync {
    async fn launch(&self, config_path: &Path) -> Result<ServerProcess, ProcessError>;
}

/// Launches `python3 -m llama_cpp.server --config_file <path>`.
#[derive(Debug, Clone)]
pub struct LlamaCppLauncher {
    python: String,
}

impl LlamaCppLauncher {
    pub fn new(python: impl Into<String>) -> Self {
        Self {
            python: python.into(),
        }
    }
}

impl Default for LlamaCppLauncher {
    fn default() -> Self {
        Self::new("python3")
    }
}

#[async_trait]
impl ServerLauncher for LlamaCppLauncher {
    async fn launch(&self, config_path: &Path) -> Result<ServerProcess, ProcessError> {
        let mut cmd = Command::new(&self.python);
        cmd.args(["-m", "llama_cpp.server", "--config_file"])
            .arg(config_path)
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        info!(
            "Starting llama_cpp.server in background: {} -m llama_cpp.server --config_file {}",
            self.python,
            config_path.display()
        );
        let process = ServerProcess::spawn("llama_cpp.server", cmd)?;
        info!("llama_cpp.server process started with PID: {}", process.pid);
        Ok(process)
    }
}
