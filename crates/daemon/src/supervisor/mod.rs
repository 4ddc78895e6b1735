//! Keeps the storage daemon running
//!
//! The daemon is started as a child process, restarted with a growing delay
//! whenever it exits, and killed when the node shuts down.

mod backoff;
mod repo;

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tokio::process::{Child, Command};
use tokio::sync::watch;

pub use backoff::Backoff;
pub use repo::{CasRepo, REPO_PATH_ENV};

use crate::state::CasConfig;

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("failed to start {0}: {1}")]
    Spawn(PathBuf, std::io::Error),
    #[error("storage repository init exited with {0}")]
    RepoInit(ExitStatus),
    #[error("invalid storage repository config: {0}")]
    RepoConfig(String),
    #[error("storage repository config is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// What is being run and how to restart it
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub binary: PathBuf,
    pub args: Vec<String>,
    /// Working directory, also exported as the repository path
    pub data_dir: PathBuf,
    /// `stdout.log` and `stderr.log` are appended here
    pub log_dir: PathBuf,
    pub restart_initial: Duration,
    pub restart_max: Duration,
    pub stable_after: Duration,
}

impl SupervisorConfig {
    /// Run `<binary> daemon` against a prepared repository
    pub fn for_repo(repo: &CasRepo, settings: &CasConfig, log_dir: PathBuf) -> Self {
        Self {
            binary: settings.binary.clone(),
            args: vec!["daemon".to_string()],
            data_dir: repo.data_dir().to_path_buf(),
            log_dir,
            restart_initial: Duration::from_secs(settings.restart_initial_secs),
            restart_max: Duration::from_secs(settings.restart_max_secs),
            stable_after: Duration::from_secs(settings.restart_stable_secs),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SupervisorStatus {
    /// Times the child has exited (or failed to start) and been restarted
    pub restarts: u32,
    pub pid: Option<u32>,
    pub running: bool,
}

#[derive(Debug)]
pub struct Supervisor {
    config: SupervisorConfig,
    status_tx: watch::Sender<SupervisorStatus>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        let (status_tx, _) = watch::channel(SupervisorStatus::default());
        Self { config, status_tx }
    }

    pub fn status(&self) -> watch::Receiver<SupervisorStatus> {
        self.status_tx.subscribe()
    }

    fn spawn_child(&self) -> Result<Child, SupervisorError> {
        std::fs::create_dir_all(&self.config.log_dir)?;
        let open_log = |name: &str| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.config.log_dir.join(name))
        };
        let stdout = open_log("stdout.log")?;
        let stderr = open_log("stderr.log")?;

        Command::new(&self.config.binary)
            .args(&self.config.args)
            .current_dir(&self.config.data_dir)
            .env(REPO_PATH_ENV, &self.config.data_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SupervisorError::Spawn(self.config.binary.clone(), e))
    }

    /// Run and restart the child until `shutdown_rx` fires
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<()>) {
        let mut backoff = Backoff::new(
            self.config.restart_initial,
            self.config.restart_max,
            self.config.stable_after,
        );

        loop {
            if shutdown_rx.has_changed().unwrap_or(true) {
                break;
            }

            let started = Instant::now();
            match self.spawn_child() {
                Ok(mut child) => {
                    let pid = child.id();
                    tracing::info!(binary = %self.config.binary.display(), ?pid, "storage daemon started");
                    self.status_tx.send_modify(|status| {
                        status.pid = pid;
                        status.running = true;
                    });

                    tokio::select! {
                        _ = shutdown_rx.changed() => {
                            tracing::info!(?pid, "stopping storage daemon");
                            if let Err(e) = child.kill().await {
                                tracing::warn!(error = %e, "failed to kill storage daemon");
                            }
                            self.status_tx.send_modify(|status| {
                                status.pid = None;
                                status.running = false;
                            });
                            break;
                        }
                        exit = child.wait() => match exit {
                            Ok(status) => tracing::warn!(%status, ran_for = ?started.elapsed(), "storage daemon exited"),
                            Err(e) => tracing::error!(error = %e, "failed to wait on storage daemon"),
                        }
                    }
                }
                Err(e) => tracing::error!(error = %e, "failed to start storage daemon"),
            }

            self.status_tx.send_modify(|status| {
                status.restarts += 1;
                status.pid = None;
                status.running = false;
            });

            let delay = backoff.next_delay(started.elapsed());
            tracing::info!(
                restarts = self.status_tx.borrow().restarts,
                delay = ?delay,
                "restarting storage daemon"
            );
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        tracing::info!("supervision ended");
    }
}
