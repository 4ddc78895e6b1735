pub mod utils;

use std::time::Duration;

use futures::future::join_all;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

const FINAL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

use crate::pipeline::{Pipeline, PipelineConfig};
use crate::service_state::StateSetupError;
use crate::supervisor::{CasRepo, Supervisor, SupervisorConfig, SupervisorError};
use crate::{ServiceConfig, ServiceState};

/// Handle for gracefully shutting down the node.
pub struct ShutdownHandle {
    graceful_waiter: tokio::task::JoinHandle<()>,
    handles: Vec<tokio::task::JoinHandle<()>>,
    shutdown_tx: watch::Sender<()>,
}

impl ShutdownHandle {
    /// Block until the node shuts down (via signal or explicit shutdown).
    pub async fn wait(self) {
        shutdown_and_join(self.graceful_waiter, self.handles).await;
    }

    /// Trigger shutdown programmatically.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// Initialize logging, panic handler, and build info reporting.
/// Returns guards that must be kept alive for the duration of the program.
fn init_logging(
    service_config: &ServiceConfig,
) -> Vec<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::fmt::format::FmtSpan;

    let mut guards = Vec::new();

    // Stdout layer
    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());
    guards.push(stdout_guard);

    let stdout_env_filter = EnvFilter::builder()
        .with_default_directive(service_config.log_level.into())
        .from_env_lossy();

    let stdout_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(stdout_writer)
        .with_filter(stdout_env_filter);

    // File layer (if log_dir is set)
    if let Some(log_dir) = &service_config.log_dir {
        if let Err(e) = std::fs::create_dir_all(log_dir) {
            eprintln!(
                "Warning: Failed to create log directory {:?}: {}",
                log_dir, e
            );
        }

        let file_appender = tracing_appender::rolling::daily(log_dir, "vouch.log");
        let (file_writer, file_guard) = tracing_appender::non_blocking(file_appender);
        guards.push(file_guard);

        let file_env_filter = EnvFilter::builder()
            .with_default_directive(service_config.log_level.into())
            .from_env_lossy();

        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(file_writer)
            .with_ansi(false)
            .with_span_events(FmtSpan::CLOSE)
            .with_filter(file_env_filter);

        tracing_subscriber::registry()
            .with(stdout_layer)
            .with(file_layer)
            .init();
    } else {
        tracing_subscriber::registry().with(stdout_layer).init();
    }

    utils::register_panic_logger();
    utils::report_build_info();

    guards
}

/// Wait for shutdown and join all handles with timeout.
async fn shutdown_and_join(
    graceful_waiter: tokio::task::JoinHandle<()>,
    handles: Vec<tokio::task::JoinHandle<()>>,
) {
    let _ = graceful_waiter.await;

    if timeout(FINAL_SHUTDOWN_TIMEOUT, join_all(handles))
        .await
        .is_err()
    {
        tracing::error!(
            "Failed to shut down within {} seconds",
            FINAL_SHUTDOWN_TIMEOUT.as_secs()
        );
        std::process::exit(4);
    }
}

/// Why the node could not start
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("failed to install signal handlers: {0}")]
    Signals(std::io::Error),
    #[error("failed to prepare storage repository: {0}")]
    Repo(#[from] SupervisorError),
    #[error("error creating service state: {0}")]
    State(#[from] StateSetupError),
}

impl StartError {
    /// Process exit code reported for this failure
    pub fn exit_code(&self) -> i32 {
        match self {
            StartError::Signals(_) => 1,
            StartError::Repo(_) => 2,
            StartError::State(_) => 3,
        }
    }
}

/// Prepare the storage repository and start its supervisor, if this node runs its own
async fn spawn_supervisor(
    service_config: &ServiceConfig,
    shutdown_rx: watch::Receiver<()>,
) -> Result<Option<tokio::task::JoinHandle<()>>, SupervisorError> {
    if !service_config.supervise {
        tracing::info!(
            api = %service_config.cas_api_url(),
            "not supervising storage daemon, expecting one to be running"
        );
        return Ok(None);
    }

    let repo = CasRepo::new(&service_config.cas_dir, service_config.cas.clone());
    repo.prepare().await?;

    let supervisor = Supervisor::new(SupervisorConfig::for_repo(
        &repo,
        &service_config.cas,
        service_config.cas_log_dir.clone(),
    ));
    Ok(Some(tokio::spawn(async move {
        supervisor.run(shutdown_rx).await
    })))
}

/// Create state and spawn every background task, returning the state handle.
///
/// State is built before the storage daemon is spawned, so a failed start
/// never leaves a child running. The returned `ShutdownHandle` must be kept
/// alive; dropping it does not stop the node.
pub async fn try_start_service(
    service_config: &ServiceConfig,
) -> Result<(ServiceState, ShutdownHandle), StartError> {
    let (graceful_waiter, shutdown_tx, shutdown_rx) =
        utils::graceful_shutdown_blocker().map_err(StartError::Signals)?;

    let mut handles = Vec::new();

    let state = match ServiceState::from_config(service_config, shutdown_rx.clone()).await {
        Ok(state) => state,
        Err(e) => {
            let _ = shutdown_tx.send(());
            return Err(e.into());
        }
    };

    match spawn_supervisor(service_config, shutdown_rx.clone()).await {
        Ok(Some(handle)) => handles.push(handle),
        Ok(None) => {}
        Err(e) => {
            // stops the gossip transport bound above
            let _ = shutdown_tx.send(());
            return Err(e.into());
        }
    }

    // Consumers must subscribe before the bus starts receiving
    let pipeline = Pipeline::new(
        state.bus().clone(),
        state.cas().clone(),
        PipelineConfig {
            watch_dir: service_config.watch_dir.clone(),
            staging_dir: service_config.staging_dir.clone(),
            poll_interval: service_config.poll_interval(),
            probe_timeout: service_config.probe_timeout(),
            pin_timeout: service_config.pin_timeout(),
            cache_capacity: service_config.pipeline.cache_capacity,
            cache_ttl: service_config.cache_ttl(),
        },
    );
    handles.extend(pipeline.spawn(shutdown_rx.clone()));

    let bus = state.bus().clone();
    let bus_rx = shutdown_rx.clone();
    handles.push(tokio::spawn(async move {
        if let Err(e) = bus.run(bus_rx).await {
            tracing::error!("message bus error: {}", e);
        }
    }));

    if let Some(store) = state.ledger_store().cloned() {
        let ledger = state.bus().ledger().clone();
        let interval = service_config.ledger_flush_interval();
        let store_rx = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            store.maintain(ledger, interval, store_rx).await
        }));
    }

    tracing::info!(
        node = %state.bus().node(),
        gossip = %state.gossip_addr(),
        watch_dir = %service_config.watch_dir.display(),
        "running: watcher + verifier + pinner"
    );

    let handle = ShutdownHandle {
        graceful_waiter,
        handles,
        shutdown_tx,
    };

    Ok((state, handle))
}

/// Like [`try_start_service`], exiting the process on failure
pub async fn start_service(service_config: &ServiceConfig) -> (ServiceState, ShutdownHandle) {
    match try_start_service(service_config).await {
        Ok(started) => started,
        Err(e) => {
            tracing::error!("{}", e);
            std::process::exit(e.exit_code());
        }
    }
}

/// Runs the node until a shutdown signal is received. Use for CLI binary usage.
pub async fn spawn_service(service_config: &ServiceConfig) {
    let _guards = init_logging(service_config);
    let (_, handle) = start_service(service_config).await;
    handle.wait().await;
}
