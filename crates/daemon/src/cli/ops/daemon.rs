use clap::Args;

use vouch_daemon::state::AppState;
use vouch_daemon::{spawn_service, ServiceConfig};

#[derive(Args, Debug, Clone)]
pub struct Daemon {
    /// Directory for log files (logs to stdout only if not set)
    #[arg(long)]
    pub log_dir: Option<std::path::PathBuf>,

    /// Do not start the storage daemon; use one already listening on the API port
    #[arg(long)]
    pub no_supervise: bool,

    /// Override the gossip listen port (default from config)
    #[arg(long)]
    pub gossip_port: Option<u16>,
}

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("state error: {0}")]
    StateError(#[from] vouch_daemon::state::StateError),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Daemon {
    type Error = DaemonError;
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        // Load state from config path (or default ~/.vouch)
        let state = AppState::load(ctx.config_path.clone())?;

        // Load the secret key
        let secret_key = state.load_key()?;

        let gossip_port = self.gossip_port.unwrap_or(state.config.gossip.port);

        let config = ServiceConfig {
            node_secret: secret_key,
            cas: state.config.cas.clone(),
            cas_dir: state.cas_path.clone(),
            cas_log_dir: state.logs_path.clone(),
            supervise: !self.no_supervise,
            gossip_listen_addr: ([0, 0, 0, 0], gossip_port).into(),
            gossip_peers: state.config.gossip.peers.clone(),
            watch_dir: state.config.watch_dir.clone(),
            staging_dir: state.staging_path.clone(),
            pipeline: state.config.pipeline.clone(),
            ledger_path: Some(state.ledger_path.clone()),
            log_level: tracing::Level::INFO,
            log_dir: self.log_dir.clone(),
        };

        spawn_service(&config).await;
        Ok("daemon ended".to_string())
    }
}
