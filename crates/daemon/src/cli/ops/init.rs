use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Args;

use vouch_daemon::state::{
    AppConfig, AppState, CasConfig, GossipConfig, PipelineConfig, StateError, INBOX_DIR_NAME,
};

#[derive(Args, Debug, Clone)]
pub struct Init {
    /// Directory to watch for new files (default: <state dir>/inbox)
    #[arg(long)]
    pub watch_dir: Option<PathBuf>,

    /// Port the gossip mesh listens on
    #[arg(long, default_value_t = 7420)]
    pub gossip_port: u16,

    /// Gossip address of another node; repeat for every peer
    #[arg(long = "peer")]
    pub peers: Vec<SocketAddr>,

    /// Storage daemon HTTP API port
    #[arg(long, default_value_t = 5001)]
    pub cas_api_port: u16,

    /// Storage daemon binary (default: ipfs on PATH)
    #[arg(long)]
    pub cas_binary: Option<PathBuf>,
}

#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("init failed: {0}")]
    StateFailed(#[from] StateError),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Init {
    type Error = InitError;
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let vouch_dir = AppState::vouch_dir(ctx.config_path.clone())?;
        let watch_dir = self
            .watch_dir
            .clone()
            .unwrap_or_else(|| vouch_dir.join(INBOX_DIR_NAME));

        let mut cas = CasConfig {
            api_port: self.cas_api_port,
            ..CasConfig::default()
        };
        if let Some(binary) = &self.cas_binary {
            cas.binary = binary.clone();
        }

        let config = AppConfig {
            watch_dir,
            cas,
            gossip: GossipConfig {
                port: self.gossip_port,
                peers: self.peers.clone(),
            },
            pipeline: PipelineConfig::default(),
        };

        let state = AppState::init(Some(vouch_dir), Some(config))?;
        let public = state.load_key()?.public();

        let output = format!(
            "Initialized vouch directory at: {}\n\
             - Node key: {} ({})\n\
             - Config: {}\n\
             - Ledger: {}\n\
             - Watching: {}\n\
             - Gossip port: {}\n\
             - Peers: {}",
            state.vouch_dir.display(),
            state.key_path.display(),
            public,
            state.config_path.display(),
            state.ledger_path.display(),
            state.config.watch_dir.display(),
            state.config.gossip.port,
            state.config.gossip.peers.len(),
        );

        Ok(output)
    }
}
