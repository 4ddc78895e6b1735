use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use common::prelude::SecretKey;

use crate::state::{CasConfig, PipelineConfig};

#[derive(Debug)]
pub struct Config {
    // identity
    /// key used to sign everything this node says on the mesh
    pub node_secret: SecretKey,

    // storage daemon
    pub cas: CasConfig,
    /// data directory handed to the storage daemon
    pub cas_dir: PathBuf,
    /// where the storage daemon's stdout/stderr are appended
    pub cas_log_dir: PathBuf,
    /// run the storage daemon as a supervised child,
    ///  otherwise assume one is already listening on `cas.api_port`
    pub supervise: bool,

    // gossip
    pub gossip_listen_addr: SocketAddr,
    pub gossip_peers: Vec<SocketAddr>,

    // pipeline
    pub watch_dir: PathBuf,
    pub staging_dir: PathBuf,
    pub pipeline: PipelineConfig,
    /// ledger snapshot location, if not set the ledger
    ///  lives in memory only
    pub ledger_path: Option<PathBuf>,

    // logging
    pub log_level: tracing::Level,
    /// Directory for log files (optional, logs to stdout only if not set)
    pub log_dir: Option<PathBuf>,
}

impl Config {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.pipeline.poll_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.pipeline.probe_timeout_secs)
    }

    pub fn pin_timeout(&self) -> Duration {
        Duration::from_secs(self.pipeline.pin_timeout_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.pipeline.cache_ttl_secs)
    }

    pub fn ledger_flush_interval(&self) -> Duration {
        Duration::from_secs(self.pipeline.ledger_flush_secs)
    }

    pub fn cas_api_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.cas.api_port)
    }
}
