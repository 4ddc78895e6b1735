use std::net::SocketAddr;
use std::{fs, path::PathBuf};

use common::prelude::SecretKey;
use serde::{Deserialize, Serialize};

pub const APP_NAME: &str = "vouch";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const KEY_FILE_NAME: &str = "key.pem";
pub const LEDGER_FILE_NAME: &str = "ledger.json";
pub const STAGING_DIR_NAME: &str = "staging";
pub const CAS_DIR_NAME: &str = "cas";
pub const LOGS_DIR_NAME: &str = "logs";
pub const INBOX_DIR_NAME: &str = "inbox";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Directory scanned for new files to vouch for
    pub watch_dir: PathBuf,
    #[serde(default)]
    pub cas: CasConfig,
    #[serde(default)]
    pub gossip: GossipConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

/// The storage daemon we supervise and talk to
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CasConfig {
    /// Kubo-compatible binary, looked up on PATH if not absolute
    pub binary: PathBuf,
    pub api_port: u16,
    pub gateway_port: u16,
    pub swarm_port: u16,
    pub conn_mgr_low_water: u32,
    pub conn_mgr_high_water: u32,
    pub enable_relay_hop: bool,
    /// First restart delay after a crash
    pub restart_initial_secs: u64,
    /// Ceiling for the doubling restart delay
    pub restart_max_secs: u64,
    /// A run at least this long resets the restart delay
    pub restart_stable_secs: u64,
}

impl Default for CasConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("ipfs"),
            api_port: 5001,
            gateway_port: 8080,
            swarm_port: 4001,
            conn_mgr_low_water: 100,
            conn_mgr_high_water: 400,
            enable_relay_hop: false,
            restart_initial_secs: 1,
            restart_max_secs: 60,
            restart_stable_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GossipConfig {
    pub port: u16,
    /// Every other node we exchange ledger messages with
    pub peers: Vec<SocketAddr>,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            port: 7420,
            peers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub poll_interval_secs: u64,
    pub probe_timeout_secs: u64,
    pub pin_timeout_secs: u64,
    pub cache_capacity: u64,
    pub cache_ttl_secs: u64,
    /// How often expired ledger entries are dropped and the ledger saved
    pub ledger_flush_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 300,
            probe_timeout_secs: 60,
            pin_timeout_secs: 15 * 60,
            cache_capacity: 100_000,
            cache_ttl_secs: 7 * 24 * 60 * 60,
            ledger_flush_secs: 60,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppState {
    /// Path to the vouch directory (~/.vouch)
    pub vouch_dir: PathBuf,
    /// Path to the node key PEM file
    pub key_path: PathBuf,
    /// Path to the persisted ledger snapshot
    pub ledger_path: PathBuf,
    /// Scratch space the watcher stages imports in
    pub staging_path: PathBuf,
    /// Data directory of the supervised storage daemon
    pub cas_path: PathBuf,
    /// Storage daemon stdout/stderr logs
    pub logs_path: PathBuf,
    /// Path to the config file
    pub config_path: PathBuf,
    /// Loaded configuration
    pub config: AppConfig,
}

impl AppState {
    /// Get the vouch directory path (custom or default ~/.vouch)
    pub fn vouch_dir(custom_path: Option<PathBuf>) -> Result<PathBuf, StateError> {
        if let Some(path) = custom_path {
            return Ok(path);
        }

        let home = dirs::home_dir().ok_or(StateError::NoHomeDirectory)?;
        Ok(home.join(format!(".{}", APP_NAME)))
    }

    fn paths(vouch_dir: PathBuf, config: AppConfig) -> Self {
        Self {
            key_path: vouch_dir.join(KEY_FILE_NAME),
            ledger_path: vouch_dir.join(LEDGER_FILE_NAME),
            staging_path: vouch_dir.join(STAGING_DIR_NAME),
            cas_path: vouch_dir.join(CAS_DIR_NAME),
            logs_path: vouch_dir.join(LOGS_DIR_NAME),
            config_path: vouch_dir.join(CONFIG_FILE_NAME),
            vouch_dir,
            config,
        }
    }

    /// Initialize a new vouch state directory
    ///
    /// Without a config, the watch directory defaults to `inbox/` inside
    /// the state directory.
    pub fn init(
        custom_path: Option<PathBuf>,
        config: Option<AppConfig>,
    ) -> Result<Self, StateError> {
        let vouch_dir = Self::vouch_dir(custom_path)?;

        if vouch_dir.exists() {
            return Err(StateError::AlreadyInitialized);
        }
        fs::create_dir_all(&vouch_dir)?;

        let config = config.unwrap_or_else(|| AppConfig {
            watch_dir: vouch_dir.join(INBOX_DIR_NAME),
            cas: CasConfig::default(),
            gossip: GossipConfig::default(),
            pipeline: PipelineConfig::default(),
        });
        let state = Self::paths(vouch_dir, config);

        fs::create_dir_all(&state.staging_path)?;
        fs::create_dir_all(&state.cas_path)?;
        fs::create_dir_all(&state.logs_path)?;
        fs::create_dir_all(&state.config.watch_dir)?;

        let key = SecretKey::generate();
        fs::write(&state.key_path, key.to_pem())?;

        let config_toml = toml::to_string_pretty(&state.config)?;
        fs::write(&state.config_path, config_toml)?;

        Ok(state)
    }

    /// Load existing state from the vouch directory
    pub fn load(custom_path: Option<PathBuf>) -> Result<Self, StateError> {
        let vouch_dir = Self::vouch_dir(custom_path)?;

        if !vouch_dir.exists() {
            return Err(StateError::NotInitialized);
        }

        let config_path = vouch_dir.join(CONFIG_FILE_NAME);
        if !config_path.exists() {
            return Err(StateError::MissingFile(CONFIG_FILE_NAME.to_string()));
        }
        let config_toml = fs::read_to_string(&config_path)?;
        let config: AppConfig = toml::from_str(&config_toml)?;

        let state = Self::paths(vouch_dir, config);
        if !state.key_path.exists() {
            return Err(StateError::MissingFile(KEY_FILE_NAME.to_string()));
        }
        // scratch directories are recreated rather than treated as corruption
        fs::create_dir_all(&state.staging_path)?;
        fs::create_dir_all(&state.cas_path)?;
        fs::create_dir_all(&state.logs_path)?;

        Ok(state)
    }

    /// Load the secret key from the key file
    pub fn load_key(&self) -> Result<SecretKey, StateError> {
        let pem = fs::read_to_string(&self.key_path)?;
        let key = SecretKey::from_pem(&pem).map_err(|e| StateError::InvalidKey(e.to_string()))?;
        Ok(key)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("vouch directory not initialized. Run 'vouch init' first")]
    NotInitialized,

    #[error("vouch directory already initialized")]
    AlreadyInitialized,

    #[error("no home directory found")]
    NoHomeDirectory,

    #[error("missing required file: {0}")]
    MissingFile(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("TOML deserialization error: {0}")]
    TomlDe(#[from] toml::de::Error),
}
