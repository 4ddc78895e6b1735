use std::path::{Path, PathBuf};

use serde_json::{json, Map, Value};
use tokio::process::Command;

use super::SupervisorError;
use crate::state::CasConfig;

/// Environment variable the storage daemon reads its data directory from
pub const REPO_PATH_ENV: &str = "IPFS_PATH";
const CONFIG_FILE: &str = "config";

/// The storage daemon's on-disk repository
///
/// Owned by the supervisor: it is initialized and configured here before
/// the first start, and never touched by anything else.
#[derive(Debug, Clone)]
pub struct CasRepo {
    binary: PathBuf,
    data_dir: PathBuf,
    settings: CasConfig,
}

impl CasRepo {
    pub fn new(data_dir: impl Into<PathBuf>, settings: CasConfig) -> Self {
        Self {
            binary: settings.binary.clone(),
            data_dir: data_dir.into(),
            settings,
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn config_path(&self) -> PathBuf {
        self.data_dir.join(CONFIG_FILE)
    }

    /// Initialize the repository if needed, then write our settings into it
    pub async fn prepare(&self) -> Result<(), SupervisorError> {
        tokio::fs::create_dir_all(&self.data_dir).await?;

        if !self.config_path().exists() {
            tracing::info!(data_dir = %self.data_dir.display(), "initializing storage repository");
            let status = Command::new(&self.binary)
                .arg("init")
                .current_dir(&self.data_dir)
                .env(REPO_PATH_ENV, &self.data_dir)
                .status()
                .await
                .map_err(|e| SupervisorError::Spawn(self.binary.clone(), e))?;
            if !status.success() {
                return Err(SupervisorError::RepoInit(status));
            }
        }

        let raw = tokio::fs::read(self.config_path()).await?;
        let mut config: Value = serde_json::from_slice(&raw)?;
        self.apply(&mut config)?;
        tokio::fs::write(self.config_path(), serde_json::to_vec_pretty(&config)?).await?;

        tracing::info!(
            api_port = self.settings.api_port,
            gateway_port = self.settings.gateway_port,
            swarm_port = self.settings.swarm_port,
            "storage repository configured"
        );
        Ok(())
    }

    /// Overwrite the listen addresses and connection settings in a repo config
    pub fn apply(&self, config: &mut Value) -> Result<(), SupervisorError> {
        let s = &self.settings;
        set(
            config,
            &["Addresses", "API"],
            json!(format!("/ip4/127.0.0.1/tcp/{}", s.api_port)),
        )?;
        set(
            config,
            &["Addresses", "Gateway"],
            json!(format!("/ip4/127.0.0.1/tcp/{}", s.gateway_port)),
        )?;
        set(
            config,
            &["Addresses", "Swarm"],
            json!([
                format!("/ip4/0.0.0.0/tcp/{}", s.swarm_port),
                format!("/ip6/::/tcp/{}", s.swarm_port),
                format!("/ip4/0.0.0.0/udp/{}/quic-v1", s.swarm_port),
                format!("/ip6/::/udp/{}/quic-v1", s.swarm_port),
            ]),
        )?;
        set(config, &["Swarm", "ConnMgr", "Type"], json!("basic"))?;
        set(
            config,
            &["Swarm", "ConnMgr", "LowWater"],
            json!(s.conn_mgr_low_water),
        )?;
        set(
            config,
            &["Swarm", "ConnMgr", "HighWater"],
            json!(s.conn_mgr_high_water),
        )?;
        set(
            config,
            &["Swarm", "EnableRelayHop"],
            json!(s.enable_relay_hop),
        )?;
        Ok(())
    }
}

/// Set a nested key, creating intermediate objects as needed
fn set(config: &mut Value, path: &[&str], value: Value) -> Result<(), SupervisorError> {
    let Some((last, parents)) = path.split_last() else {
        return Ok(());
    };
    let mut node = config;
    for key in parents {
        let object = node
            .as_object_mut()
            .ok_or_else(|| SupervisorError::RepoConfig(format!("{} is not an object", key)))?;
        node = object
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    node.as_object_mut()
        .ok_or_else(|| SupervisorError::RepoConfig(format!("parent of {} is not an object", last)))?
        .insert(last.to_string(), value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> CasRepo {
        CasRepo::new("/tmp/unused", CasConfig::default())
    }

    #[test]
    fn test_apply_rewrites_addresses_and_conn_mgr() {
        let mut config = json!({
            "Addresses": { "API": "/ip4/0.0.0.0/tcp/1", "Announce": [] },
            "Swarm": { "ConnMgr": { "GracePeriod": "20s" } },
            "Identity": { "PeerID": "12D3Koo" }
        });
        repo().apply(&mut config).unwrap();

        assert_eq!(config["Addresses"]["API"], "/ip4/127.0.0.1/tcp/5001");
        assert_eq!(config["Addresses"]["Gateway"], "/ip4/127.0.0.1/tcp/8080");
        assert_eq!(config["Addresses"]["Swarm"][0], "/ip4/0.0.0.0/tcp/4001");
        assert_eq!(config["Addresses"]["Swarm"][2], "/ip4/0.0.0.0/udp/4001/quic-v1");
        assert_eq!(config["Swarm"]["ConnMgr"]["Type"], "basic");
        assert_eq!(config["Swarm"]["ConnMgr"]["LowWater"], 100);
        assert_eq!(config["Swarm"]["ConnMgr"]["HighWater"], 400);
        assert_eq!(config["Swarm"]["EnableRelayHop"], false);
        // untouched keys survive
        assert_eq!(config["Swarm"]["ConnMgr"]["GracePeriod"], "20s");
        assert_eq!(config["Identity"]["PeerID"], "12D3Koo");
    }

    #[test]
    fn test_apply_rejects_non_object_parent() {
        let mut config = json!({ "Addresses": "nope" });
        let err = repo().apply(&mut config).unwrap_err();
        assert!(matches!(err, SupervisorError::RepoConfig(_)));
    }
}
