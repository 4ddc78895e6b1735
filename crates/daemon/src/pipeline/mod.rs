//! The trust pipeline: `files` → `verified` → `safe`
//!
//! Each stage only ever learns about a key from the bus and only ever acts
//! by proposing into the next bucket (or dismissing from its own), so a
//! key moves forward monotonically and every node reaches the same ledger.

mod pinner;
mod verifier;
mod watcher;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::bus::Bus;
use common::cache::KeyCache;
use common::cas::CasClient;
use common::ledger::{Interval, TrustLedger};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub use pinner::{PinOutcome, Pinner};
pub use verifier::{Verdict, Verifier};
pub use watcher::{ScanReport, Watcher, WatcherError};

/// Name of the provenance side-car staged next to every imported file
pub const UPLOAD_INFO_FILE: &str = "upload_info.toml";

/// How long a new file is announced in `files`
pub const FILES_WINDOW_SECS: i64 = 7 * 24 * 60 * 60;
/// How long a dead key is retracted from `files`
pub const DISMISS_WINDOW_SECS: i64 = 60 * 60;
/// How long a pinned key is vouched for in `safe`
pub const SAFE_WINDOW_SECS: i64 = 7 * 24 * 60 * 60;

pub fn files_window(now: DateTime<Utc>) -> Interval {
    Interval::for_duration(now, chrono::Duration::seconds(FILES_WINDOW_SECS))
}

pub fn dismiss_window(now: DateTime<Utc>) -> Interval {
    Interval::for_duration(now, chrono::Duration::seconds(DISMISS_WINDOW_SECS))
}

pub fn safe_window(now: DateTime<Utc>) -> Interval {
    Interval::for_duration(now, chrono::Duration::seconds(SAFE_WINDOW_SECS))
}

/// Provenance side-car, stored alongside the file inside the imported tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadInfo {
    /// Basename of the file as found in the watch directory
    pub filename: String,
    /// Modification time of the source file
    pub ctime: DateTime<Utc>,
    /// Storage node id of the node that imported it
    pub upload_node: String,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub watch_dir: PathBuf,
    pub staging_dir: PathBuf,
    pub poll_interval: Duration,
    pub probe_timeout: Duration,
    pub pin_timeout: Duration,
    pub cache_capacity: u64,
    pub cache_ttl: Duration,
}

/// The three stages wired to one bus and one storage client
pub struct Pipeline<L: TrustLedger> {
    pub watcher: Watcher<L>,
    pub verifier: Verifier<L>,
    pub pinner: Pinner<L>,
}

impl<L: TrustLedger> Pipeline<L> {
    /// Build every stage, subscribing the consumers to the bus
    ///
    /// Must be called before the bus receive loop starts, or early messages
    /// will not reach the verifier and pinner.
    pub fn new(bus: Bus<L>, cas: Arc<dyn CasClient>, config: PipelineConfig) -> Self {
        Self {
            watcher: Watcher::new(
                bus.clone(),
                cas.clone(),
                config.watch_dir.clone(),
                config.staging_dir.clone(),
                KeyCache::new(config.cache_capacity, config.cache_ttl),
                config.poll_interval,
            ),
            verifier: Verifier::new(bus.clone(), cas.clone(), KeyCache::new(config.cache_capacity, config.cache_ttl), config.probe_timeout),
            pinner: Pinner::new(bus, cas, KeyCache::new(config.cache_capacity, config.cache_ttl), config.pin_timeout),
        }
    }

    /// Run every stage as its own task until `shutdown_rx` fires
    pub fn spawn(self, shutdown_rx: watch::Receiver<()>) -> Vec<JoinHandle<()>> {
        let Pipeline {
            watcher,
            verifier,
            pinner,
        } = self;

        let watcher_rx = shutdown_rx.clone();
        let verifier_rx = shutdown_rx.clone();
        vec![
            tokio::spawn(async move { watcher.run(watcher_rx).await }),
            tokio::spawn(async move { verifier.run(verifier_rx).await }),
            tokio::spawn(async move { pinner.run(shutdown_rx).await }),
        ]
    }
}
