use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use common::ledger::{Bucket, LedgerSnapshot, MemoryLedger, TrustLedger};
use tokio::sync::watch;

/// JSON snapshot of the ledger on local disk
///
/// Nodes can always rebuild the ledger from their peers' traffic, so the
/// snapshot only spares a restarted node from re-verifying everything.
#[derive(Debug, Clone)]
pub struct LedgerStore {
    path: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerStoreError {
    #[error("IO error on ledger snapshot: {0}")]
    Io(#[from] std::io::Error),

    #[error("ledger snapshot is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("ledger error: {0}")]
    Ledger(String),
}

impl LedgerStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the last snapshot, or start empty if there is none
    ///
    /// Every bucket is initialized either way.
    pub async fn load(&self) -> Result<MemoryLedger, LedgerStoreError> {
        let ledger = match tokio::fs::read(&self.path).await {
            Ok(raw) => {
                let snapshot: LedgerSnapshot = serde_json::from_slice(&raw)?;
                MemoryLedger::from_snapshot(snapshot)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %self.path.display(), "no ledger snapshot, starting empty");
                return Ok(MemoryLedger::with_all_buckets());
            }
            Err(e) => return Err(e.into()),
        };

        for bucket in Bucket::ALL {
            ledger
                .init_bucket(bucket)
                .await
                .map_err(|e| LedgerStoreError::Ledger(e.to_string()))?;
        }
        tracing::info!(path = %self.path.display(), "ledger snapshot loaded");
        Ok(ledger)
    }

    /// Write a snapshot, replacing the previous one atomically
    pub async fn save<L: TrustLedger>(&self, ledger: &L) -> Result<(), LedgerStoreError> {
        let snapshot = ledger
            .snapshot()
            .await
            .map_err(|e| LedgerStoreError::Ledger(e.to_string()))?;
        let encoded = serde_json::to_vec_pretty(&snapshot)?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, encoded).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    /// Drop expired records and save, every `interval` and once more at shutdown
    pub async fn maintain<L: TrustLedger>(
        &self,
        ledger: L,
        interval: Duration,
        mut shutdown_rx: watch::Receiver<()>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = ticker.tick() => self.flush(&ledger).await,
            }
        }
        self.flush(&ledger).await;
        tracing::info!(path = %self.path.display(), "ledger saved on shutdown");
    }

    async fn flush<L: TrustLedger>(&self, ledger: &L) {
        match ledger.prune(Utc::now()).await {
            Ok(0) => {}
            Ok(dropped) => tracing::debug!(dropped, "pruned expired ledger records"),
            Err(e) => tracing::warn!(error = %e, "failed to prune ledger"),
        }
        if let Err(e) = self.save(ledger).await {
            tracing::error!(error = %e, "failed to save ledger snapshot");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::ledger::{ContentKey, Interval, Message};

    #[tokio::test]
    async fn test_missing_snapshot_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = LedgerStore::new(dir.path().join("ledger.json"));
        let ledger = store.load().await.unwrap();
        let snapshot = ledger.snapshot().await.unwrap();
        assert_eq!(snapshot.buckets.len(), Bucket::ALL.len());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = LedgerStore::new(dir.path().join("nested").join("ledger.json"));
        let ledger = MemoryLedger::with_all_buckets();
        let key = ContentKey::new("QmSaved");
        ledger
            .apply(
                &Message::propose(Bucket::Safe, key.clone(), Interval::unbounded(Utc::now()), false),
                None,
            )
            .await
            .unwrap();

        store.save(&ledger).await.unwrap();
        assert!(!store.path().with_extension("json.tmp").exists());

        let restored = store.load().await.unwrap();
        assert!(restored.is_active(Bucket::Safe, &key, Utc::now()).await.unwrap());
        assert_eq!(
            restored.snapshot().await.unwrap(),
            ledger.snapshot().await.unwrap()
        );
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        std::fs::write(&path, b"{ not json").unwrap();
        let err = LedgerStore::new(path).load().await.unwrap_err();
        assert!(matches!(err, LedgerStoreError::Json(_)));
    }

    #[tokio::test]
    async fn test_maintain_saves_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let store = LedgerStore::new(dir.path().join("ledger.json"));
        let ledger = MemoryLedger::with_all_buckets();
        let (tx, rx) = watch::channel(());

        let task = tokio::spawn({
            let store = store.clone();
            let ledger = ledger.clone();
            async move { store.maintain(ledger, Duration::from_secs(3600), rx).await }
        });
        tx.send(()).unwrap();
        task.await.unwrap();

        assert!(store.path().exists());
    }
}
