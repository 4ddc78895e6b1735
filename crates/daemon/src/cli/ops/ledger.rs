use std::fmt::Write;

use chrono::Utc;
use clap::Args;

use common::ledger::{Bucket, LedgerSnapshot, TrustLedger};
use vouch_daemon::ledger_store::{LedgerStore, LedgerStoreError};
use vouch_daemon::state::{AppState, StateError};

/// Print the node's last saved ledger snapshot
#[derive(Args, Debug, Clone)]
pub struct Ledger {
    /// Only show this bucket (files, verified, safe, ...)
    #[arg(long)]
    pub bucket: Option<Bucket>,

    /// Include expired entries and retractions
    #[arg(long)]
    pub all: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("state error: {0}")]
    State(#[from] StateError),

    #[error("{0}")]
    Store(#[from] LedgerStoreError),

    #[error("ledger error: {0}")]
    Ledger(String),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Ledger {
    type Error = LedgerError;
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let state = AppState::load(ctx.config_path.clone())?;
        let ledger = LedgerStore::new(&state.ledger_path).load().await?;
        let snapshot = ledger
            .snapshot()
            .await
            .map_err(|e| LedgerError::Ledger(e.to_string()))?;
        Ok(render(&snapshot, self.bucket, self.all))
    }
}

fn render(snapshot: &LedgerSnapshot, only: Option<Bucket>, all: bool) -> String {
    let now = Utc::now();
    let mut out = String::new();
    for bucket in &snapshot.buckets {
        if only.is_some_and(|b| b != bucket.bucket) {
            continue;
        }
        let entries: Vec<_> = bucket
            .entries
            .iter()
            .filter(|entry| all || entry.is_active(now))
            .collect();
        if entries.is_empty() && only.is_none() && !all {
            continue;
        }

        let _ = writeln!(out, "{} ({})", bucket.bucket, entries.len());
        for entry in entries {
            let origin = entry
                .provenance
                .as_ref()
                .map(|p| p.origin.to_string())
                .unwrap_or_else(|| "unsigned".to_string());
            let _ = writeln!(out, "  {} {} {}", entry.key, entry.interval, origin);
        }
        if all {
            for retraction in &bucket.retractions {
                let _ = writeln!(out, "  - {} {}", retraction.key, retraction.interval);
            }
        }
    }
    if out.is_empty() {
        out.push_str("ledger is empty");
    }
    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::ledger::{ContentKey, Interval, MemoryLedger, Message};

    async fn snapshot() -> LedgerSnapshot {
        let ledger = MemoryLedger::with_all_buckets();
        for (bucket, key) in [(Bucket::Files, "QmFile"), (Bucket::Safe, "QmSafe")] {
            ledger
                .apply(
                    &Message::propose(
                        bucket,
                        ContentKey::new(key),
                        Interval::unbounded(Utc::now()),
                        false,
                    ),
                    None,
                )
                .await
                .unwrap();
        }
        ledger.snapshot().await.unwrap()
    }

    #[tokio::test]
    async fn test_render_skips_empty_buckets() {
        let out = render(&snapshot().await, None, false);
        assert!(out.contains("files (1)"));
        assert!(out.contains("safe (1)"));
        assert!(!out.contains("verified"));
        assert!(out.contains("unsigned"));
    }

    #[tokio::test]
    async fn test_render_one_bucket() {
        let out = render(&snapshot().await, Some(Bucket::Verified), false);
        assert_eq!(out, "verified (0)");
    }

    #[test]
    fn test_render_nothing() {
        assert_eq!(render(&LedgerSnapshot::default(), None, false), "ledger is empty");
    }
}
