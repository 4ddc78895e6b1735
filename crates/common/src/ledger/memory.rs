use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::message::Message;
use super::provider::{
    Applied, BucketSnapshot, LedgerError, LedgerSnapshot, Retraction, TrustLedger,
};
use super::types::{Bucket, ContentKey, Interval, Provenance, TrustEntry};

/// In-memory trust ledger using HashMaps
///
/// Merge rules, per key and bucket:
/// - a propose takes the hull of the existing window and the proposed one,
///   minus every recorded retraction, keeping the piece that still holds
///   the existing window, so an entry only ever grows
/// - a dismiss subtracts its window from the entry (never widening it) and
///   is remembered as a retraction
#[derive(Debug, Clone)]
pub struct MemoryLedger {
    inner: Arc<RwLock<MemoryLedgerInner>>,
}

#[derive(Debug, Default)]
struct MemoryLedgerInner {
    buckets: HashMap<Bucket, BucketState>,
}

#[derive(Debug, Default)]
struct BucketState {
    /// key -> the single live entry for that key
    entries: HashMap<ContentKey, TrustEntry>,
    /// key -> disjoint dismissal windows seen for that key, by start
    retractions: HashMap<ContentKey, Vec<Interval>>,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryLedgerError {
    #[error("memory ledger error: {0}")]
    Internal(String),
}

impl MemoryLedger {
    /// A ledger with no buckets initialized
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(MemoryLedgerInner::default())),
        }
    }

    /// A ledger with every known bucket initialized
    pub fn with_all_buckets() -> Self {
        let mut inner = MemoryLedgerInner::default();
        for bucket in Bucket::ALL {
            inner.buckets.entry(bucket).or_default();
        }
        Self {
            inner: Arc::new(RwLock::new(inner)),
        }
    }

    /// Rebuild a ledger from a snapshot, e.g. one persisted at shutdown
    pub fn from_snapshot(snapshot: LedgerSnapshot) -> Self {
        let mut inner = MemoryLedgerInner::default();
        for bucket in snapshot.buckets {
            let state = inner.buckets.entry(bucket.bucket).or_default();
            for entry in bucket.entries {
                state.entries.insert(entry.key.clone(), entry);
            }
            for retraction in bucket.retractions {
                record_retraction(
                    state.retractions.entry(retraction.key).or_default(),
                    retraction.interval,
                );
            }
        }
        Self {
            inner: Arc::new(RwLock::new(inner)),
        }
    }

    fn read(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, MemoryLedgerInner>, LedgerError<MemoryLedgerError>>
    {
        self.inner.read().map_err(|e| {
            LedgerError::Provider(MemoryLedgerError::Internal(format!(
                "failed to acquire read lock: {}",
                e
            )))
        })
    }

    fn write(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, MemoryLedgerInner>, LedgerError<MemoryLedgerError>>
    {
        self.inner.write().map_err(|e| {
            LedgerError::Provider(MemoryLedgerError::Internal(format!(
                "failed to acquire write lock: {}",
                e
            )))
        })
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

/// Add `cut` to a key's retractions, merging windows that overlap or touch
fn record_retraction(retractions: &mut Vec<Interval>, cut: Interval) {
    if cut.is_empty() {
        return;
    }
    let mut merged = cut;
    retractions.retain(|existing| {
        let touches = existing.overlaps(&merged)
            || Some(existing.start) == merged.end
            || existing.end == Some(merged.start);
        if touches {
            merged = merged.hull(existing);
        }
        !touches
    });
    retractions.push(merged);
    retractions.sort_by_key(|window| window.start);
}

impl BucketState {
    fn propose(
        &mut self,
        key: &ContentKey,
        interval: &Interval,
        provenance: Option<Provenance>,
    ) -> Applied {
        let cuts = self
            .retractions
            .get(key)
            .map(Vec::as_slice)
            .unwrap_or_default();

        match self.entries.get_mut(key) {
            None => {
                let Some(proposed) = interval.subtract_all(cuts).into_iter().next() else {
                    return Applied::Unchanged;
                };
                let entry = TrustEntry {
                    key: key.clone(),
                    interval: proposed,
                    provenance,
                };
                self.entries.insert(key.clone(), entry.clone());
                Applied::Inserted(entry)
            }
            Some(entry) => {
                // the live window never overlaps a retraction, so exactly one
                // piece of the merged hull holds it
                let merged = entry
                    .interval
                    .hull(interval)
                    .subtract_all(cuts)
                    .into_iter()
                    .find(|piece| entry.interval.is_subset_of(piece));
                match merged {
                    Some(merged) if merged != entry.interval => {
                        entry.interval = merged;
                        if provenance.is_some() {
                            entry.provenance = provenance;
                        }
                        Applied::Widened(entry.clone())
                    }
                    _ => Applied::Unchanged,
                }
            }
        }
    }

    fn dismiss(&mut self, key: &ContentKey, interval: &Interval) -> Applied {
        if interval.is_empty() {
            return Applied::Unchanged;
        }

        record_retraction(self.retractions.entry(key.clone()).or_default(), *interval);

        let Some(entry) = self.entries.get_mut(key) else {
            return Applied::Unchanged;
        };
        match entry.interval.subtract(interval) {
            None => {
                self.entries.remove(key);
                Applied::Removed
            }
            Some(narrowed) if narrowed == entry.interval => Applied::Unchanged,
            Some(narrowed) => {
                entry.interval = narrowed;
                Applied::Narrowed(entry.clone())
            }
        }
    }

    fn retraction_count(&self) -> usize {
        self.retractions.values().map(Vec::len).sum()
    }
}

#[async_trait]
impl TrustLedger for MemoryLedger {
    type Error = MemoryLedgerError;

    async fn init_bucket(&self, bucket: Bucket) -> Result<(), LedgerError<Self::Error>> {
        let mut inner = self.write()?;
        inner.buckets.entry(bucket).or_default();
        Ok(())
    }

    async fn apply(
        &self,
        message: &Message,
        provenance: Option<Provenance>,
    ) -> Result<Applied, LedgerError<Self::Error>> {
        let mut inner = self.write()?;
        let bucket = message.bucket();
        let state = inner
            .buckets
            .get_mut(&bucket)
            .ok_or(LedgerError::UninitializedBucket(bucket))?;

        let applied = match message {
            Message::Propose { key, interval, .. } => state.propose(key, interval, provenance),
            Message::Dismiss { key, interval, .. } => state.dismiss(key, interval),
        };
        Ok(applied)
    }

    async fn entry(
        &self,
        bucket: Bucket,
        key: &ContentKey,
    ) -> Result<Option<TrustEntry>, LedgerError<Self::Error>> {
        let inner = self.read()?;
        let state = inner
            .buckets
            .get(&bucket)
            .ok_or(LedgerError::UninitializedBucket(bucket))?;
        Ok(state.entries.get(key).cloned())
    }

    async fn active_entries(
        &self,
        bucket: Bucket,
        now: DateTime<Utc>,
    ) -> Result<Vec<TrustEntry>, LedgerError<Self::Error>> {
        let inner = self.read()?;
        let state = inner
            .buckets
            .get(&bucket)
            .ok_or(LedgerError::UninitializedBucket(bucket))?;
        let mut entries: Vec<TrustEntry> = state
            .entries
            .values()
            .filter(|entry| entry.is_active(now))
            .cloned()
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }

    async fn prune(&self, now: DateTime<Utc>) -> Result<usize, LedgerError<Self::Error>> {
        let mut inner = self.write()?;
        let mut dropped = 0;
        for state in inner.buckets.values_mut() {
            let before = state.entries.len() + state.retraction_count();
            state
                .entries
                .retain(|_, entry| !entry.interval.is_expired(now));
            state.retractions.retain(|_, windows| {
                windows.retain(|window| !window.is_expired(now));
                !windows.is_empty()
            });
            dropped += before - (state.entries.len() + state.retraction_count());
        }
        Ok(dropped)
    }

    async fn snapshot(&self) -> Result<LedgerSnapshot, LedgerError<Self::Error>> {
        let inner = self.read()?;
        let mut buckets: Vec<BucketSnapshot> = inner
            .buckets
            .iter()
            .map(|(bucket, state)| {
                let mut entries: Vec<TrustEntry> = state.entries.values().cloned().collect();
                entries.sort_by(|a, b| a.key.cmp(&b.key));
                let mut retractions: Vec<Retraction> = state
                    .retractions
                    .iter()
                    .flat_map(|(key, windows)| {
                        windows.iter().map(move |window| Retraction {
                            key: key.clone(),
                            interval: *window,
                        })
                    })
                    .collect();
                retractions.sort_by(|a, b| {
                    a.key
                        .cmp(&b.key)
                        .then(a.interval.start.cmp(&b.interval.start))
                });
                BucketSnapshot {
                    bucket: *bucket,
                    entries,
                    retractions,
                }
            })
            .collect();
        buckets.sort_by_key(|b| b.bucket);
        Ok(LedgerSnapshot { buckets })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn key() -> ContentKey {
        ContentKey::from("bafybeigdyrzt5sfp7udm7hu76uh7y26nf3efuylqabf3oclgtqy55fbzdi")
    }

    #[tokio::test]
    async fn test_uninitialized_bucket_is_rejected() {
        let ledger = MemoryLedger::new();
        let msg = Message::propose(
            Bucket::Files,
            key(),
            Interval::for_duration(t(0), Duration::days(7)),
            false,
        );
        let err = ledger.apply(&msg, None).await.unwrap_err();
        assert_eq!(err, LedgerError::UninitializedBucket(Bucket::Files));

        ledger.init_bucket(Bucket::Files).await.unwrap();
        assert!(matches!(
            ledger.apply(&msg, None).await.unwrap(),
            Applied::Inserted(_)
        ));
    }

    #[tokio::test]
    async fn test_propose_is_idempotent() {
        let ledger = MemoryLedger::with_all_buckets();
        let msg = Message::propose(
            Bucket::Files,
            key(),
            Interval::for_duration(t(0), Duration::days(7)),
            false,
        );

        assert!(matches!(
            ledger.apply(&msg, None).await.unwrap(),
            Applied::Inserted(_)
        ));
        let first = ledger.snapshot().await.unwrap();
        for _ in 0..5 {
            assert_eq!(ledger.apply(&msg, None).await.unwrap(), Applied::Unchanged);
        }
        assert_eq!(ledger.snapshot().await.unwrap(), first);
    }

    #[tokio::test]
    async fn test_overlapping_proposals_union() {
        let ledger = MemoryLedger::with_all_buckets();
        let a = Message::propose(Bucket::Files, key(), Interval::new(t(0), Some(t(100))), false);
        let b = Message::propose(Bucket::Files, key(), Interval::new(t(50), Some(t(300))), false);
        ledger.apply(&a, None).await.unwrap();
        let applied = ledger.apply(&b, None).await.unwrap();

        let Applied::Widened(entry) = applied else {
            panic!("expected widen, got {:?}", applied);
        };
        assert_eq!(entry.interval, Interval::new(t(0), Some(t(300))));
    }

    #[tokio::test]
    async fn test_dismiss_truncates_entry() {
        let ledger = MemoryLedger::with_all_buckets();
        ledger
            .apply(
                &Message::propose(Bucket::Files, key(), Interval::new(t(0), Some(t(1000))), false),
                None,
            )
            .await
            .unwrap();
        let dismiss = Message::dismiss(Bucket::Files, key(), Interval::new(t(10), Some(t(20))));

        let applied = ledger.apply(&dismiss, None).await.unwrap();
        let Applied::Narrowed(entry) = applied else {
            panic!("expected narrow, got {:?}", applied);
        };
        assert_eq!(entry.interval, Interval::new(t(0), Some(t(10))));
        assert!(!ledger.is_active(Bucket::Files, &key(), t(15)).await.unwrap());

        // Re-delivery changes nothing
        assert_eq!(ledger.apply(&dismiss, None).await.unwrap(), Applied::Unchanged);
    }

    #[tokio::test]
    async fn test_dismiss_before_propose_clips_later_proposal() {
        let ledger = MemoryLedger::with_all_buckets();
        let dismiss = Message::dismiss(Bucket::Files, key(), Interval::new(t(0), Some(t(3600))));
        assert_eq!(ledger.apply(&dismiss, None).await.unwrap(), Applied::Unchanged);

        let propose = Message::propose(
            Bucket::Files,
            key(),
            Interval::new(t(60), Some(t(7200))),
            false,
        );
        let Applied::Inserted(entry) = ledger.apply(&propose, None).await.unwrap() else {
            panic!("expected insert");
        };
        assert_eq!(entry.interval, Interval::new(t(3600), Some(t(7200))));
        assert!(!ledger.is_active(Bucket::Files, &key(), t(120)).await.unwrap());
        assert!(ledger.is_active(Bucket::Files, &key(), t(3600)).await.unwrap());
    }

    #[tokio::test]
    async fn test_proposal_inside_retraction_is_ignored() {
        let ledger = MemoryLedger::with_all_buckets();
        ledger
            .apply(
                &Message::dismiss(Bucket::Files, key(), Interval::new(t(0), Some(t(3600)))),
                None,
            )
            .await
            .unwrap();
        let propose = Message::propose(
            Bucket::Files,
            key(),
            Interval::new(t(10), Some(t(20))),
            false,
        );
        assert_eq!(ledger.apply(&propose, None).await.unwrap(), Applied::Unchanged);
        assert_eq!(ledger.entry(Bucket::Files, &key()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_proposal_never_shrinks_live_entry() {
        let ledger = MemoryLedger::with_all_buckets();
        let files = |interval| Message::propose(Bucket::Files, key(), interval, false);
        ledger
            .apply(
                &Message::dismiss(Bucket::Files, key(), Interval::new(t(40), Some(t(50)))),
                None,
            )
            .await
            .unwrap();
        ledger
            .apply(&files(Interval::new(t(60), Some(t(200)))), None)
            .await
            .unwrap();

        // reaches back across the dismissed window
        let applied = ledger
            .apply(&files(Interval::new(t(0), Some(t(100)))), None)
            .await
            .unwrap();
        let Applied::Widened(entry) = applied else {
            panic!("expected widen, got {:?}", applied);
        };
        assert_eq!(entry.interval, Interval::new(t(50), Some(t(200))));
        assert!(ledger.is_active(Bucket::Files, &key(), t(100)).await.unwrap());
        assert!(!ledger.is_active(Bucket::Files, &key(), t(45)).await.unwrap());
    }

    #[tokio::test]
    async fn test_separate_dismissals_keep_their_gaps() {
        let ledger = MemoryLedger::with_all_buckets();
        let files = |interval| Message::propose(Bucket::Files, key(), interval, false);
        ledger
            .apply(&files(Interval::new(t(30), Some(t(100)))), None)
            .await
            .unwrap();
        for (start, end) in [(10, 20), (50, 60)] {
            ledger
                .apply(
                    &Message::dismiss(Bucket::Files, key(), Interval::new(t(start), Some(t(end)))),
                    None,
                )
                .await
                .unwrap();
        }
        assert_eq!(
            ledger.entry(Bucket::Files, &key()).await.unwrap().unwrap().interval,
            Interval::new(t(30), Some(t(50)))
        );

        // the time between the two dismissals was never retracted
        ledger
            .apply(&files(Interval::new(t(15), Some(t(45)))), None)
            .await
            .unwrap();
        assert_eq!(
            ledger.entry(Bucket::Files, &key()).await.unwrap().unwrap().interval,
            Interval::new(t(20), Some(t(50)))
        );

        let snapshot = ledger.snapshot().await.unwrap();
        assert_eq!(snapshot.bucket(Bucket::Files).unwrap().retractions.len(), 2);
    }

    #[tokio::test]
    async fn test_dismiss_covering_entry_removes_it() {
        let ledger = MemoryLedger::with_all_buckets();
        ledger
            .apply(
                &Message::propose(Bucket::Verified, key(), Interval::unbounded(t(10)), false),
                None,
            )
            .await
            .unwrap();
        let applied = ledger
            .apply(
                &Message::dismiss(Bucket::Verified, key(), Interval::unbounded(t(0))),
                None,
            )
            .await
            .unwrap();
        assert_eq!(applied, Applied::Removed);
        assert_eq!(ledger.entry(Bucket::Verified, &key()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_buckets_are_independent() {
        let ledger = MemoryLedger::with_all_buckets();
        ledger
            .apply(
                &Message::propose(Bucket::Files, key(), Interval::unbounded(t(0)), false),
                None,
            )
            .await
            .unwrap();
        ledger
            .apply(
                &Message::dismiss(Bucket::Safe, key(), Interval::unbounded(t(0))),
                None,
            )
            .await
            .unwrap();
        assert!(ledger.is_active(Bucket::Files, &key(), t(5)).await.unwrap());
    }

    #[tokio::test]
    async fn test_prune_drops_expired_records() {
        let ledger = MemoryLedger::with_all_buckets();
        ledger
            .apply(
                &Message::propose(Bucket::Safe, key(), Interval::new(t(0), Some(t(10))), false),
                None,
            )
            .await
            .unwrap();
        ledger
            .apply(
                &Message::propose(
                    Bucket::Safe,
                    ContentKey::from("other"),
                    Interval::unbounded(t(0)),
                    false,
                ),
                None,
            )
            .await
            .unwrap();
        ledger
            .apply(
                &Message::dismiss(Bucket::Files, key(), Interval::new(t(0), Some(t(5)))),
                None,
            )
            .await
            .unwrap();

        assert_eq!(ledger.prune(t(20)).await.unwrap(), 2);
        let active = ledger.active_entries(Bucket::Safe, t(20)).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].key, ContentKey::from("other"));
    }

    #[tokio::test]
    async fn test_snapshot_restores() {
        let ledger = MemoryLedger::with_all_buckets();
        ledger
            .apply(
                &Message::propose(Bucket::Files, key(), Interval::unbounded(t(0)), false),
                None,
            )
            .await
            .unwrap();
        ledger
            .apply(
                &Message::dismiss(Bucket::Verified, key(), Interval::new(t(0), Some(t(60)))),
                None,
            )
            .await
            .unwrap();

        let snapshot = ledger.snapshot().await.unwrap();
        let json = serde_json::to_string(&snapshot).unwrap();
        let restored = MemoryLedger::from_snapshot(serde_json::from_str(&json).unwrap());
        assert_eq!(restored.snapshot().await.unwrap(), snapshot);
    }
}
