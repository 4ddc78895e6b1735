use std::fmt::{Debug, Display};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::message::Message;
use super::types::{Bucket, ContentKey, Interval, Provenance, TrustEntry};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError<T> {
    #[error("unhandled ledger provider error: {0}")]
    Provider(#[from] T),
    /// Messages for a bucket that was never initialized on this node
    #[error("bucket not initialized: {0}")]
    UninitializedBucket(Bucket),
}

/// Effect of applying one message to the ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    /// No entry existed, one was created
    Inserted(TrustEntry),
    /// An existing entry's window grew
    Widened(TrustEntry),
    /// An existing entry's window shrank
    Narrowed(TrustEntry),
    /// The entry's window became empty and it was dropped
    Removed,
    /// Nothing changed (duplicate delivery, or fully retracted proposal)
    Unchanged,
}

/// A retraction recorded by a dismissal. Proposals that arrive later are
/// clipped by it, so a dismissed key cannot be re-announced inside the window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Retraction {
    pub key: ContentKey,
    pub interval: Interval,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketSnapshot {
    pub bucket: Bucket,
    pub entries: Vec<TrustEntry>,
    pub retractions: Vec<Retraction>,
}

/// Point-in-time copy of every initialized bucket
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub buckets: Vec<BucketSnapshot>,
}

impl LedgerSnapshot {
    pub fn bucket(&self, bucket: Bucket) -> Option<&BucketSnapshot> {
        self.buckets.iter().find(|b| b.bucket == bucket)
    }
}

// NOTE: the ledger is never written to directly by pipeline components,
//  only by the bus facade applying messages received from the transport.
#[async_trait]
pub trait TrustLedger: Send + Sync + Debug + Clone + 'static {
    type Error: Display + Debug + Send;

    /// Make a bucket ready to accept messages. Idempotent.
    async fn init_bucket(&self, bucket: Bucket) -> Result<(), LedgerError<Self::Error>>;

    /// Apply a propose or dismiss
    ///
    /// # Arguments
    /// * `message` - The decoded message
    /// * `provenance` - Sender identity and signature, if the message was signed
    ///
    /// Should be idempotent to be considered correct: applying the same
    ///  message twice must leave the ledger as applying it once did.
    async fn apply(
        &self,
        message: &Message,
        provenance: Option<Provenance>,
    ) -> Result<Applied, LedgerError<Self::Error>>;

    /// The current entry for a key, expired or not
    async fn entry(
        &self,
        bucket: Bucket,
        key: &ContentKey,
    ) -> Result<Option<TrustEntry>, LedgerError<Self::Error>>;

    /// Entries whose window contains `now`
    async fn active_entries(
        &self,
        bucket: Bucket,
        now: DateTime<Utc>,
    ) -> Result<Vec<TrustEntry>, LedgerError<Self::Error>>;

    /// Drop entries and retractions whose window has closed.
    ///
    /// # Returns
    /// * the number of records dropped
    async fn prune(&self, now: DateTime<Utc>) -> Result<usize, LedgerError<Self::Error>>;

    async fn snapshot(&self) -> Result<LedgerSnapshot, LedgerError<Self::Error>>;

    /// Whether consumers should currently treat the key as present
    async fn is_active(
        &self,
        bucket: Bucket,
        key: &ContentKey,
        now: DateTime<Utc>,
    ) -> Result<bool, LedgerError<Self::Error>> {
        Ok(self
            .entry(bucket, key)
            .await?
            .map(|entry| entry.is_active(now))
            .unwrap_or(false))
    }
}
