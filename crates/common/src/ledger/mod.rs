//! The replicated trust ledger
//!
//! Buckets map content keys to time-bounded trust entries. Nodes never write
//! each other's ledgers; they exchange `Propose`/`Dismiss` messages and each
//! node merges them into its own copy.

mod memory;
mod message;
mod provider;
mod types;

pub use memory::{MemoryLedger, MemoryLedgerError};
pub use message::{Envelope, Message};
pub use provider::{
    Applied, BucketSnapshot, LedgerError, LedgerSnapshot, Retraction, TrustLedger,
};
pub use types::{Bucket, ContentKey, Interval, Provenance, TrustEntry, UnknownBucket};
