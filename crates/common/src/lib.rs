/**
 * Message bus facade.
 *  Signs, publishes and receives ledger messages
 *  over a pluggable gossip transport, and fans
 *  them out to per-bucket mailboxes.
 */
pub mod bus;
/**
 * Bounded, expiring key sets used to make
 *  pipeline components idempotent.
 */
pub mod cache;
/**
 * Client for the content-addressed storage
 *  daemon (Kubo-compatible HTTP RPC).
 */
pub mod cas;
/**
 * Cryptographic types and operations.
 *  - Node identity keys
 *  - Message signatures
 */
pub mod crypto;
/**
 * The replicated trust ledger: buckets of
 *  content keys with time-bounded validity,
 *  merged from propose/dismiss messages.
 */
pub mod ledger;
/**
 * In-memory doubles and helpers for
 *  multi-node integration tests.
 */
#[cfg(any(test, feature = "testkit"))]
pub mod testkit;
/**
 * Helper for setting build version information
 *  at compile time.
 */
pub mod version;

pub mod prelude {
    pub use crate::bus::{Bus, GossipTransport, Mailbox};
    pub use crate::cache::KeyCache;
    pub use crate::cas::{CasClient, CasError};
    pub use crate::crypto::{PublicKey, SecretKey};
    pub use crate::ledger::{
        Bucket, ContentKey, Interval, Message, TrustEntry, TrustLedger,
    };
    pub use crate::version::build_info;
}
