//! Node identity for the trust ledger
//!
//! Each node holds an Ed25519 keypair (`SecretKey`/`PublicKey`). Proposals
//! and dismissals sent with `sign = true` carry a detached signature over the
//! canonical encoding of the message, so receivers can attribute every
//! trust entry to the node that vouched for it.

mod keys;

pub use ed25519_dalek::Signature;
pub use keys::{signature_hex, KeyError, PublicKey, SecretKey};
