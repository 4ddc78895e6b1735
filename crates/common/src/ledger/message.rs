use serde::{Deserialize, Serialize};

use super::types::{Bucket, ContentKey, Interval};
use crate::crypto::{signature_hex, PublicKey, Signature};

/// A ledger mutation, as gossiped between nodes
///
/// Behaviour is decided by the variant and the explicit bucket, never by
/// which channel the message happened to arrive on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Message {
    /// Insert the key into `bucket`, or widen its window
    Propose {
        bucket: Bucket,
        key: ContentKey,
        interval: Interval,
        signed: bool,
    },
    /// Narrow or retract the key's window in `bucket`
    Dismiss {
        bucket: Bucket,
        key: ContentKey,
        interval: Interval,
    },
}

impl Message {
    pub fn propose(bucket: Bucket, key: ContentKey, interval: Interval, signed: bool) -> Self {
        Message::Propose {
            bucket,
            key,
            interval,
            signed,
        }
    }

    pub fn dismiss(bucket: Bucket, key: ContentKey, interval: Interval) -> Self {
        Message::Dismiss {
            bucket,
            key,
            interval,
        }
    }

    pub fn bucket(&self) -> Bucket {
        match self {
            Message::Propose { bucket, .. } | Message::Dismiss { bucket, .. } => *bucket,
        }
    }

    pub fn key(&self) -> &ContentKey {
        match self {
            Message::Propose { key, .. } | Message::Dismiss { key, .. } => key,
        }
    }

    pub fn interval(&self) -> &Interval {
        match self {
            Message::Propose { interval, .. } | Message::Dismiss { interval, .. } => interval,
        }
    }

    pub fn is_propose(&self) -> bool {
        matches!(self, Message::Propose { .. })
    }

    /// Canonical bytes covered by a signature
    pub fn signing_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// What travels over the gossip transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Logical channel the sender published on (the bucket name for ledger traffic)
    pub origin_channel: String,
    pub sender: PublicKey,
    pub message: Message,
    #[serde(
        default,
        with = "signature_hex::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub signature: Option<Signature>,
}

impl Envelope {
    /// The content key this envelope is about
    pub fn contents(&self) -> &ContentKey {
        self.message.key()
    }

    pub fn is_signed(&self) -> bool {
        self.signature.is_some()
    }
}
