use std::fmt::Debug;

use async_trait::async_trait;
use bytes::Bytes;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("gossip transport closed")]
    Closed,
    #[error("gossip transport i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Boundary to whatever pub/sub service carries gossip between nodes
///
/// Frames are opaque to the transport. A transport delivers every frame it
/// publishes to its own node too, so the local ledger sees local messages
/// through the same path as remote ones. Delivery is at-least-once and
/// best-effort FIFO per sender; consumers must tolerate duplicates and
/// reordering.
#[async_trait]
pub trait GossipTransport: Send + Sync + Debug + 'static {
    /// Broadcast a frame to every reachable node, including this one
    async fn publish(&self, frame: Bytes) -> Result<(), TransportError>;

    /// Wait for the next inbound frame
    ///
    /// Returns `Ok(None)` once the transport can never deliver again.
    async fn next(&self) -> Result<Option<Bytes>, TransportError>;
}
