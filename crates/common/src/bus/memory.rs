use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use super::transport::{GossipTransport, TransportError};

/// In-process gossip network
///
/// Every transport joined to the same network receives every frame any of
/// them publishes. Used for single-node operation and multi-node tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    nodes: Arc<Mutex<Vec<flume::Sender<Bytes>>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new node to the network
    pub fn join(&self) -> MemoryTransport {
        let (tx, rx) = flume::unbounded();
        self.nodes.lock().push(tx);
        MemoryTransport {
            network: self.clone(),
            rx,
        }
    }

    /// Deliver a frame to every attached node, returning how many got it
    pub fn broadcast(&self, frame: Bytes) -> usize {
        let mut nodes = self.nodes.lock();
        nodes.retain(|tx| tx.send(frame.clone()).is_ok());
        nodes.len()
    }

    pub fn len(&self) -> usize {
        self.nodes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    rx: flume::Receiver<Bytes>,
}

#[async_trait]
impl GossipTransport for MemoryTransport {
    async fn publish(&self, frame: Bytes) -> Result<(), TransportError> {
        self.network.broadcast(frame);
        Ok(())
    }

    async fn next(&self) -> Result<Option<Bytes>, TransportError> {
        Ok(self.rx.recv_async().await.ok())
    }
}
