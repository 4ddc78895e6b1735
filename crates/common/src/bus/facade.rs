use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::watch::Receiver as WatchReceiver;

use super::transport::{GossipTransport, TransportError};
use crate::crypto::{PublicKey, SecretKey};
use crate::ledger::{
    Applied, Bucket, ContentKey, Envelope, Interval, LedgerError, Message, Provenance,
    TrustLedger,
};

#[derive(Debug, thiserror::Error)]
pub enum BusError<E> {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError<E>),
}

/// Why an inbound frame was not applied
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError<E> {
    #[error("undecodable frame: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("invalid signature from {0}")]
    BadSignature(PublicKey),
    #[error("proposal from {0} claims to be signed but carries no signature")]
    MissingSignature(PublicKey),
    #[error("ledger rejected message: {0}")]
    Ledger(#[from] LedgerError<E>),
}

/// A component's view of one bucket's traffic
///
/// Receives every envelope the bus applies to `bucket`, including
/// duplicates, in arrival order.
#[derive(Debug)]
pub struct Mailbox {
    bucket: Bucket,
    rx: flume::Receiver<Envelope>,
}

impl Mailbox {
    pub fn bucket(&self) -> Bucket {
        self.bucket
    }

    /// Wait for the next envelope addressed to this subscriber
    ///
    /// Returns `None` once the bus has stopped.
    pub async fn next_for_me(&self) -> Option<Envelope> {
        self.rx.recv_async().await.ok()
    }

    pub fn try_next(&self) -> Option<Envelope> {
        self.rx.try_recv().ok()
    }
}

/// The node's single entry point to the gossip mesh
///
/// Outgoing messages are signed with the node key and published on the
/// transport. Inbound frames, including our own looped back, are decoded
/// once, checked, applied to the local ledger and then fanned out to
/// subscribed mailboxes. Clones share state.
pub struct Bus<L: TrustLedger> {
    inner: Arc<BusInner<L>>,
}

struct BusInner<L: TrustLedger> {
    ledger: L,
    transport: Arc<dyn GossipTransport>,
    secret_key: SecretKey,
    mailboxes: RwLock<HashMap<Bucket, Vec<flume::Sender<Envelope>>>>,
}

impl<L: TrustLedger> Clone for Bus<L> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<L: TrustLedger> fmt::Debug for Bus<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bus")
            .field("node", &self.node())
            .field("ledger", &self.inner.ledger)
            .field("transport", &self.inner.transport)
            .finish()
    }
}

impl<L: TrustLedger> Bus<L> {
    pub fn new(ledger: L, transport: Arc<dyn GossipTransport>, secret_key: SecretKey) -> Self {
        Self {
            inner: Arc::new(BusInner {
                ledger,
                transport,
                secret_key,
                mailboxes: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn ledger(&self) -> &L {
        &self.inner.ledger
    }

    /// This node's identity on the mesh
    pub fn node(&self) -> PublicKey {
        self.inner.secret_key.public()
    }

    pub fn subscribe(&self, bucket: Bucket) -> Mailbox {
        let (tx, rx) = flume::unbounded();
        self.inner
            .mailboxes
            .write()
            .entry(bucket)
            .or_default()
            .push(tx);
        Mailbox { bucket, rx }
    }

    /// Broadcast a message to every node, this one included
    ///
    /// # Arguments
    /// * `origin_channel` - Logical channel to stamp on the envelope
    /// * `message` - The propose or dismiss to send
    /// * `sign` - Attach a signature by the node key. A proposal's `signed`
    ///   flag is overwritten to match.
    pub async fn send_to_brain(
        &self,
        origin_channel: &str,
        mut message: Message,
        sign: bool,
    ) -> Result<Envelope, BusError<L::Error>> {
        if let Message::Propose { signed, .. } = &mut message {
            *signed = sign;
        }
        let signature = if sign {
            Some(self.inner.secret_key.sign(&message.signing_bytes()?))
        } else {
            None
        };
        let envelope = Envelope {
            origin_channel: origin_channel.to_string(),
            sender: self.node(),
            message,
            signature,
        };

        let frame = serde_json::to_vec(&envelope)?;
        self.inner.transport.publish(Bytes::from(frame)).await?;
        tracing::debug!(
            bucket = %envelope.message.bucket(),
            key = %envelope.contents(),
            propose = envelope.message.is_propose(),
            "published ledger message"
        );
        Ok(envelope)
    }

    pub async fn propose(
        &self,
        bucket: Bucket,
        key: ContentKey,
        interval: Interval,
        sign: bool,
    ) -> Result<Envelope, BusError<L::Error>> {
        let message = Message::propose(bucket, key, interval, sign);
        self.send_to_brain(bucket.as_str(), message, sign).await
    }

    pub async fn dismiss(
        &self,
        bucket: Bucket,
        key: ContentKey,
        interval: Interval,
    ) -> Result<Envelope, BusError<L::Error>> {
        let message = Message::dismiss(bucket, key, interval);
        self.send_to_brain(bucket.as_str(), message, true).await
    }

    /// Decode, check and apply one inbound frame, then route it
    pub async fn deliver(&self, frame: &[u8]) -> Result<Applied, DeliveryError<L::Error>> {
        let envelope: Envelope = serde_json::from_slice(frame)?;

        let provenance = match &envelope.signature {
            Some(signature) => {
                let bytes = envelope.message.signing_bytes()?;
                envelope
                    .sender
                    .verify(&bytes, signature)
                    .map_err(|_| DeliveryError::BadSignature(envelope.sender))?;
                Some(Provenance {
                    origin: envelope.sender,
                    signature: *signature,
                })
            }
            None => {
                if let Message::Propose { signed: true, .. } = envelope.message {
                    return Err(DeliveryError::MissingSignature(envelope.sender));
                }
                None
            }
        };

        let applied = self
            .inner
            .ledger
            .apply(&envelope.message, provenance)
            .await?;
        tracing::trace!(
            bucket = %envelope.message.bucket(),
            key = %envelope.contents(),
            ?applied,
            "applied ledger message"
        );

        self.route(envelope);
        Ok(applied)
    }

    fn route(&self, envelope: Envelope) {
        let mut mailboxes = self.inner.mailboxes.write();
        if let Some(subscribers) = mailboxes.get_mut(&envelope.message.bucket()) {
            subscribers.retain(|tx| tx.send(envelope.clone()).is_ok());
        }
    }

    /// Receive loop: pull frames off the transport until shutdown
    ///
    /// Bad frames are logged and dropped. Mailboxes are closed on exit.
    pub async fn run(&self, mut shutdown_rx: WatchReceiver<()>) -> Result<(), BusError<L::Error>> {
        tracing::info!(node = %self.node(), "message bus started");
        let result = loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break Ok(()),
                frame = self.inner.transport.next() => match frame {
                    Ok(Some(frame)) => {
                        if let Err(e) = self.deliver(&frame).await {
                            tracing::warn!(error = %e, "dropping inbound ledger message");
                        }
                    }
                    Ok(None) => {
                        tracing::warn!("gossip transport closed");
                        break Ok(());
                    }
                    Err(e) => break Err(BusError::Transport(e)),
                }
            }
        };
        self.inner.mailboxes.write().clear();
        tracing::info!("message bus stopped");
        result
    }
}
