use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch::Receiver as WatchReceiver;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};

use super::transport::{GossipTransport, TransportError};

/// A peer sending a longer line is disconnected
pub const MAX_FRAME_LEN: usize = 1 << 20;
/// Frames queued per peer while it is unreachable
const OUTBOUND_QUEUE: usize = 1024;
const RECONNECT_MIN: Duration = Duration::from_millis(500);
const RECONNECT_MAX: Duration = Duration::from_secs(30);

#[derive(Debug)]
struct PeerLink {
    addr: SocketAddr,
    tx: flume::Sender<Bytes>,
}

/// Full-mesh gossip over TCP
///
/// Listens for inbound peers and keeps one outbound connection per
/// configured peer, exchanging newline-delimited frames. Frames are never
/// relayed, so every node must list every other node it wants to hear from
/// it. Background tasks stop when `shutdown_rx` fires.
#[derive(Debug)]
pub struct TcpTransport {
    local_addr: SocketAddr,
    inbound_tx: flume::Sender<Bytes>,
    inbound_rx: flume::Receiver<Bytes>,
    peers: Vec<PeerLink>,
}

impl TcpTransport {
    pub async fn bind(
        listen: SocketAddr,
        peers: Vec<SocketAddr>,
        shutdown_rx: WatchReceiver<()>,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(listen).await?;
        let local_addr = listener.local_addr()?;
        let (inbound_tx, inbound_rx) = flume::unbounded();

        tracing::info!(%local_addr, peers = peers.len(), "gossip transport listening");
        tokio::spawn(accept_loop(
            listener,
            inbound_tx.clone(),
            shutdown_rx.clone(),
        ));

        let peers = peers
            .into_iter()
            .map(|addr| {
                let (tx, rx) = flume::bounded(OUTBOUND_QUEUE);
                tokio::spawn(dial_loop(addr, rx, shutdown_rx.clone()));
                PeerLink { addr, tx }
            })
            .collect();

        Ok(Self {
            local_addr,
            inbound_tx,
            inbound_rx,
            peers,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[async_trait]
impl GossipTransport for TcpTransport {
    async fn publish(&self, frame: Bytes) -> Result<(), TransportError> {
        // loopback first, so our own ledger sees what we said
        self.inbound_tx
            .send(frame.clone())
            .map_err(|_| TransportError::Closed)?;

        for peer in &self.peers {
            match peer.tx.try_send(frame.clone()) {
                Ok(()) => {}
                Err(flume::TrySendError::Full(_)) => {
                    tracing::warn!(peer = %peer.addr, "outbound gossip queue full, dropping frame");
                }
                Err(flume::TrySendError::Disconnected(_)) => {
                    tracing::debug!(peer = %peer.addr, "peer link closed, dropping frame");
                }
            }
        }
        Ok(())
    }

    async fn next(&self) -> Result<Option<Bytes>, TransportError> {
        Ok(self.inbound_rx.recv_async().await.ok())
    }
}

async fn accept_loop(
    listener: TcpListener,
    inbound: flume::Sender<Bytes>,
    mut shutdown_rx: WatchReceiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    tracing::debug!(%remote, "accepted gossip peer");
                    tokio::spawn(read_frames(stream, remote, inbound.clone(), shutdown_rx.clone()));
                }
                Err(e) => tracing::warn!(error = %e, "failed to accept gossip peer"),
            }
        }
    }
}

async fn read_frames(
    stream: TcpStream,
    remote: SocketAddr,
    inbound: flume::Sender<Bytes>,
    mut shutdown_rx: WatchReceiver<()>,
) {
    let mut lines = FramedRead::new(stream, LinesCodec::new_with_max_length(MAX_FRAME_LEN));
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            line = lines.next() => match line {
                Some(Ok(line)) => {
                    if line.is_empty() {
                        continue;
                    }
                    if inbound.send(Bytes::from(line)).is_err() {
                        break;
                    }
                }
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    tracing::warn!(%remote, max = MAX_FRAME_LEN, "oversized gossip frame, dropping peer");
                    break;
                }
                Some(Err(LinesCodecError::Io(e))) => {
                    tracing::warn!(%remote, error = %e, "gossip read failed");
                    break;
                }
                None => {
                    tracing::debug!(%remote, "gossip peer disconnected");
                    break;
                }
            }
        }
    }
}

async fn dial_loop(
    addr: SocketAddr,
    outbound: flume::Receiver<Bytes>,
    mut shutdown_rx: WatchReceiver<()>,
) {
    let mut delay = RECONNECT_MIN;
    loop {
        let connected = tokio::select! {
            _ = shutdown_rx.changed() => return,
            connected = TcpStream::connect(addr) => connected,
        };
        let mut stream = match connected {
            Ok(stream) => {
                tracing::info!(peer = %addr, "connected to gossip peer");
                delay = RECONNECT_MIN;
                stream
            }
            Err(e) => {
                tracing::debug!(peer = %addr, error = %e, retry_in = ?delay, "gossip peer unreachable");
                tokio::select! {
                    _ = shutdown_rx.changed() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                delay = (delay * 2).min(RECONNECT_MAX);
                continue;
            }
        };

        loop {
            let frame = tokio::select! {
                _ = shutdown_rx.changed() => return,
                frame = outbound.recv_async() => match frame {
                    Ok(frame) => frame,
                    Err(_) => return,
                },
            };
            let written: std::io::Result<()> = async {
                stream.write_all(&frame).await?;
                stream.write_all(b"\n").await
            }
            .await;
            if let Err(e) = written {
                tracing::warn!(peer = %addr, error = %e, "lost gossip peer, reconnecting");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_cross_the_mesh() {
        let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(());
        let loopback: SocketAddr = "127.0.0.1:0".parse().unwrap();

        let b = TcpTransport::bind(loopback, vec![], shutdown_rx.clone())
            .await
            .unwrap();
        let a = TcpTransport::bind(loopback, vec![b.local_addr()], shutdown_rx.clone())
            .await
            .unwrap();

        a.publish(Bytes::from_static(b"{\"hello\":1}")).await.unwrap();

        // a hears itself
        assert_eq!(
            a.next().await.unwrap().unwrap(),
            Bytes::from_static(b"{\"hello\":1}")
        );
        // b hears a over the wire
        let received = tokio::time::timeout(Duration::from_secs(5), b.next())
            .await
            .expect("frame did not arrive")
            .unwrap()
            .unwrap();
        assert_eq!(received, Bytes::from_static(b"{\"hello\":1}"));
    }

    #[tokio::test]
    async fn test_unterminated_oversized_frame_drops_peer() {
        use tokio::io::AsyncReadExt;

        let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(());
        let node = TcpTransport::bind("127.0.0.1:0".parse().unwrap(), vec![], shutdown_rx)
            .await
            .unwrap();

        let mut peer = TcpStream::connect(node.local_addr()).await.unwrap();
        // the write may fail part way once the node hangs up
        let _ = peer.write_all(&vec![b'a'; MAX_FRAME_LEN + 1]).await;

        let mut buf = [0u8; 16];
        let read = tokio::time::timeout(Duration::from_secs(5), peer.read(&mut buf))
            .await
            .expect("connection was left open");
        assert!(matches!(read, Ok(0) | Err(_)));

        assert!(
            tokio::time::timeout(Duration::from_millis(200), node.next())
                .await
                .is_err(),
            "oversized frame was delivered"
        );
    }
}
