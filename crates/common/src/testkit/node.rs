use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::cas::MockCas;
use crate::bus::{Bus, MemoryNetwork};
use crate::crypto::SecretKey;
use crate::ledger::{Bucket, ContentKey, MemoryLedger, TrustLedger};

/// One node on an in-process gossip network
///
/// Owns a running bus receive loop, a fresh identity, a ledger with every
/// bucket initialized and its own [`MockCas`].
pub struct TestNode {
    pub bus: Bus<MemoryLedger>,
    pub cas: Arc<MockCas>,
    shutdown_tx: watch::Sender<()>,
    shutdown_rx: watch::Receiver<()>,
    bus_task: JoinHandle<()>,
}

impl TestNode {
    /// Join `network` and start receiving
    pub fn spawn(network: &MemoryNetwork) -> Self {
        let bus = Bus::new(
            MemoryLedger::with_all_buckets(),
            Arc::new(network.join()),
            SecretKey::generate(),
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(());

        let bus_task = tokio::spawn({
            let bus = bus.clone();
            let shutdown_rx = shutdown_rx.clone();
            async move {
                if let Err(e) = bus.run(shutdown_rx).await {
                    tracing::error!(error = %e, "test node bus failed");
                }
            }
        });

        Self {
            bus,
            cas: Arc::new(MockCas::new()),
            shutdown_tx,
            shutdown_rx,
            bus_task,
        }
    }

    /// Cancellation token shared with this node's bus loop
    pub fn shutdown_rx(&self) -> watch::Receiver<()> {
        self.shutdown_rx.clone()
    }

    pub async fn is_active(&self, bucket: Bucket, key: &ContentKey) -> Result<bool> {
        self.bus
            .ledger()
            .is_active(bucket, key, Utc::now())
            .await
            .map_err(|e| anyhow::anyhow!("{}", e))
    }

    /// Signal shutdown and wait for the bus loop to exit
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.bus_task.await;
    }
}

/// Poll a condition until it succeeds or times out
///
/// # Arguments
/// * `timeout` - Maximum time to wait
/// * `condition` - Returns `Ok(true)` once the expected state is reached.
///   Errors are treated as "not yet".
pub async fn eventually<F, Fut>(timeout: Duration, condition: F) -> Result<()>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let start = std::time::Instant::now();
    let poll_interval = Duration::from_millis(20);

    loop {
        match condition().await {
            Ok(true) => {
                tracing::debug!("condition met after {:?}", start.elapsed());
                return Ok(());
            }
            Ok(false) => {}
            Err(e) => tracing::debug!("condition check error: {}", e),
        }

        if start.elapsed() > timeout {
            return Err(anyhow::anyhow!(
                "condition not met within timeout ({:?})",
                timeout
            ));
        }

        tokio::time::sleep(poll_interval).await;
    }
}
