use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::bus::{Bus, Mailbox};
use common::cache::KeyCache;
use common::cas::CasClient;
use common::ledger::{Bucket, ContentKey, Envelope, TrustLedger};
use tokio::sync::watch;

use super::safe_window;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PinOutcome {
    Pinned,
    Failed(String),
}

/// Pins verified content locally and vouches for it in `safe`
pub struct Pinner<L: TrustLedger> {
    bus: Bus<L>,
    cas: Arc<dyn CasClient>,
    mailbox: Mailbox,
    done: KeyCache<ContentKey>,
    pin_timeout: Duration,
}

impl<L: TrustLedger> Pinner<L> {
    pub fn new(
        bus: Bus<L>,
        cas: Arc<dyn CasClient>,
        done: KeyCache<ContentKey>,
        pin_timeout: Duration,
    ) -> Self {
        let mailbox = bus.subscribe(Bucket::Verified);
        Self {
            bus,
            cas,
            mailbox,
            done,
            pin_timeout,
        }
    }

    pub async fn run(&self, mut shutdown_rx: watch::Receiver<()>) {
        tracing::info!("pinner started");
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                envelope = self.mailbox.next_for_me() => match envelope {
                    Some(envelope) => {
                        self.handle(&envelope).await;
                    }
                    None => break,
                }
            }
        }
        tracing::info!("pinner stopped");
    }

    /// Pin one verified key, at most once per cache window
    pub async fn handle(&self, envelope: &Envelope) -> Option<PinOutcome> {
        if !envelope.message.is_propose() {
            return None;
        }
        let key = envelope.contents();
        if !self.done.insert(key.clone()) {
            tracing::debug!(%key, "already pinned, ignoring duplicate");
            return None;
        }

        tracing::info!(%key, "pinning");
        let outcome = match self.cas.pin(key, true, self.pin_timeout).await {
            Ok(()) => match self
                .bus
                .propose(Bucket::Safe, key.clone(), safe_window(Utc::now()), true)
                .await
            {
                Ok(_) => {
                    tracing::info!(%key, "content pinned and marked safe");
                    PinOutcome::Pinned
                }
                Err(e) => PinOutcome::Failed(format!("failed to propose safe key: {}", e)),
            },
            Err(e) => PinOutcome::Failed(e.to_string()),
        };

        if let PinOutcome::Failed(reason) = &outcome {
            // not dismissed: another node may still manage to pin it
            tracing::warn!(%key, %reason, "pin failed");
            self.done.remove(key);
        }
        Some(outcome)
    }
}
