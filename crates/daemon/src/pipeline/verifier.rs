use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::bus::{Bus, Mailbox};
use common::cache::KeyCache;
use common::cas::{CasClient, CasError, CasLink, LinkKind};
use common::ledger::{Bucket, ContentKey, Envelope, Interval, TrustLedger};
use tokio::sync::watch;

use super::{dismiss_window, UploadInfo, UPLOAD_INFO_FILE};

/// What the verifier decided about one proposed key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Content resolves and carries a readable side-car
    Verified(UploadInfo),
    /// The storage network cannot find the content
    Missing,
    /// The content exists but is not something the watcher produced
    Malformed(String),
    /// Our own storage daemon could not be asked; the key is left for later
    Unavailable(String),
    /// The key is no longer active in `files`
    Retracted,
}

/// Checks that keys announced in `files` resolve, and promotes them to `verified`
pub struct Verifier<L: TrustLedger> {
    bus: Bus<L>,
    cas: Arc<dyn CasClient>,
    mailbox: Mailbox,
    done: KeyCache<ContentKey>,
    probe_timeout: Duration,
}

impl<L: TrustLedger> Verifier<L> {
    pub fn new(
        bus: Bus<L>,
        cas: Arc<dyn CasClient>,
        done: KeyCache<ContentKey>,
        probe_timeout: Duration,
    ) -> Self {
        let mailbox = bus.subscribe(Bucket::Files);
        Self {
            bus,
            cas,
            mailbox,
            done,
            probe_timeout,
        }
    }

    pub async fn run(&self, mut shutdown_rx: watch::Receiver<()>) {
        tracing::info!("verifier started");
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
        tracing::info!("verifier stopped");
    }

    /// Process one delivery
    ///
    /// # Returns
    /// * `None` if the message was not a proposal or the key was already handled
    /// * the verdict otherwise, after acting on it
    pub async fn handle(&self, envelope: &Envelope) -> Option<Verdict> {
        if !envelope.message.is_propose() {
            return None;
        }
        let key = envelope.contents();
        if !self.done.insert(key.clone()) {
            tracing::debug!(%key, "already verified, ignoring duplicate");
            return None;
        }

        let verdict = match self
            .bus
            .ledger()
            .is_active(Bucket::Files, key, Utc::now())
            .await
        {
            Ok(false) => Verdict::Retracted,
            Ok(true) => self.probe(key).await,
            Err(e) => Verdict::Unavailable(format!("ledger lookup failed: {}", e)),
        };

        match &verdict {
            Verdict::Verified(info) => {
                tracing::info!(%key, filename = %info.filename, upload_node = %info.upload_node, "content verified");
                if let Err(e) = self
                    .bus
                    .propose(Bucket::Verified, key.clone(), Interval::unbounded(Utc::now()), true)
                    .await
                {
                    tracing::error!(%key, error = %e, "failed to propose verified key");
                    self.done.remove(key);
                }
            }
            Verdict::Missing | Verdict::Malformed(_) => {
                tracing::warn!(%key, ?verdict, "dismissing unusable content");
                if let Err(e) = self
                    .bus
                    .dismiss(Bucket::Files, key.clone(), dismiss_window(Utc::now()))
                    .await
                {
                    tracing::error!(%key, error = %e, "failed to dismiss key");
                }
            }
            Verdict::Unavailable(reason) => {
                tracing::warn!(%key, %reason, "could not verify, will retry on next delivery");
                self.done.remove(key);
            }
            Verdict::Retracted => {
                tracing::debug!(%key, "key no longer active in files, skipping");
            }
        }
        Some(verdict)
    }

    /// Resolve a key's listing and side-car without fetching the file itself
    async fn probe(&self, key: &ContentKey) -> Verdict {
        let links = match self.cas.ls(key, self.probe_timeout).await {
            Ok(links) => links,
            Err(CasError::NotFound(_)) | Err(CasError::PinTimeout(_)) => return Verdict::Missing,
            Err(CasError::Malformed(reason)) => return Verdict::Malformed(reason),
            Err(e) => return Verdict::Unavailable(e.to_string()),
        };
        if links.is_empty() {
            return Verdict::Malformed("no links".to_string());
        }

        let Some(side_car) = find_side_car(&links) else {
            return Verdict::Malformed(format!("no {}", UPLOAD_INFO_FILE));
        };
        let raw = match self.cas.get(&side_car.key, self.probe_timeout).await {
            Ok(raw) => raw,
            Err(CasError::NotFound(_)) => return Verdict::Missing,
            Err(CasError::Malformed(reason)) => return Verdict::Malformed(reason),
            Err(e) => return Verdict::Unavailable(e.to_string()),
        };

        let parsed = std::str::from_utf8(&raw)
            .map_err(|e| e.to_string())
            .and_then(|text| toml::from_str::<UploadInfo>(text).map_err(|e| e.to_string()));
        match parsed {
            Ok(info) => Verdict::Verified(info),
            Err(reason) => Verdict::Malformed(format!("unreadable {}: {}", UPLOAD_INFO_FILE, reason)),
        }
    }
}

fn find_side_car(links: &[CasLink]) -> Option<&CasLink> {
    links
        .iter()
        .find(|link| link.name == UPLOAD_INFO_FILE && link.kind != LinkKind::Directory)
}
