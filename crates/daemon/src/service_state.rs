use std::net::SocketAddr;
use std::sync::Arc;

use common::bus::{Bus, TcpTransport, TransportError};
use common::cas::{CasClient, CasError, HttpCasClient};
use common::ledger::MemoryLedger;
use tokio::sync::watch;
use url::Url;

use crate::ledger_store::{LedgerStore, LedgerStoreError};
use crate::ServiceConfig;

/// Everything the running node shares between its tasks
#[derive(Clone, Debug)]
pub struct State {
    bus: Bus<MemoryLedger>,
    cas: Arc<dyn CasClient>,
    ledger_store: Option<LedgerStore>,
    gossip_addr: SocketAddr,
}

impl State {
    /// Load the ledger, open the gossip mesh and connect the storage client
    ///
    /// Transport background tasks stop when `shutdown_rx` fires.
    pub async fn from_config(
        config: &ServiceConfig,
        shutdown_rx: watch::Receiver<()>,
    ) -> Result<Self, StateSetupError> {
        let ledger_store = config.ledger_path.clone().map(LedgerStore::new);
        let ledger = match &ledger_store {
            Some(store) => store.load().await?,
            None => MemoryLedger::with_all_buckets(),
        };

        let transport = TcpTransport::bind(
            config.gossip_listen_addr,
            config.gossip_peers.clone(),
            shutdown_rx,
        )
        .await?;
        let gossip_addr = transport.local_addr();

        let api_url = Url::parse(&config.cas_api_url())?;
        let cas = HttpCasClient::new(&api_url)?;

        let bus = Bus::new(ledger, Arc::new(transport), config.node_secret.clone());
        tracing::info!(
            node = %bus.node(),
            %gossip_addr,
            cas_api = %api_url,
            "service state ready"
        );

        Ok(Self {
            bus,
            cas: Arc::new(cas),
            ledger_store,
            gossip_addr,
        })
    }

    pub fn bus(&self) -> &Bus<MemoryLedger> {
        &self.bus
    }

    pub fn cas(&self) -> &Arc<dyn CasClient> {
        &self.cas
    }

    pub fn ledger_store(&self) -> Option<&LedgerStore> {
        self.ledger_store.as_ref()
    }

    pub fn gossip_addr(&self) -> SocketAddr {
        self.gossip_addr
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StateSetupError {
    #[error("failed to load ledger: {0}")]
    Ledger(#[from] LedgerStoreError),

    #[error("failed to open gossip transport: {0}")]
    Transport(#[from] TransportError),

    #[error("invalid storage API url: {0}")]
    Url(#[from] url::ParseError),

    #[error("failed to set up storage client: {0}")]
    Cas(#[from] CasError),
}
