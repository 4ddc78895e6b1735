//! Message bus: how nodes tell each other what they believe
//!
//! A [`Bus`] signs and publishes ledger messages over a [`GossipTransport`],
//! and applies whatever arrives to the local [`TrustLedger`](crate::ledger::TrustLedger)
//! before handing it to the pipeline components subscribed to that bucket.

mod facade;
mod memory;
mod tcp;
mod transport;

pub use facade::{Bus, BusError, DeliveryError, Mailbox};
pub use memory::{MemoryNetwork, MemoryTransport};
pub use tcp::{TcpTransport, MAX_FRAME_LEN};
pub use transport::{GossipTransport, TransportError};
