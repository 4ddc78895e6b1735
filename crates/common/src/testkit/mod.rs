/// Lightweight harness for pipeline integration tests
///
/// Provides an in-memory stand-in for the storage daemon and a way to run
/// several nodes against one in-process gossip network, without requiring
/// external infrastructure.
///
/// # Example
///
/// ```rust,ignore
/// use common::bus::MemoryNetwork;
/// use common::testkit::{eventually, TestNode};
///
/// #[tokio::test]
/// async fn test_gossip() -> anyhow::Result<()> {
///     let network = MemoryNetwork::new();
///     let alice = TestNode::spawn(&network);
///     let bob = TestNode::spawn(&network);
///
///     let key = alice.cas.insert_file(b"data");
///     alice.bus.propose(Bucket::Files, key.clone(), interval, true).await?;
///
///     eventually(Duration::from_secs(2), || bob.is_active(Bucket::Files, &key)).await?;
///
///     alice.shutdown().await;
///     bob.shutdown().await;
///     Ok(())
/// }
/// ```
mod cas;
mod node;

pub use cas::MockCas;
pub use node::{eventually, TestNode};
