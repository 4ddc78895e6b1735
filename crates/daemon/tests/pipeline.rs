//! End-to-end pipeline tests on an in-process gossip mesh
//!
//! Nodes share one `MockCas`, standing in for the storage network every
//! node can fetch from.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::bus::{GossipTransport, MemoryNetwork, MemoryTransport};
use common::cas::CasClient;
use common::ledger::{Bucket, ContentKey, Envelope, TrustLedger};
use common::testkit::{eventually, MockCas, TestNode};
use tempfile::TempDir;
use tokio::task::JoinHandle;

use vouch_daemon::pipeline::{dismiss_window, Pipeline, PipelineConfig, UPLOAD_INFO_FILE};

const WAIT: Duration = Duration::from_secs(5);

struct Node {
    node: TestNode,
    watch_dir: TempDir,
    _staging_dir: TempDir,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    fn spawn(network: &MemoryNetwork, cas: Arc<MockCas>) -> Self {
        let node = TestNode::spawn(network);
        let watch_dir = tempfile::tempdir().unwrap();
        let staging_dir = tempfile::tempdir().unwrap();

        let pipeline = Pipeline::new(
            node.bus.clone(),
            cas as Arc<dyn CasClient>,
            PipelineConfig {
                watch_dir: watch_dir.path().to_path_buf(),
                staging_dir: staging_dir.path().to_path_buf(),
                poll_interval: Duration::from_millis(50),
                probe_timeout: Duration::from_secs(1),
                pin_timeout: Duration::from_secs(1),
                cache_capacity: 1_000,
                cache_ttl: Duration::from_secs(3600),
            },
        );
        let tasks = pipeline.spawn(node.shutdown_rx());

        Self {
            node,
            watch_dir,
            _staging_dir: staging_dir,
            tasks,
        }
    }

    fn drop_file(&self, name: &str, data: &[u8]) {
        std::fs::write(self.watch_dir.path().join(name), data).unwrap();
    }

    async fn active(&self, bucket: Bucket) -> Vec<ContentKey> {
        self.node
            .bus
            .ledger()
            .active_entries(bucket, Utc::now())
            .await
            .unwrap()
            .into_iter()
            .map(|entry| entry.key)
            .collect()
    }

    async fn shutdown(self) {
        self.node.shutdown().await;
        for task in self.tasks {
            let _ = tokio::time::timeout(WAIT, task).await;
        }
    }
}

/// Every envelope seen on the wire so far, waiting `quiet` for stragglers
async fn drain(wire: &MemoryTransport, quiet: Duration) -> Vec<Envelope> {
    let mut envelopes = Vec::new();
    while let Ok(Ok(Some(frame))) = tokio::time::timeout(quiet, wire.next()).await {
        envelopes.push(serde_json::from_slice(&frame).unwrap());
    }
    envelopes
}

async fn wait_for_one(node: &Node, bucket: Bucket) -> ContentKey {
    eventually(WAIT, || async move { Ok(node.active(bucket).await.len() == 1) })
        .await
        .unwrap_or_else(|e| panic!("{} never filled: {}", bucket, e));
    node.active(bucket).await.remove(0)
}

#[tokio::test]
async fn test_new_file_reaches_safe() {
    let network = MemoryNetwork::new();
    let cas = Arc::new(MockCas::new());
    let node = Node::spawn(&network, cas.clone());

    node.drop_file("hello.txt", b"hello world");

    let key = wait_for_one(&node, Bucket::Safe).await;
    assert_eq!(node.active(Bucket::Files).await, vec![key.clone()]);
    assert_eq!(node.active(Bucket::Verified).await, vec![key.clone()]);
    assert_eq!(cas.pinned(), vec![key.clone()]);

    // the imported tree carries the file and its side-car
    let links = cas.ls(&key, Duration::from_secs(1)).await.unwrap();
    let mut names: Vec<_> = links.iter().map(|link| link.name.as_str()).collect();
    names.sort();
    assert_eq!(names, vec!["hello.txt", UPLOAD_INFO_FILE]);

    let safe = node
        .node
        .bus
        .ledger()
        .entry(Bucket::Safe, &key)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        safe.provenance.map(|p| p.origin),
        Some(node.node.bus.node())
    );

    node.shutdown().await;
}

#[tokio::test]
async fn test_file_is_imported_once() {
    let network = MemoryNetwork::new();
    let cas = Arc::new(MockCas::new());
    let node = Node::spawn(&network, cas.clone());

    node.drop_file("once.txt", b"only once");
    wait_for_one(&node, Bucket::Safe).await;

    // several more poll rounds
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(cas.add_calls(), 1);
    assert_eq!(cas.pin_calls(), 1);

    node.shutdown().await;
}

#[tokio::test]
async fn test_every_node_verifies_and_pins_once() {
    let network = MemoryNetwork::new();
    let cas = Arc::new(MockCas::new());
    let a = Node::spawn(&network, cas.clone());
    let b = Node::spawn(&network, cas.clone());
    let c = Node::spawn(&network, cas.clone());

    a.drop_file("shared.bin", &[7u8; 4096]);

    let key = wait_for_one(&a, Bucket::Safe).await;
    for node in [&b, &c] {
        assert_eq!(wait_for_one(node, Bucket::Safe).await, key);
    }

    // three verifiers each propose `verified`, so every pinner sees the key
    // three times but pins it once
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(cas.pin_calls(), 3);
    assert_eq!(cas.add_calls(), 1);

    for node in [a, b, c] {
        node.shutdown().await;
    }
}

#[tokio::test]
async fn test_unreachable_key_is_dismissed_not_verified() {
    let network = MemoryNetwork::new();
    let cas = Arc::new(MockCas::new());
    let node = Node::spawn(&network, cas.clone());
    let announcer = TestNode::spawn(&network);
    let wire = network.join();

    let ghost = ContentKey::new("QmGhostOfAFileNobodyHas");
    announcer
        .bus
        .propose(
            Bucket::Files,
            ghost.clone(),
            vouch_daemon::pipeline::files_window(Utc::now()),
            true,
        )
        .await
        .unwrap();

    let ledger = node.node.bus.ledger().clone();
    eventually(WAIT, || {
        let ledger = ledger.clone();
        let ghost = ghost.clone();
        async move {
            let snapshot = ledger.snapshot().await?;
            Ok(snapshot
                .bucket(Bucket::Files)
                .map(|b| b.retractions.iter().any(|r| r.key == ghost))
                .unwrap_or(false))
        }
    })
    .await
    .unwrap();

    let snapshot = ledger.snapshot().await.unwrap();
    let files = snapshot.bucket(Bucket::Files).unwrap();
    let retraction = files.retractions.iter().find(|r| r.key == ghost).unwrap();
    assert_eq!(
        retraction.interval.duration(),
        dismiss_window(Utc::now()).duration()
    );
    assert!(!ledger.is_active(Bucket::Files, &ghost, Utc::now()).await.unwrap());
    assert!(node.active(Bucket::Verified).await.is_empty());
    assert_eq!(cas.pin_calls(), 0);

    // exactly one retraction went out, and nothing reached `verified`
    tokio::time::sleep(Duration::from_millis(300)).await;
    let envelopes = drain(&wire, Duration::from_millis(100)).await;
    let dismissals = envelopes
        .iter()
        .filter(|e| e.message.bucket() == Bucket::Files && !e.message.is_propose())
        .filter(|e| e.contents() == &ghost)
        .count();
    assert_eq!(dismissals, 1);
    assert!(envelopes
        .iter()
        .all(|e| e.message.bucket() != Bucket::Verified));

    announcer.shutdown().await;
    node.shutdown().await;
}

#[tokio::test]
async fn test_pin_failure_leaves_key_verified_but_not_safe() {
    let network = MemoryNetwork::new();
    let cas = Arc::new(MockCas::new());
    cas.set_fail_pins(true);
    let node = Node::spawn(&network, cas.clone());

    node.drop_file("fragile.txt", b"will not pin");
    let key = wait_for_one(&node, Bucket::Verified).await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(node.active(Bucket::Safe).await.is_empty());
    // a failed pin is not a reason to retract the key
    assert_eq!(node.active(Bucket::Files).await, vec![key]);

    node.shutdown().await;
}

#[tokio::test]
async fn test_cache_directories_are_ignored() {
    let network = MemoryNetwork::new();
    let cas = Arc::new(MockCas::new());
    let node = Node::spawn(&network, cas.clone());

    let cache = node.watch_dir.path().join("cache");
    std::fs::create_dir_all(&cache).unwrap();
    std::fs::write(Path::new(&cache).join("scratch.tmp"), b"ignored").unwrap();
    node.drop_file("kept.txt", b"kept");

    wait_for_one(&node, Bucket::Safe).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(cas.add_calls(), 1);

    node.shutdown().await;
}
