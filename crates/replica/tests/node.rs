//! End-to-end sessions between two nodes.

use std::sync::Arc;
use std::time::Duration;

use replica::core::{AuthError, Keypair};
use replica::store::{BackendKind, RepoId, Repository, WriteMode};
use replica::sync::{ContentId, ProtocolError, SyncError};
use replica::{Node, NodeConfig, NodeError};
use replica_testkit::init_tracing;
use tempfile::TempDir;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;

async fn node(dir: &TempDir, backend: BackendKind, seed: u8) -> Node {
    let mut config = NodeConfig::new(dir.path());
    config.storage.backend = backend;
    config.sync.chunk_size = 4096;
    Node::open(Keypair::from_seed(&[seed; 32]), config).await.unwrap()
}

async fn put(repo: &Repository, name: &str, data: &[u8]) {
    let mut writer = repo.open_write(name, WriteMode::Truncate).await.unwrap();
    writer.write(data).await.unwrap();
    writer.commit().await.unwrap();
}

async fn read(repo: &Repository, name: &str) -> Vec<u8> {
    let mut reader = repo.open_read(name).await.unwrap();
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).await.unwrap();
    buf
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[tokio::test]
async fn test_session_over_duplex() {
    init_tracing();
    let (dir_a, dir_b) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let alice = node(&dir_a, BackendKind::Filesystem, 1).await;
    let bob = node(&dir_b, BackendKind::Log, 2).await;

    let (_, source) = alice.pool().create(None).await.unwrap();
    put(&source, "1", &payload(50_000)).await;
    put(&source, "2", b"small").await;
    let (_, target) = bob.pool().create(None).await.unwrap();

    let ids = vec![ContentId::from(1u64), ContentId::from(2u64)];
    let (a, b) = tokio::io::duplex(16 * 1024);
    let (sent, received) = tokio::join!(
        alice.connect(a, bob.public_key(), Arc::clone(&source), ids),
        bob.accept(b, Arc::clone(&target), Vec::new()),
    );
    let sent = sent.unwrap();
    let received = received.unwrap();

    assert!(sent.authenticated && received.authenticated);
    assert!(sent.frames.finished && received.frames.finished);
    assert_eq!(received.peer, Some(alice.public_key()));
    assert_eq!(sent.transfer.items_sent, 2);
    assert_eq!(received.transfer.items_received, 2);
    assert_eq!(received.transfer.bytes_received, 50_005);

    assert_eq!(read(&target, "1").await, payload(50_000));
    assert_eq!(read(&target, "2").await, b"small");

    assert!(alice.sessions().is_empty());
    assert!(bob.sessions().is_empty());
}

#[tokio::test]
async fn test_accepting_side_also_sends() {
    init_tracing();
    let (dir_a, dir_b) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let alice = node(&dir_a, BackendKind::Log, 1).await;
    let bob = node(&dir_b, BackendKind::Filesystem, 2).await;

    let (_, alice_repo) = alice.pool().create(None).await.unwrap();
    put(&alice_repo, "a", &payload(30_000)).await;
    let (_, bob_repo) = bob.pool().create(None).await.unwrap();
    put(&bob_repo, "b", &payload(20_000)).await;

    let (a, b) = tokio::io::duplex(4096);
    let (sent, received) = tokio::join!(
        alice.connect(a, bob.public_key(), Arc::clone(&alice_repo), vec![ContentId::from("a")]),
        bob.accept(b, Arc::clone(&bob_repo), vec![ContentId::from("b")]),
    );
    let sent = sent.unwrap();
    let received = received.unwrap();

    assert!(sent.frames.finished && received.frames.finished);
    assert_eq!(sent.transfer.items_sent, 1);
    assert_eq!(sent.transfer.items_received, 1);
    assert_eq!(received.transfer.items_sent, 1);
    assert_eq!(received.transfer.items_received, 1);

    assert_eq!(read(&bob_repo, "a").await, payload(30_000));
    assert_eq!(read(&alice_repo, "b").await, payload(20_000));
}

#[tokio::test]
async fn test_wrong_peer_key() {
    init_tracing();
    let (dir_a, dir_b) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let alice = node(&dir_a, BackendKind::Filesystem, 1).await;
    let bob = node(&dir_b, BackendKind::Filesystem, 2).await;
    let stranger = Keypair::from_seed(&[3; 32]).box_public_key();

    let (_, source) = alice.pool().create(None).await.unwrap();
    let (_, target) = bob.pool().create(None).await.unwrap();

    let (a, b) = tokio::io::duplex(4096);
    let (sent, received) = tokio::join!(
        alice.connect(a, stranger, source, Vec::new()),
        bob.accept(b, target, Vec::new()),
    );

    assert!(matches!(
        received,
        Err(NodeError::Protocol(ProtocolError::Auth(AuthError::DecryptionFailed)))
    ));
    let sent = sent.unwrap();
    assert!(!sent.authenticated);
    assert!(!sent.frames.finished);
    assert!(bob.sessions().is_empty());
}

#[tokio::test]
async fn test_missing_item_aborts_sender() {
    let (dir_a, dir_b) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let alice = node(&dir_a, BackendKind::Filesystem, 1).await;
    let bob = node(&dir_b, BackendKind::Filesystem, 2).await;

    let (_, source) = alice.pool().create(None).await.unwrap();
    let (_, target) = bob.pool().create(None).await.unwrap();

    let (a, b) = tokio::io::duplex(4096);
    let (sent, _) = tokio::join!(
        alice.connect(a, bob.public_key(), source, vec![ContentId::from("absent")]),
        bob.accept(b, target, Vec::new()),
    );

    assert!(matches!(
        sent,
        Err(NodeError::Protocol(ProtocolError::Sync(SyncError::OpenRead { ref id, .. }))) if id == "absent"
    ));
    assert!(alice.sessions().is_empty());
}

#[tokio::test]
async fn test_sync_over_tcp() {
    init_tracing();
    let (dir_a, dir_b) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let alice = node(&dir_a, BackendKind::Log, 1).await;
    let bob = Arc::new(node(&dir_b, BackendKind::Filesystem, 2).await);

    let (source_id, source) = alice.pool().create(None).await.unwrap();
    put(&source, "7", &payload(9_000)).await;
    let (target_id, _) = bob.pool().create(None).await.unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(Arc::clone(&bob).serve(listener, target_id));

    let report = alice
        .sync_to(addr, bob.public_key(), source_id, vec![ContentId::from(7u64)])
        .await
        .unwrap();
    assert!(report.authenticated);
    assert_eq!(report.id.peer_addr, Some(addr));
    assert_eq!(report.transfer.items_sent, 1);

    // The responder may still be draining when the initiator finishes.
    let target = bob.pool().get(&target_id).await.unwrap().unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while !bob.sessions().is_empty() || target.stat("7").await.is_err() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(read(&target, "7").await, payload(9_000));

    server.abort();
}

#[tokio::test]
async fn test_sync_to_unknown_repository() {
    let dir = TempDir::new().unwrap();
    let alice = node(&dir, BackendKind::Filesystem, 1).await;
    let unknown: RepoId = "0123456789abcdef0123456789abcdef".parse().unwrap();

    let result = alice
        .sync_to("127.0.0.1:1", alice.public_key(), unknown, Vec::new())
        .await;
    assert!(matches!(
        result,
        Err(NodeError::Store(replica::store::StoreError::RepositoryNotFound(_)))
    ));
}

#[tokio::test]
async fn test_pool_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let id = {
        let alice = node(&dir, BackendKind::Log, 1).await;
        let (id, repo) = alice.pool().create(None).await.unwrap();
        put(&repo, "kept", b"across restarts").await;
        id
    };

    let alice = node(&dir, BackendKind::Log, 1).await;
    let repo = alice.pool().get(&id).await.unwrap().unwrap();
    assert_eq!(read(&repo, "kept").await, b"across restarts");
}
