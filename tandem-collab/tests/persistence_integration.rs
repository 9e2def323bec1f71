//! Persistence integration tests.
//!
//! Verifies:
//! - A room's op-log is saved when its last editor leaves
//! - A reopened room, or another relay on the same store, serves the saved document
//! - Clients seed from and save to their own snapshot store
//! - Flattened-text snapshots are accepted as seeds

use std::sync::Arc;

use tandem_collab::binding::BufferWidget;
use tandem_collab::client::SyncClient;
use tandem_collab::config::ClientConfig;
use tandem_collab::relay::{Relay, RelayConfig};
use tandem_collab::session::SessionState;
use tandem_collab::storage::{MemoryStore, SnapshotStore};
use tandem_core::{Replica, ReplicaId};
use tokio::time::{timeout, Duration};
use uuid::Uuid;

// ─── Helpers ─────────────────────────────────────────────────────────────────

async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a relay backed by `store`, return it with its base URL.
async fn start_relay_with_store(store: Arc<dyn SnapshotStore>) -> (Relay, String) {
    let port = free_port().await;
    let relay = Relay::with_store(
        RelayConfig::for_testing(format!("127.0.0.1:{port}")),
        store,
    );
    let server = relay.clone();
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    (relay, format!("ws://127.0.0.1:{port}"))
}

async fn drive_until<F>(client: &mut SyncClient, done: F) -> bool
where
    F: Fn(&SyncClient) -> bool,
{
    timeout(Duration::from_secs(5), async {
        while !done(&*client) {
            if client.next_event().await.is_none() {
                return done(&*client);
            }
        }
        true
    })
    .await
    .unwrap_or(false)
}

async fn synced(mut client: SyncClient) -> SyncClient {
    client.connect();
    assert!(drive_until(&mut client, |c| c.state() == SessionState::Synced).await);
    client
}

fn client(url: &str, doc: &str) -> SyncClient {
    SyncClient::new(ClientConfig::for_testing(url, doc), BufferWidget::default())
}

/// Type `text` into a fresh client, then leave and wait for the room to close.
async fn write_and_leave(relay: &Relay, url: &str, doc: &str, text: &str) {
    let mut writer = synced(client(url, doc)).await;
    writer.type_text(0, 0, text).unwrap();

    let mut merged = false;
    for _ in 0..200 {
        if relay.document_text(doc).await.as_deref() == Some(text) {
            merged = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(merged, "relay should hold the text before the writer leaves");

    drop(writer.close());
    wait_for_room_close(relay).await;
}

async fn wait_for_room_close(relay: &Relay) {
    for _ in 0..200 {
        if relay.room_count().await == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("room did not close");
}

// ─── Relay-side persistence ──────────────────────────────────────────────────

#[tokio::test]
async fn test_room_snapshot_saved_on_last_leave() {
    let store = Arc::new(MemoryStore::new());
    let (relay, url) = start_relay_with_store(store.clone()).await;
    let doc = Uuid::new_v4().to_string();

    write_and_leave(&relay, &url, &doc, "persist me").await;

    let bytes = store.load_snapshot(&doc).unwrap().expect("snapshot saved");
    let saved = Replica::load(ReplicaId::random(), &bytes).unwrap();
    assert_eq!(saved.snapshot(), "persist me");
    assert_eq!(relay.stats().await.persisted_snapshots, 1);
}

#[tokio::test]
async fn test_reopened_room_serves_saved_document() {
    let store = Arc::new(MemoryStore::new());
    let (relay, url) = start_relay_with_store(store.clone()).await;
    let doc = Uuid::new_v4().to_string();

    write_and_leave(&relay, &url, &doc, "still here").await;

    let reader = synced(client(&url, &doc)).await;
    assert_eq!(reader.text(), "still here");
}

#[tokio::test]
async fn test_saved_document_keeps_history_for_merges() {
    let store = Arc::new(MemoryStore::new());
    let (relay, url) = start_relay_with_store(store.clone()).await;
    let doc = Uuid::new_v4().to_string();

    write_and_leave(&relay, &url, &doc, "base").await;

    // Both clients edit the reloaded document; ids from the saved op-log
    // must still resolve as anchors.
    let mut alice = synced(client(&url, &doc)).await;
    let mut bob = synced(client(&url, &doc)).await;
    alice.type_text(0, 0, ">").unwrap();
    bob.type_text(4, 0, "<").unwrap();

    assert!(drive_until(&mut alice, |c| c.text() == ">base<").await);
    assert!(drive_until(&mut bob, |c| c.text() == ">base<").await);
}

#[tokio::test]
async fn test_flat_text_snapshot_seeds_room() {
    let store = Arc::new(MemoryStore::new());
    let doc = Uuid::new_v4().to_string();
    store
        .save_snapshot(&doc, "imported from elsewhere".as_bytes())
        .unwrap();

    let (_relay, url) = start_relay_with_store(store.clone()).await;
    let reader = synced(client(&url, &doc)).await;
    assert_eq!(reader.text(), "imported from elsewhere");
}

#[tokio::test]
async fn test_multi_document_isolation() {
    let store = Arc::new(MemoryStore::new());
    let (relay, url) = start_relay_with_store(store.clone()).await;
    let docs: Vec<String> = (0..3).map(|_| Uuid::new_v4().to_string()).collect();

    for (i, doc) in docs.iter().enumerate() {
        write_and_leave(&relay, &url, doc, &format!("document {i}")).await;
    }
    assert_eq!(store.len(), 3);

    for (i, doc) in docs.iter().enumerate() {
        let bytes = store.load_snapshot(doc).unwrap().unwrap();
        let saved = Replica::load(ReplicaId::random(), &bytes).unwrap();
        assert_eq!(saved.snapshot(), format!("document {i}"));
    }
}

#[cfg(feature = "rocksdb")]
#[tokio::test]
async fn test_rocks_store_serves_second_relay() {
    use tandem_collab::storage::{RocksStore, StoreConfig};
    use tempfile::tempdir;

    let dir = tempdir().unwrap();
    let doc = Uuid::new_v4().to_string();
    let store = Arc::new(RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap());

    let (first, url) = start_relay_with_store(store.clone()).await;
    write_and_leave(&first, &url, &doc, "on disk").await;
    let meta = store.load_metadata(&doc).unwrap().unwrap();
    assert_eq!(meta.version, 1);
    assert_eq!(store.list_documents().unwrap(), vec![doc.clone()]);

    // A second relay sharing the database sees the document.
    let (_second, url) = start_relay_with_store(store).await;
    let reader = synced(client(&url, &doc)).await;
    assert_eq!(reader.text(), "on disk");
}

// ─── Client-side persistence ─────────────────────────────────────────────────

#[tokio::test]
async fn test_client_snapshot_roundtrip() {
    let store = Arc::new(MemoryStore::new());
    let config = ClientConfig::for_testing("ws://127.0.0.1:1", "notes");

    let mut first = SyncClient::open(config.clone(), store.clone(), BufferWidget::default()).unwrap();
    first.type_text(0, 0, "draft one").unwrap();
    first.save_snapshot().unwrap();
    drop(first.close());

    let second = SyncClient::open(config, store, BufferWidget::default()).unwrap();
    assert_eq!(second.text(), "draft one");
}

#[tokio::test]
async fn test_client_periodic_snapshot() {
    let store = Arc::new(MemoryStore::new());
    let relay_store = Arc::new(MemoryStore::new());
    let (_relay, url) = start_relay_with_store(relay_store).await;
    let doc = Uuid::new_v4().to_string();

    let mut config = ClientConfig::for_testing(url.as_str(), doc.as_str());
    config.snapshot_interval = Some(Duration::from_millis(50));
    let mut client = SyncClient::open(config, store.clone(), BufferWidget::default()).unwrap();
    client.connect();
    client.type_text(0, 0, "autosaved").unwrap();

    // Saves are silent, so pump the session for a few intervals.
    let still_open = timeout(Duration::from_millis(300), async {
        while client.next_event().await.is_some() {}
    })
    .await;
    assert!(still_open.is_err());

    let bytes = store.load_snapshot(&doc).unwrap().expect("autosave written");
    let saved = Replica::load(ReplicaId::random(), &bytes).unwrap();
    assert_eq!(saved.snapshot(), "autosaved");
}

#[tokio::test]
async fn test_stored_client_pushes_document_to_relay() {
    let client_store = Arc::new(MemoryStore::new());
    let doc = Uuid::new_v4().to_string();
    let mut seed = Replica::random();
    seed.insert(0, "from local disk").unwrap();
    client_store
        .save_snapshot(&doc, &seed.encode_state().unwrap())
        .unwrap();

    let (relay, url) = start_relay_with_store(Arc::new(MemoryStore::new())).await;
    let opened = SyncClient::open(
        ClientConfig::for_testing(url.as_str(), doc.as_str()),
        client_store,
        BufferWidget::default(),
    )
    .unwrap();
    let _alice = synced(opened).await;

    let mut arrived = false;
    for _ in 0..200 {
        if relay.document_text(&doc).await.as_deref() == Some("from local disk") {
            arrived = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(arrived);

    let bob = synced(client(&url, &doc)).await;
    assert_eq!(bob.text(), "from local disk");
}
