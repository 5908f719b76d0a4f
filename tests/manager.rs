//! Tests for the stream manager: double-checked creation, active-session
//! lookup, and eviction rules.

use std::sync::Arc;
use std::time::Duration;

use derecho::persist::store::MemoryDocumentStore;
use derecho::persist::{MessageWriter, PersistOptions};
use derecho::stream::manager::StreamManager;

fn manager() -> Arc<StreamManager> {
    let writer = MessageWriter::new(
        Arc::new(MemoryDocumentStore::new()),
        PersistOptions {
            workers: 1,
            buffer: 8,
            op_timeout: Duration::from_secs(5),
            strict_encryption: false,
        },
    );
    StreamManager::new(writer)
}

#[tokio::test]
async fn get_or_create_returns_the_same_session_once() {
    let manager = manager();
    let (first, created) = manager.get_or_create("c1", "m1").await;
    assert!(created);
    let (second, created) = manager.get_or_create("c1", "m1").await;
    assert!(!created);
    assert!(Arc::ptr_eq(&first, &second));

    // a different message id is a different generation
    let (third, created) = manager.get_or_create("c1", "m2").await;
    assert!(created);
    assert!(!Arc::ptr_eq(&first, &third));
}

#[tokio::test]
async fn get_returns_only_known_sessions() {
    let manager = manager();
    assert!(manager.get("c1", "m1").await.is_none());
    manager.get_or_create("c1", "m1").await;
    assert!(manager.get("c1", "m1").await.is_some());
}

#[tokio::test]
async fn active_lookup_skips_completed_sessions() {
    let manager = manager();
    let (session, _) = manager.get_or_create("c1", "m1").await;

    let active = manager.get_active_for_chat("c1").await.unwrap();
    assert_eq!(active.message_id, "m1");

    session.stop("u1", "user_cancelled").await.unwrap();
    assert!(manager.get_active_for_chat("c1").await.is_none());
}

#[tokio::test]
async fn cleanup_never_evicts_live_or_fresh_sessions() {
    let manager = manager();
    let (pending, _) = manager.get_or_create("c1", "m1").await;
    let (stopped, _) = manager.get_or_create("c1", "m2").await;
    stopped.stop("u1", "user_cancelled").await.unwrap();

    manager.cleanup_expired().await;

    // non-completed sessions are never evicted; completed ones live out
    // their TTL
    assert!(manager.get("c1", "m1").await.is_some());
    assert!(manager.get("c1", "m2").await.is_some());
    drop(pending);
}
