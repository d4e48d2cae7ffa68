//! Engine behavior when the store, the key source or the caller misbehaves.
//!
//! Every failure must leave the timeline as it was and surface either as an
//! error or as a notice on the view; nothing is retried behind the caller's
//! back.

use std::sync::Arc;
use std::time::Duration;
use tcmsg_core::config::TcmsgConfig;
use tcmsg_core::{Conversation, MessageId, MessageStatus, StoreError};
use tcmsg_crypto::{ConversationKey, KeyDerivationError, KeyDeriver};
use tcmsg_sync::{ConversationSync, LiveOutcome, MemoryStore, StoreOp, SyncError, SyncPhase};

fn config() -> TcmsgConfig {
    let mut config = TcmsgConfig::default();
    config.crypto.kdf_iterations = 1_000;
    config
}

fn pair() -> Conversation {
    Conversation::between("U1", "U2", None)
}

async fn open_with(store: &Arc<MemoryStore>, identity: &str, config: &TcmsgConfig) -> ConversationSync {
    let mut sync = ConversationSync::new(store.clone(), identity, config);
    sync.open(pair()).await.unwrap();
    sync
}

async fn open_as(store: &Arc<MemoryStore>, identity: &str) -> ConversationSync {
    open_with(store, identity, &config()).await
}

struct OfflineDeriver;

impl KeyDeriver for OfflineDeriver {
    fn derive(&self, _: &str, _: &str, _: Option<&str>) -> Result<ConversationKey, KeyDerivationError> {
        Err(KeyDerivationError::InvalidParams("key source offline".into()))
    }
}

// ── Opening ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn outsider_cannot_open() {
    let store = Arc::new(MemoryStore::new());
    let mut u3 = ConversationSync::new(store.clone(), "U3", &config());
    let err = u3.open(pair()).await.unwrap_err();
    assert!(matches!(err, SyncError::NotParticipant { ref identity, .. } if identity == "U3"));
    assert!(err.is_fatal());
    assert_eq!(u3.phase(), SyncPhase::Uninitialized);
    assert_eq!(store.subscriber_count(&pair().id), 0);
}

#[tokio::test]
async fn conversation_with_oneself_is_refused() {
    let store = Arc::new(MemoryStore::new());
    let mut u1 = ConversationSync::new(store.clone(), "U1", &config());
    let err = u1
        .open(Conversation::between("U1", "U1", None))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::SelfConversation { .. }));
    assert!(err.is_fatal());
    assert_eq!(u1.phase(), SyncPhase::Uninitialized);
    assert!(u1.conversation().is_none());

    let send = u1.send("note to self").await;
    assert!(matches!(send, Err(SyncError::EncryptionUnavailable { .. })));
    assert!(store.is_empty());
}

#[tokio::test]
async fn key_derivation_failure_blocks_the_conversation() {
    let store = Arc::new(MemoryStore::new());
    let mut u1 = ConversationSync::new(store.clone(), "U1", &config()).with_deriver(Arc::new(OfflineDeriver));

    match u1.open(pair()).await {
        Err(SyncError::EncryptionUnavailable { reason }) => assert!(reason.contains("offline")),
        other => panic!("expected EncryptionUnavailable, got {other:?}"),
    }
    assert_eq!(u1.phase(), SyncPhase::Uninitialized);
    assert!(matches!(u1.send("hi").await, Err(SyncError::EncryptionUnavailable { .. })));
    assert!(store.is_empty());
}

#[tokio::test]
async fn zero_iterations_is_a_key_failure() {
    let store = Arc::new(MemoryStore::new());
    let mut config = config();
    config.crypto.kdf_iterations = 0;
    let mut u1 = ConversationSync::new(store.clone(), "U1", &config);
    assert!(matches!(
        u1.open(pair()).await,
        Err(SyncError::EncryptionUnavailable { .. })
    ));
}

#[tokio::test]
async fn subscribe_failure_leaves_history_usable() {
    let store = Arc::new(MemoryStore::new());
    let mut u1 = open_as(&store, "U1").await;
    u1.send("still here").await.unwrap();

    store.fail_next(StoreOp::Subscribe, StoreError::Unavailable("feed down".into()));
    let mut u2 = open_as(&store, "U2").await;
    assert!(!u2.is_live_connected());
    let notice = u2.view().notice.unwrap();
    assert!(notice.contains("live updates unavailable"), "{notice}");

    let report = u2.load_history().await.unwrap();
    assert_eq!(report.fetched, 1);
    assert_eq!(u2.view().messages[0].plaintext(), Some("still here"));
    assert_eq!(u2.next_live().await, None);
    assert!(u2.drain_live().await.is_empty());
}

// ── Sending ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn send_without_open_conversation_persists_nothing() {
    let store = Arc::new(MemoryStore::new());
    let mut u1 = ConversationSync::new(store.clone(), "U1", &config());
    let err = u1.send("hello").await.unwrap_err();
    assert!(matches!(err, SyncError::EncryptionUnavailable { .. }));
    assert!(store.is_empty());

    // same after close
    let mut u1 = open_as(&store, "U1").await;
    u1.close();
    assert!(matches!(
        u1.send("hello").await,
        Err(SyncError::EncryptionUnavailable { .. })
    ));
    assert!(store.is_empty());
}

#[tokio::test]
async fn send_rejects_empty_and_oversized() {
    let store = Arc::new(MemoryStore::new());
    let mut config = config();
    config.sync.max_message_chars = 5;
    let mut u1 = open_with(&store, "U1", &config).await;

    assert!(matches!(u1.send(" \r\n\t ").await, Err(SyncError::EmptyMessage)));
    assert!(matches!(
        u1.send("toolong").await,
        Err(SyncError::MessageTooLong { chars: 7, max: 5 })
    ));
    assert!(store.is_empty());

    // sanitized before measuring
    let id = u1.send("  hi\u{200B}!\u{7} ").await.unwrap();
    assert_eq!(u1.view().messages[0].plaintext(), Some("hi!"));
    assert_eq!(u1.view().messages[0].id(), &id);
}

#[tokio::test]
async fn send_failure_leaves_timeline_untouched() {
    let store = Arc::new(MemoryStore::new());
    let mut u1 = open_as(&store, "U1").await;
    u1.send("first").await.unwrap();

    store.fail_next(StoreOp::Create, StoreError::Unavailable("write quorum lost".into()));
    let err = u1.send("second").await.unwrap_err();
    assert!(matches!(err, SyncError::Store(StoreError::Unavailable(_))));
    assert!(!err.is_fatal());

    let view = u1.view();
    assert_eq!(view.messages.len(), 1);
    assert!(!view.sending);
    assert!(view.notice.unwrap().contains("failed to send message"));
    assert_eq!(store.len(), 1);

    // the caller retries explicitly
    u1.send("second").await.unwrap();
    assert_eq!(u1.view().messages.len(), 2);
}

#[tokio::test]
async fn send_timeout_is_reported() {
    let store = Arc::new(MemoryStore::new());
    let mut config = config();
    config.sync.send_timeout_ms = 20;
    let mut u1 = open_with(&store, "U1", &config).await;

    store.set_delay(StoreOp::Create, Duration::from_millis(500));
    let err = u1.send("slow").await.unwrap_err();
    assert!(matches!(
        err,
        SyncError::Store(StoreError::Timeout { op: "create", timeout_ms: 20 })
    ));
    assert!(store.is_empty());
    assert!(!u1.view().sending);
    assert!(u1.view().messages.is_empty());
}

#[tokio::test]
async fn sending_flag_set_while_create_in_flight() {
    let store = Arc::new(MemoryStore::new());
    let mut u1 = open_as(&store, "U1").await;
    let mut rx = u1.subscribe_view();

    let watcher = tokio::spawn(async move {
        loop {
            rx.changed().await.ok()?;
            if rx.borrow_and_update().sending {
                return Some(true);
            }
        }
    });

    store.set_delay(StoreOp::Create, Duration::from_millis(100));
    u1.send("hi").await.unwrap();
    assert_eq!(watcher.await.unwrap(), Some(true));
    assert!(!u1.view().sending);
}

#[tokio::test]
async fn dropped_send_clears_sending_flag() {
    let store = Arc::new(MemoryStore::new());
    let mut u1 = open_as(&store, "U1").await;

    store.set_delay(StoreOp::Create, Duration::from_millis(500));
    let outer = tokio::time::timeout(Duration::from_millis(20), u1.send("hi")).await;
    assert!(outer.is_err(), "caller gave up before the store answered");
    assert!(!u1.view().sending);
    assert!(u1.view().messages.is_empty());

    // later publishes must not bring the flag back
    store.clear_delay(StoreOp::Create);
    u1.load_history().await.unwrap();
    assert!(!u1.view().sending);

    u1.send("again").await.unwrap();
    let view = u1.view();
    assert!(!view.sending);
    assert_eq!(view.messages.len(), 1);
    assert_eq!(store.len(), 1);
}

// ── History and read state ─────────────────────────────────────────────────

#[tokio::test]
async fn history_failure_keeps_live_messages() {
    let store = Arc::new(MemoryStore::new());
    let mut u1 = open_as(&store, "U1").await;
    let mut u2 = open_as(&store, "U2").await;
    u1.send("live one").await.unwrap();
    assert_eq!(u2.drain_live().await, vec![LiveOutcome::Inserted]);

    store.fail_next(StoreOp::Query, StoreError::Unavailable("replica lag".into()));
    let err = u2.load_history().await.unwrap_err();
    assert!(matches!(err, SyncError::Store(StoreError::Unavailable(_))));

    let view = u2.view();
    assert_eq!(view.phase, SyncPhase::Loading);
    assert_eq!(view.messages.len(), 1);
    assert!(view.notice.unwrap().contains("failed to load messages"));

    u2.load_history().await.unwrap();
    assert_eq!(u2.phase(), SyncPhase::Live);
    assert_eq!(u2.view().messages.len(), 1);
}

#[tokio::test]
async fn history_timeout_is_reported() {
    let store = Arc::new(MemoryStore::new());
    let mut config = config();
    config.sync.fetch_timeout_ms = 20;
    let mut u2 = open_with(&store, "U2", &config).await;

    store.set_delay(StoreOp::Query, Duration::from_millis(500));
    assert!(matches!(
        u2.load_history().await,
        Err(SyncError::Store(StoreError::Timeout {
            op: "query_by_conversation",
            ..
        }))
    ));

    store.clear_delay(StoreOp::Query);
    assert!(u2.load_history().await.is_ok());
}

#[tokio::test]
async fn load_before_open_fails() {
    let store = Arc::new(MemoryStore::new());
    let mut u2 = ConversationSync::new(store.clone(), "U2", &config());
    assert!(matches!(u2.load_history().await, Err(SyncError::NotOpen)));
    assert!(matches!(
        u2.mark_read(&MessageId::new("m1")).await,
        Err(SyncError::NotOpen)
    ));
}

#[tokio::test]
async fn mark_read_failures_are_counted_then_retried() {
    let store = Arc::new(MemoryStore::new());
    let mut u1 = open_as(&store, "U1").await;
    let id = u1.send("read me").await.unwrap();

    let mut u2 = open_as(&store, "U2").await;
    store.fail_next(StoreOp::UpdateStatus, StoreError::Unavailable("busy".into()));
    let report = u2.load_history().await.unwrap();
    assert_eq!(report.marked_read, 0);
    assert_eq!(report.mark_read_failures, 1);
    assert_eq!(store.get(&id).unwrap().status, MessageStatus::Sent);
    assert_eq!(u2.view().messages[0].record.status, MessageStatus::Sent);

    u2.mark_read(&id).await.unwrap();
    assert_eq!(store.get(&id).unwrap().status, MessageStatus::Read);
    assert_eq!(u2.view().messages[0].record.status, MessageStatus::Read);

    // already read: no store call, so an injected failure stays queued
    store.fail_next(StoreOp::UpdateStatus, StoreError::Unavailable("busy".into()));
    u2.mark_read(&id).await.unwrap();
}

#[tokio::test]
async fn mark_read_refuses_own_and_unknown_messages() {
    let store = Arc::new(MemoryStore::new());
    let mut u1 = open_as(&store, "U1").await;
    let id = u1.send("mine").await.unwrap();

    assert!(matches!(u1.mark_read(&id).await, Err(SyncError::NotRecipient(_))));
    assert_eq!(store.get(&id).unwrap().status, MessageStatus::Sent);

    let missing = MessageId::new("not-in-timeline");
    assert!(matches!(
        u1.mark_read(&missing).await,
        Err(SyncError::UnknownMessage(m)) if m == missing
    ));
}

#[tokio::test]
async fn store_rejects_status_update_from_sender() {
    use tcmsg_sync::ConversationStore;

    let store = Arc::new(MemoryStore::new());
    let mut u1 = open_as(&store, "U1").await;
    let id = u1.send("mine").await.unwrap();

    let err = store
        .update_status(&id, MessageStatus::Read, Some(1), "U1")
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Forbidden { .. }));
}

#[tokio::test]
async fn placeholder_text_comes_from_config() {
    let store = Arc::new(MemoryStore::new());
    let mut u1 = open_as(&store, "U1").await;
    let id = u1.send("garbled soon").await.unwrap();
    assert!(store.corrupt_ciphertext(&id, "not base64 at all"));

    let mut config = config();
    config.sync.placeholder_text = "[encrypted]".into();
    let mut u2 = open_with(&store, "U2", &config).await;
    u2.load_history().await.unwrap();

    let view = u2.view();
    assert!(view.messages[0].is_unavailable());
    assert_eq!(view.display_text(&view.messages[0]), "[encrypted]");
}
