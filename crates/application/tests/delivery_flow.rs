//! 消息分发集成测试
//!
//! 覆盖单聊、群聊、持久化先于扇出、校验失败、持久化失败和限流。

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use application::{Transport, TransportError};
use async_trait::async_trait;
use common::{Harness, TestClient, TestStore};
use domain::{
    Action, ChatSendData, ConversationPeer, Envelope, ErrorCode, FrameKind, GroupId,
    MockMessageStore, Payload, StorageError, UserId,
};
use tokio::sync::mpsc;

fn chat_frame(msg_id: &str, data: ChatSendData) -> String {
    Envelope::chat_send(Some(msg_id.to_string()), data)
        .encode()
        .unwrap()
}

async fn send(harness: &Harness, client: &TestClient, text: &str) {
    let _ = harness.handler.handle_text(&client.connection, text).await;
}

fn expect_error(envelope: &Envelope, code: ErrorCode) {
    assert_eq!(envelope.kind, FrameKind::Error);
    match &envelope.payload {
        Payload::Error(data) => assert_eq!(data.code, code),
        other => panic!("expected error payload, got {other:?}"),
    }
}

#[tokio::test]
async fn direct_message_is_acked_and_delivered() {
    let harness = Harness::new(TestStore::new().with_profile(1, "alice"));
    let mut alice = harness.connect_ready(1).await;
    let mut bob = harness.connect_ready(2).await;

    send(&harness, &alice, &chat_frame("c-1", ChatSendData::direct(UserId(2), "  hi bob  "))).await;

    let ack = alice.next_envelope().await;
    assert_eq!(ack.action, Some(Action::Ack));
    assert_eq!(ack.msg_id.as_deref(), Some("c-1"));
    let message_id = match ack.payload {
        Payload::Ack(data) => data.message_id,
        other => panic!("expected ack, got {other:?}"),
    };

    let received = bob.next_envelope().await;
    assert_eq!(received.action, Some(Action::Receive));
    match received.payload {
        Payload::ChatReceive(data) => {
            assert_eq!(data.message_id, message_id);
            assert_eq!(data.from_user_id, UserId(1));
            assert_eq!(data.from_user.nickname, "alice");
            assert_eq!(data.content, "  hi bob  ");
            assert_eq!(data.to_user_id, Some(UserId(2)));
            assert_eq!(data.group_id, None);
        }
        other => panic!("expected receive, got {other:?}"),
    }

    assert_eq!(harness.store.content_of(message_id).as_deref(), Some("  hi bob  "));
    assert_eq!(
        harness.store.unread_of(2, ConversationPeer::User(UserId(1))),
        1
    );
    assert_eq!(
        harness.store.unread_of(1, ConversationPeer::User(UserId(2))),
        0
    );
    assert!(alice.try_next_envelope().is_none());
}

#[tokio::test]
async fn direct_message_to_offline_user_is_still_acked() {
    let harness = Harness::new(TestStore::new());
    let mut alice = harness.connect_ready(1).await;

    send(&harness, &alice, &chat_frame("c-2", ChatSendData::direct(UserId(9), "later"))).await;

    let ack = alice.next_envelope().await;
    assert_eq!(ack.action, Some(Action::Ack));
    assert_eq!(harness.store.message_count(), 1);
    assert_eq!(
        harness.store.unread_of(9, ConversationPeer::User(UserId(1))),
        1
    );
}

#[tokio::test]
async fn direct_message_to_self_is_stored_without_unread() {
    let harness = Harness::new(TestStore::new());
    let mut alice = harness.connect_ready(1).await;

    send(&harness, &alice, &chat_frame("c-3", ChatSendData::direct(UserId(1), "note"))).await;

    let ack = alice.next_envelope().await;
    assert_eq!(ack.action, Some(Action::Ack));
    assert_eq!(harness.store.message_count(), 1);
    assert_eq!(
        harness.store.unread_of(1, ConversationPeer::User(UserId(1))),
        0
    );
    assert!(harness.store.touched_users().contains(&UserId(1)));
    assert!(alice.try_next_envelope().is_none());
}

#[tokio::test]
async fn group_message_reaches_online_members_except_sender() {
    let harness = Harness::new(TestStore::new().with_group(10, &[1, 2, 3, 4]));
    let mut alice = harness.connect_ready(1).await;
    let mut bob = harness.connect_ready(2).await;
    let mut carol = harness.connect_ready(3).await;

    send(&harness, &alice, &chat_frame("g-1", ChatSendData::group(GroupId(10), "standup"))).await;

    assert_eq!(alice.next_envelope().await.action, Some(Action::Ack));
    for client in [&mut bob, &mut carol] {
        let envelope = client.next_envelope().await;
        match envelope.payload {
            Payload::ChatReceive(data) => {
                assert_eq!(data.group_id, Some(GroupId(10)));
                assert_eq!(data.from_user.nickname, "user-1");
            }
            other => panic!("expected receive, got {other:?}"),
        }
    }
    assert!(alice.try_next_envelope().is_none());

    let group = ConversationPeer::Group(GroupId(10));
    for member in [2, 3, 4] {
        assert_eq!(harness.store.unread_of(member, group), 1);
    }
    assert_eq!(harness.store.unread_of(1, group), 0);
    assert_eq!(harness.store.touched_users().len(), 4);
}

#[tokio::test]
async fn non_member_cannot_post_to_group() {
    let harness = Harness::new(TestStore::new().with_group(10, &[2, 3]));
    let mut mallory = harness.connect_ready(7).await;
    let mut bob = harness.connect_ready(2).await;

    send(&harness, &mallory, &chat_frame("g-2", ChatSendData::group(GroupId(10), "hey"))).await;

    expect_error(&mallory.next_envelope().await, ErrorCode::NotGroupMember);
    assert_eq!(harness.store.message_count(), 0);
    assert!(bob.try_next_envelope().is_none());
}

#[tokio::test]
async fn invalid_payloads_are_rejected_without_closing() {
    let harness = Harness::new(TestStore::new());
    let mut alice = harness.connect_ready(1).await;

    send(&harness, &alice, &chat_frame("v-1", ChatSendData::direct(UserId(2), "   "))).await;
    let error = alice.next_envelope().await;
    expect_error(&error, ErrorCode::EmptyContent);
    assert_eq!(error.msg_id.as_deref(), Some("v-1"));

    let mut both = ChatSendData::direct(UserId(2), "hi");
    both.group_id = Some(GroupId(3));
    send(&harness, &alice, &chat_frame("v-2", both)).await;
    expect_error(&alice.next_envelope().await, ErrorCode::AmbiguousTarget);

    let too_long = "x".repeat(domain::MAX_CONTENT_CHARS + 1);
    send(&harness, &alice, &chat_frame("v-3", ChatSendData::direct(UserId(2), too_long))).await;
    expect_error(&alice.next_envelope().await, ErrorCode::ContentTooLong);

    send(
        &harness,
        &alice,
        r#"{"type":"chat","action":"send","msg_id":"v-4","data":{"content":5}}"#,
    )
    .await;
    let error = alice.next_envelope().await;
    expect_error(&error, ErrorCode::InvalidPayload);
    assert_eq!(error.msg_id.as_deref(), Some("v-4"));

    // 无法识别的帧只记日志，不回 error
    send(&harness, &alice, "{not json").await;
    assert!(alice.try_next_envelope().is_none());

    assert!(harness.registry.is_online(UserId(1)));
    assert_eq!(harness.store.message_count(), 0);
}

#[tokio::test]
async fn persistence_failure_reports_error_and_skips_fan_out() {
    let mut failing = MockMessageStore::new();
    failing
        .expect_persist()
        .returning(|_| Err(StorageError::unavailable("database is down")));

    let harness = Harness::with_message_store(TestStore::new(), Arc::new(failing));
    let mut alice = harness.connect_ready(1).await;
    let mut bob = harness.connect_ready(2).await;

    send(&harness, &alice, &chat_frame("p-1", ChatSendData::direct(UserId(2), "lost"))).await;

    let error = alice.next_envelope().await;
    expect_error(&error, ErrorCode::PersistenceFailure);
    assert_eq!(error.msg_id.as_deref(), Some("p-1"));
    assert!(bob.try_next_envelope().is_none());
    assert!(harness.store.touched_users().is_empty());
}

#[tokio::test]
async fn chat_tier_rejects_bursts_beyond_capacity() {
    let harness = Harness::new(TestStore::new());
    let mut alice = harness.connect_ready(1).await;
    let burst = config::RateLimitConfig::default().chat.burst as usize;

    for i in 0..burst {
        let frame = chat_frame(&format!("r-{i}"), ChatSendData::direct(UserId(2), "spam"));
        send(&harness, &alice, &frame).await;
        assert_eq!(alice.next_envelope().await.action, Some(Action::Ack));
    }

    send(&harness, &alice, &chat_frame("r-x", ChatSendData::direct(UserId(2), "spam"))).await;
    let error = alice.next_envelope().await;
    expect_error(&error, ErrorCode::RateLimited);
    assert_eq!(error.msg_id.as_deref(), Some("r-x"));
    assert_eq!(harness.store.message_count(), burst);
    assert!(harness.registry.is_online(UserId(1)));
}

/// 收到 chat/receive 时检查消息是否已经落库
struct PersistenceCheckingTransport {
    store: Arc<TestStore>,
    violated: Arc<AtomicBool>,
    seen: mpsc::UnboundedSender<()>,
}

#[async_trait]
impl Transport for PersistenceCheckingTransport {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        let envelope = Envelope::decode(&text).map_err(|e| TransportError::Io(e.to_string()))?;
        if let Payload::ChatReceive(data) = envelope.payload {
            if !self.store.contains(data.message_id) {
                self.violated.store(true, Ordering::SeqCst);
            }
            let _ = self.seen.send(());
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

#[tokio::test]
async fn recipients_only_see_persisted_messages() {
    let harness = Harness::new(TestStore::new().with_group(5, &[1, 2, 3]));
    let alice = harness.connect_ready(1).await;

    let violated = Arc::new(AtomicBool::new(false));
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    for user in [2, 3] {
        let transport = PersistenceCheckingTransport {
            store: harness.store.clone(),
            violated: violated.clone(),
            seen: seen_tx.clone(),
        };
        harness
            .handler
            .open(UserId(user), Box::new(transport))
            .await
            .unwrap();
    }

    let burst = config::RateLimitConfig::default().chat.burst as usize;
    for i in 0..burst {
        let frame = chat_frame(&format!("m-{i}"), ChatSendData::group(GroupId(5), "tick"));
        send(&harness, &alice, &frame).await;
    }

    let mut receipts = 0;
    while seen_rx.try_recv().is_ok() {
        receipts += 1;
    }
    assert_eq!(receipts, burst * 2);
    assert!(!violated.load(Ordering::SeqCst));
}
