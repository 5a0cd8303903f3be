//! 应用层集成测试的公共夹具

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use application::{
    Clock, Connection, ConnectionHandler, ConnectionRegistry, DispatcherDependencies, HeartbeatSupervisor,
    MemoryPresenceStore, MessageDispatcher, RateLimitTiers, RateLimiter, SessionServices,
    SystemClock, Transport, TransportError,
};
use async_trait::async_trait;
use chrono::Utc;
use domain::{
    AuthError, Authenticator, ChatPayload, ConversationBook, ConversationPeer, Envelope,
    FriendGraph, GroupId, MessageId, MessageStore, StorageError, StoredMessage, UserDirectory,
    UserId, UserProfile,
};
use tokio::sync::mpsc;

/// 把写出的文本转发到测试侧的通道
pub struct ChannelTransport {
    sent: mpsc::UnboundedSender<String>,
    fail: Arc<AtomicBool>,
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(TransportError::Io("connection reset".into()));
        }
        self.sent.send(text).map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

pub fn channel_transport() -> (
    Box<dyn Transport>,
    mpsc::UnboundedReceiver<String>,
    Arc<AtomicBool>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let fail = Arc::new(AtomicBool::new(false));
    let transport = ChannelTransport {
        sent: tx,
        fail: Arc::clone(&fail),
    };
    (Box::new(transport), rx, fail)
}

/// 测试侧的一个已连接客户端
pub struct TestClient {
    pub connection: Arc<Connection>,
    pub outbox: mpsc::UnboundedReceiver<String>,
    pub fail: Arc<AtomicBool>,
}

impl TestClient {
    pub async fn next_envelope(&mut self) -> Envelope {
        let text = tokio::time::timeout(Duration::from_secs(5), self.outbox.recv())
            .await
            .expect("timed out waiting for envelope")
            .expect("transport channel closed");
        Envelope::decode(&text).expect("server sent an invalid envelope")
    }

    pub fn try_next_envelope(&mut self) -> Option<Envelope> {
        self.outbox
            .try_recv()
            .ok()
            .map(|text| Envelope::decode(&text).expect("server sent an invalid envelope"))
    }

    /// 跳过连接建立时的 system/connected
    pub async fn skip_connected(&mut self) {
        let envelope = self.next_envelope().await;
        assert_eq!(envelope.kind, domain::FrameKind::System);
    }
}

/// 内存协作方：消息、群成员、好友、会话簿记、用户资料
#[derive(Default)]
pub struct TestStore {
    next_id: AtomicI64,
    messages: Mutex<Vec<(MessageId, ChatPayload)>>,
    groups: Mutex<HashMap<GroupId, Vec<UserId>>>,
    friends: Mutex<HashMap<UserId, Vec<UserId>>>,
    profiles: Mutex<HashMap<UserId, UserProfile>>,
    pub touches: Mutex<Vec<(UserId, ConversationPeer, MessageId)>>,
    pub unread: Mutex<HashMap<(UserId, ConversationPeer), u32>>,
}

impl TestStore {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
            ..Default::default()
        }
    }

    pub fn with_group(self, group: i64, members: &[i64]) -> Self {
        self.groups
            .lock()
            .unwrap()
            .insert(GroupId(group), members.iter().copied().map(UserId).collect());
        self
    }

    pub fn with_friends(self, a: i64, b: i64) -> Self {
        {
            let mut friends = self.friends.lock().unwrap();
            friends.entry(UserId(a)).or_default().push(UserId(b));
            friends.entry(UserId(b)).or_default().push(UserId(a));
        }
        self
    }

    pub fn with_profile(self, id: i64, nickname: &str) -> Self {
        self.profiles.lock().unwrap().insert(
            UserId(id),
            UserProfile {
                id: UserId(id),
                nickname: nickname.to_string(),
                avatar: None,
            },
        );
        self
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.messages.lock().unwrap().iter().any(|(m, _)| *m == id)
    }

    pub fn content_of(&self, id: MessageId) -> Option<String> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .find(|(m, _)| *m == id)
            .map(|(_, payload)| payload.content.clone())
    }

    pub fn message_count(&self) -> usize {
        self.messages.lock().unwrap().len()
    }

    pub fn unread_of(&self, user: i64, peer: ConversationPeer) -> u32 {
        self.unread
            .lock()
            .unwrap()
            .get(&(UserId(user), peer))
            .copied()
            .unwrap_or(0)
    }

    pub fn touched_users(&self) -> HashSet<UserId> {
        self.touches.lock().unwrap().iter().map(|(u, _, _)| *u).collect()
    }
}

#[async_trait]
impl MessageStore for TestStore {
    async fn persist(&self, payload: &ChatPayload) -> Result<StoredMessage, StorageError> {
        let id = MessageId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.messages.lock().unwrap().push((id, payload.clone()));
        Ok(StoredMessage {
            id,
            created_at: Utc::now(),
        })
    }

    async fn resolve_group_members(&self, group_id: GroupId) -> Result<Vec<UserId>, StorageError> {
        self.groups
            .lock()
            .unwrap()
            .get(&group_id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("group", group_id))
    }
}

#[async_trait]
impl ConversationBook for TestStore {
    async fn touch_last_message(
        &self,
        user_id: UserId,
        peer: ConversationPeer,
        message_id: MessageId,
    ) -> Result<(), StorageError> {
        self.touches.lock().unwrap().push((user_id, peer, message_id));
        Ok(())
    }

    async fn increment_unread(
        &self,
        user_id: UserId,
        peer: ConversationPeer,
    ) -> Result<(), StorageError> {
        *self.unread.lock().unwrap().entry((user_id, peer)).or_default() += 1;
        Ok(())
    }
}

#[async_trait]
impl FriendGraph for TestStore {
    async fn friend_ids_of(&self, user_id: UserId) -> Result<Vec<UserId>, StorageError> {
        Ok(self
            .friends
            .lock()
            .unwrap()
            .get(&user_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl UserDirectory for TestStore {
    async fn profile(&self, user_id: UserId) -> Result<Option<UserProfile>, StorageError> {
        Ok(self.profiles.lock().unwrap().get(&user_id).cloned())
    }
}

/// 令牌就是十进制的用户 ID
pub struct PlainAuthenticator;

#[async_trait]
impl Authenticator for PlainAuthenticator {
    async fn validate(&self, token: &str) -> Result<UserId, AuthError> {
        token
            .parse::<i64>()
            .map(UserId)
            .map_err(|_| AuthError::InvalidToken(token.to_string()))
    }
}

pub struct Harness {
    pub store: Arc<TestStore>,
    pub presence: Arc<MemoryPresenceStore>,
    pub registry: Arc<ConnectionRegistry>,
    pub limiter: Arc<RateLimiter>,
    pub handler: Arc<ConnectionHandler>,
}

impl Harness {
    pub fn new(store: TestStore) -> Self {
        let store = Arc::new(store);
        let message_store: Arc<dyn MessageStore> = store.clone();
        Self::build(store, message_store)
    }

    /// 使用替换的消息存储（例如模拟持久化失败）
    pub fn with_message_store(store: TestStore, message_store: Arc<dyn MessageStore>) -> Self {
        Self::build(Arc::new(store), message_store)
    }

    fn build(store: Arc<TestStore>, message_store: Arc<dyn MessageStore>) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let presence = Arc::new(MemoryPresenceStore::new());
        let registry = Arc::new(ConnectionRegistry::new(presence.clone(), store.clone()));
        let dispatcher = Arc::new(MessageDispatcher::new(DispatcherDependencies {
            store: message_store,
            conversations: store.clone(),
            users: store.clone(),
            registry: registry.clone(),
        }));
        let limiter = Arc::new(RateLimiter::new(RateLimitTiers::default(), clock.clone()));
        let supervisor = Arc::new(HeartbeatSupervisor::with_timing(
            registry.clone(),
            clock.clone(),
            Duration::from_secs(30),
            Duration::from_secs(90),
        ));
        let handler = Arc::new(ConnectionHandler::new(SessionServices {
            authenticator: Arc::new(PlainAuthenticator),
            registry: registry.clone(),
            dispatcher,
            limiter: limiter.clone(),
            supervisor,
            clock,
        }));

        Self {
            store,
            presence,
            registry,
            limiter,
            handler,
        }
    }

    pub async fn connect(&self, user: i64) -> TestClient {
        let (transport, outbox, fail) = channel_transport();
        let connection = self
            .handler
            .open(UserId(user), transport)
            .await
            .expect("open connection");
        TestClient {
            connection,
            outbox,
            fail,
        }
    }

    /// 连接并跳过 system/connected
    pub async fn connect_ready(&self, user: i64) -> TestClient {
        let mut client = self.connect(user).await;
        client.skip_connected().await;
        client
    }
}
