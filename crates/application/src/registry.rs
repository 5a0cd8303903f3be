//! 连接注册表
//!
//! 每个用户至多一条活跃连接。注册表按用户 ID 分片存储连接，读操作不需要
//! 全局锁；每条连接自带写锁，扇出时各连接互不阻塞。

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use domain::{ConnectionId, Envelope, FriendGraph, UserId};
use futures_util::future::{BoxFuture, FutureExt};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::presence::PresenceStore;

/// 连接底层的双向文本通道
#[async_trait]
pub trait Transport: Send {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;

    async fn close(&mut self) -> Result<(), TransportError>;
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport already closed")]
    Closed,
    #[error("transport io failed: {0}")]
    Io(String),
    #[error("failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),
}

/// 连接生命周期：Handshaking → Active → Closing → Closed，只进不退
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Handshaking = 0,
    Active = 1,
    Closing = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Handshaking,
            1 => ConnectionState::Active,
            2 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// 客户端发送关闭帧或读到流结束
    ClientDisconnect,
    TransportFailure,
    HeartbeatTimeout,
    /// 同一用户建立了新连接
    Replaced,
    Removed,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            CloseReason::ClientDisconnect => "client_disconnect",
            CloseReason::TransportFailure => "transport_failure",
            CloseReason::HeartbeatTimeout => "heartbeat_timeout",
            CloseReason::Replaced => "replaced",
            CloseReason::Removed => "removed",
        };
        f.write_str(text)
    }
}

/// 一条已认证的实时连接
pub struct Connection {
    id: ConnectionId,
    user_id: UserId,
    connected_at: DateTime<Utc>,
    state: AtomicU8,
    last_heartbeat: std::sync::Mutex<Instant>,
    transport: Mutex<Box<dyn Transport>>,
    closed: CancellationToken,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("state", &self.state())
            .finish()
    }
}

impl Connection {
    pub fn new(user_id: UserId, transport: Box<dyn Transport>, now: Instant) -> Self {
        Self {
            id: ConnectionId::generate(),
            user_id,
            connected_at: Utc::now(),
            state: AtomicU8::new(ConnectionState::Handshaking as u8),
            last_heartbeat: std::sync::Mutex::new(now),
            transport: Mutex::new(transport),
            closed: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_active(&self) -> bool {
        self.state() == ConnectionState::Active
    }

    /// 握手完成。只有 Handshaking 状态可以激活。
    pub fn activate(&self) -> bool {
        self.state
            .compare_exchange(
                ConnectionState::Handshaking as u8,
                ConnectionState::Active as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// 抢占关闭权。并发调用中恰好一个返回 true。
    pub fn begin_close(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current >= ConnectionState::Closing as u8 {
                return false;
            }
            match self.state.compare_exchange_weak(
                current,
                ConnectionState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.closed.cancel();
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
    }

    pub fn finish_close(&self) {
        self.state
            .store(ConnectionState::Closed as u8, Ordering::Release);
    }

    /// 关闭时被取消，读循环和心跳任务据此退出
    pub fn closed(&self) -> &CancellationToken {
        &self.closed
    }

    pub fn touch_heartbeat(&self, now: Instant) {
        let mut last = self
            .last_heartbeat
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if now > *last {
            *last = now;
        }
    }

    pub fn last_heartbeat(&self) -> Instant {
        *self
            .last_heartbeat
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 编码并写出一个信封，写锁覆盖编码和写入
    pub async fn write(&self, envelope: &Envelope) -> Result<(), TransportError> {
        let mut transport = self.transport.lock().await;
        if !self.is_active() {
            return Err(TransportError::Closed);
        }
        let text = envelope.encode()?;
        transport.send_text(text).await
    }

    async fn close_transport(&self) {
        let mut transport = self.transport.lock().await;
        if let Err(err) = transport.close().await {
            debug!(connection_id = %self.id, error = %err, "transport close reported error");
        }
    }
}

/// 连接注册表
pub struct ConnectionRegistry {
    connections: DashMap<UserId, Arc<Connection>>,
    presence: Arc<dyn PresenceStore>,
    friends: Arc<dyn FriendGraph>,
}

impl ConnectionRegistry {
    pub fn new(presence: Arc<dyn PresenceStore>, friends: Arc<dyn FriendGraph>) -> Self {
        Self {
            connections: DashMap::new(),
            presence,
            friends,
        }
    }

    /// 登记一条连接，替换同一用户的旧连接
    ///
    /// 旧连接被关闭但不发布下线：用户仍然在线。
    pub async fn register(&self, connection: Arc<Connection>) {
        let user_id = connection.user_id();
        let previous = self.connections.insert(user_id, Arc::clone(&connection));

        if let Some(old) = previous.filter(|old| old.id() != connection.id()) {
            if old.begin_close() {
                old.close_transport().await;
                old.finish_close();
                info!(
                    user_id = %user_id,
                    old_connection_id = %old.id(),
                    new_connection_id = %connection.id(),
                    "replaced existing connection"
                );
            }
        }

        self.publish_presence(user_id, true).await;
        info!(user_id = %user_id, connection_id = %connection.id(), "connection registered");
    }

    /// 关闭一条连接。幂等：并发调用中只有一个生效，其余返回 false。
    ///
    /// 只有当这条连接仍是该用户的登记连接时才发布下线。
    pub async fn close(&self, connection: &Arc<Connection>, reason: CloseReason) -> bool {
        if !connection.begin_close() {
            return false;
        }

        let user_id = connection.user_id();
        let removed = self
            .connections
            .remove_if(&user_id, |_, current| current.id() == connection.id())
            .is_some();

        connection.close_transport().await;
        connection.finish_close();

        info!(
            user_id = %user_id,
            connection_id = %connection.id(),
            reason = %reason,
            "connection closed"
        );

        if removed {
            self.publish_presence(user_id, false).await;
            self.announce(user_id, false).await;
        }
        true
    }

    /// 移除用户的连接并发布下线
    pub async fn remove(&self, user_id: UserId) -> bool {
        match self.get(user_id) {
            Some(connection) => self.close(&connection, CloseReason::Removed).await,
            None => false,
        }
    }

    pub fn get(&self, user_id: UserId) -> Option<Arc<Connection>> {
        self.connections
            .get(&user_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// 向用户当前的连接发送。不在线、已关闭或写失败均返回 false。
    pub async fn send_to(&self, user_id: UserId, envelope: &Envelope) -> bool {
        match self.get(user_id) {
            Some(connection) => self.send_on(&connection, envelope).await,
            None => false,
        }
    }

    /// 在指定连接上发送；写失败会驱逐该连接
    pub async fn send_on(&self, connection: &Arc<Connection>, envelope: &Envelope) -> bool {
        if !connection.is_active() {
            return false;
        }

        match connection.write(envelope).await {
            Ok(()) => true,
            Err(TransportError::Closed) => false,
            Err(TransportError::Encode(err)) => {
                warn!(connection_id = %connection.id(), error = %err, "failed to encode envelope");
                false
            }
            Err(err) => {
                warn!(
                    user_id = %connection.user_id(),
                    connection_id = %connection.id(),
                    error = %err,
                    "write failed, evicting connection"
                );
                self.close(connection, CloseReason::TransportFailure).await;
                false
            }
        }
    }

    /// 逐个发送，各接收者互不影响
    pub async fn send_to_many(
        &self,
        user_ids: &[UserId],
        envelope: &Envelope,
    ) -> HashMap<UserId, bool> {
        let mut outcomes = HashMap::with_capacity(user_ids.len());
        for &user_id in user_ids {
            let delivered = self.send_to(user_id, envelope).await;
            outcomes.insert(user_id, delivered);
        }
        outcomes
    }

    pub fn is_online(&self, user_id: UserId) -> bool {
        self.connections
            .get(&user_id)
            .map(|entry| entry.is_active())
            .unwrap_or(false)
    }

    pub fn online_count(&self) -> usize {
        self.connections
            .iter()
            .filter(|entry| entry.is_active())
            .count()
    }

    pub fn list_online(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self
            .connections
            .iter()
            .filter(|entry| entry.is_active())
            .map(|entry| *entry.key())
            .collect();
        users.sort();
        users
    }

    /// 向在线好友推送上下线通知
    ///
    /// 关闭路径会经由这里回到 `send_to`，返回装箱的 future 以切断递归类型。
    pub fn announce(&self, user_id: UserId, online: bool) -> BoxFuture<'_, ()> {
        async move {
            let friends = match self.friends.friend_ids_of(user_id).await {
                Ok(friends) => friends,
                Err(err) => {
                    warn!(user_id = %user_id, error = %err, "failed to load friends for presence announcement");
                    return;
                }
            };

            let envelope = Envelope::online_status(user_id, online);
            let mut notified = 0usize;
            for friend in friends {
                if self.is_online(friend) && self.send_to(friend, &envelope).await {
                    notified += 1;
                }
            }
            debug!(user_id = %user_id, online, notified, "presence announced");
        }
        .boxed()
    }

    async fn publish_presence(&self, user_id: UserId, online: bool) {
        if let Err(err) = self.presence.set_online(user_id, online).await {
            warn!(user_id = %user_id, online, error = %err, "failed to update presence store");
        }
    }
}
