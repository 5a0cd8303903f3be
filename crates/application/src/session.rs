//! 单条连接的会话驱动
//!
//! 认证通过后创建连接、发送 system/connected，然后在读循环中按帧类型分派，
//! 直到客户端断开、传输出错或连接在别处被关闭。

use std::sync::Arc;

use domain::{
    AuthError, Authenticator, ChatError, Envelope, FrameKind, Payload, UserId,
};
use futures_util::{Stream, StreamExt};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::dispatcher::MessageDispatcher;
use crate::heartbeat::HeartbeatSupervisor;
use crate::rate_limiter::{Actor, RateLimiter, ResourceClass};
use crate::registry::{CloseReason, Connection, ConnectionRegistry, Transport};

/// 传输层读到的一帧，与具体 WebSocket 实现无关
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Text(String),
    Binary,
    Close,
    Error(String),
}

pub struct SessionServices {
    pub authenticator: Arc<dyn Authenticator>,
    pub registry: Arc<ConnectionRegistry>,
    pub dispatcher: Arc<MessageDispatcher>,
    pub limiter: Arc<RateLimiter>,
    pub supervisor: Arc<HeartbeatSupervisor>,
    pub clock: Arc<dyn Clock>,
}

pub struct ConnectionHandler {
    authenticator: Arc<dyn Authenticator>,
    registry: Arc<ConnectionRegistry>,
    dispatcher: Arc<MessageDispatcher>,
    limiter: Arc<RateLimiter>,
    supervisor: Arc<HeartbeatSupervisor>,
    clock: Arc<dyn Clock>,
}

impl ConnectionHandler {
    pub fn new(services: SessionServices) -> Self {
        Self {
            authenticator: services.authenticator,
            registry: services.registry,
            dispatcher: services.dispatcher,
            limiter: services.limiter,
            supervisor: services.supervisor,
            clock: services.clock,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// 握手认证，在创建任何连接之前完成
    pub async fn authenticate(&self, token: Option<&str>) -> Result<UserId, ChatError> {
        let token = token
            .filter(|token| !token.is_empty())
            .ok_or(AuthError::MissingToken)?;
        let user_id = self.authenticator.validate(token).await?;
        Ok(user_id)
    }

    /// 激活连接并发送 system/connected，然后登记、异步发布上线
    pub async fn open(
        &self,
        user_id: UserId,
        transport: Box<dyn Transport>,
    ) -> Result<Arc<Connection>, ChatError> {
        let connection = Arc::new(Connection::new(user_id, transport, self.clock.now()));
        connection.activate();

        // 登记之前写出 connected，其它发送方拿不到这条连接，保证它是第一帧
        let connected = Envelope::connected(connection.id(), user_id);
        if !self.registry.send_on(&connection, &connected).await {
            self.registry
                .close(&connection, CloseReason::TransportFailure)
                .await;
            return Err(ChatError::transport("failed to deliver connected envelope"));
        }
        self.registry.register(Arc::clone(&connection)).await;

        let registry = Arc::clone(&self.registry);
        tokio::spawn(async move {
            registry.announce(user_id, true).await;
        });

        info!(user_id = %user_id, connection_id = %connection.id(), "connection opened");
        Ok(connection)
    }

    /// 处理一帧文本。需要告知发送者的错误已经在这里回传。
    pub async fn handle_text(
        &self,
        connection: &Arc<Connection>,
        text: &str,
    ) -> Result<(), ChatError> {
        let envelope = match Envelope::decode(text) {
            Ok(envelope) => envelope,
            Err(err) => {
                // 只有 chat/send 的坏载荷会回传，其余违规帧只记录日志
                if let ChatError::InvalidPayload { msg_id, .. } = &err {
                    self.reply_error(connection, msg_id.clone(), &err).await;
                }
                return Err(err);
            }
        };

        match envelope.kind {
            FrameKind::Ping => {
                connection.touch_heartbeat(self.clock.now());
                self.registry
                    .send_on(connection, &Envelope::pong(envelope.msg_id))
                    .await;
            }
            FrameKind::Pong => connection.touch_heartbeat(self.clock.now()),
            FrameKind::Chat => match envelope.payload {
                Payload::ChatSend(data) => {
                    let actor = Actor::User(connection.user_id());
                    if !self.limiter.allow(&actor, ResourceClass::Chat) {
                        let err = ChatError::RateLimited;
                        self.reply_error(connection, envelope.msg_id, &err).await;
                        return Err(err);
                    }
                    self.dispatcher
                        .dispatch(connection, envelope.msg_id, data)
                        .await?;
                }
                _ => debug!(action = ?envelope.action, "ignoring chat frame from client"),
            },
            other => debug!(kind = ?other, "ignoring frame"),
        }
        Ok(())
    }

    /// 读循环。返回前连接一定已经关闭。
    pub async fn run<S>(&self, connection: Arc<Connection>, mut inbound: S)
    where
        S: Stream<Item = InboundFrame> + Unpin + Send,
    {
        let heartbeat = self.supervisor.spawn(Arc::clone(&connection));

        let reason = loop {
            tokio::select! {
                _ = connection.closed().cancelled() => break None,
                frame = inbound.next() => match frame {
                    Some(InboundFrame::Text(text)) => {
                        if let Err(err) = self.handle_text(&connection, &text).await {
                            log_frame_error(&connection, &err);
                        }
                    }
                    Some(InboundFrame::Binary) => {
                        debug!(connection_id = %connection.id(), "ignoring binary frame");
                    }
                    Some(InboundFrame::Close) | None => break Some(CloseReason::ClientDisconnect),
                    Some(InboundFrame::Error(err)) => {
                        warn!(connection_id = %connection.id(), error = %err, "transport read failed");
                        break Some(CloseReason::TransportFailure);
                    }
                },
            }
        };

        if let Some(reason) = reason {
            self.registry.close(&connection, reason).await;
        }
        if let Err(err) = heartbeat.await {
            warn!(connection_id = %connection.id(), error = %err, "heartbeat task failed");
        }
    }

    /// 完整的连接生命周期：open 之后进入读循环
    pub async fn serve<S>(&self, user_id: UserId, transport: Box<dyn Transport>, inbound: S)
    where
        S: Stream<Item = InboundFrame> + Unpin + Send,
    {
        match self.open(user_id, transport).await {
            Ok(connection) => self.run(connection, inbound).await,
            Err(err) => warn!(user_id = %user_id, error = %err, "failed to open connection"),
        }
    }

    async fn reply_error(
        &self,
        connection: &Arc<Connection>,
        msg_id: Option<String>,
        err: &ChatError,
    ) {
        if let Some(envelope) = Envelope::from_error(msg_id, err) {
            self.registry.send_on(connection, &envelope).await;
        }
    }
}

fn log_frame_error(connection: &Connection, err: &ChatError) {
    match err {
        ChatError::ProtocolViolation(_) => {
            warn!(connection_id = %connection.id(), error = %err, "dropping malformed frame")
        }
        _ => debug!(connection_id = %connection.id(), error = %err, "frame rejected"),
    }
}
