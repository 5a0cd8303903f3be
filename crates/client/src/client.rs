//! 带断线重连的聊天客户端
//!
//! 一个后台任务负责整个连接生命周期：
//! - 断开后按指数退避重连，成功连接后清零尝试次数；
//! - 断线期间的聊天消息进入待发送队列，收到 `system/connected` 后按序补发；
//! - 连接期间定时发送 ping，超过心跳超时没有任何入站帧就主动断开重连。
//!
//! 应用通过 [`ChatClient`] 发命令，通过事件通道接收 [`ClientEvent`]。

use std::{sync::Arc, time::Duration};

use config::ClientConfig;
use domain::{Action, ChatSendData, ConnectionId, Envelope, FrameKind, Payload, UserId};
use futures_util::StreamExt;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{interval_at, sleep_until, Instant, MissedTickBehavior},
};

use crate::{
    backoff::Backoff,
    connector::{ClientConnection, ClientTransport, Connector},
    error::ClientError,
    queue::PendingQueue,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// 应用主动调用 `disconnect`
    ClientRequested,
    /// 服务端关闭或流结束
    ServerClosed,
    TransportFailure,
    HeartbeatTimeout,
}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connected {
        connection_id: ConnectionId,
        user_id: UserId,
    },
    Disconnected {
        reason: DisconnectReason,
    },
    /// 服务端推送的业务帧（ping/pong 不会上报）
    Envelope(Envelope),
    /// `DropOldest` 策略下被挤出队列的消息
    QueueOverflow {
        dropped: Envelope,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    Queued,
}

enum Command {
    Send {
        envelope: Envelope,
        reply: oneshot::Sender<Result<SendOutcome, ClientError>>,
    },
    NetworkOnline,
    VisibilityRegained,
    Disconnect,
}

/// 客户端句柄
pub struct ChatClient {
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

impl ChatClient {
    /// 启动后台任务并立即尝试第一次连接
    pub fn spawn(
        config: &ClientConfig,
        connector: Arc<dyn Connector>,
    ) -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (events, event_rx) = mpsc::unbounded_channel();

        let driver = Driver {
            connector,
            backoff: Backoff::exponential(config.reconnect_base(), config.reconnect_max()),
            heartbeat_interval: config.heartbeat_interval(),
            heartbeat_timeout: config.heartbeat_timeout(),
            queue: PendingQueue::new(config.queue_capacity, config.overflow),
            commands: command_rx,
            events,
            attempt: 0,
            pending_delay: None,
        };
        let task = tokio::spawn(driver.run());

        (Self { commands, task }, event_rx)
    }

    /// 发送聊天消息。未连接时进入队列，返回 `Queued`。
    pub async fn send_chat(
        &self,
        msg_id: impl Into<String>,
        data: ChatSendData,
    ) -> Result<SendOutcome, ClientError> {
        let (reply, outcome) = oneshot::channel();
        self.commands
            .send(Command::Send {
                envelope: Envelope::chat_send(Some(msg_id.into()), data),
                reply,
            })
            .map_err(|_| ClientError::Stopped)?;
        outcome.await.map_err(|_| ClientError::Stopped)?
    }

    /// 网络恢复：清零尝试次数并跳过当前退避立即重连
    pub fn network_online(&self) {
        let _ = self.commands.send(Command::NetworkOnline);
    }

    /// 页面重新可见：断线状态下立即检查一次连接
    pub fn visibility_regained(&self) {
        let _ = self.commands.send(Command::VisibilityRegained);
    }

    /// 主动断开，不再重连
    pub async fn disconnect(self) {
        let _ = self.commands.send(Command::Disconnect);
        if let Err(err) = self.task.await {
            tracing::warn!(error = %err, "client task ended abnormally");
        }
    }
}

enum Flow {
    Continue,
    Stop,
}

struct Driver {
    connector: Arc<dyn Connector>,
    backoff: Backoff,
    heartbeat_interval: Duration,
    heartbeat_timeout: Duration,
    queue: PendingQueue,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<ClientEvent>,
    attempt: u32,
    pending_delay: Option<Duration>,
}

impl Driver {
    async fn run(mut self) {
        loop {
            let connection = match self.establish().await {
                Some(connection) => connection,
                None => break,
            };

            match self.session(connection).await {
                Flow::Continue => self.schedule_reconnect(),
                Flow::Stop => break,
            }
        }
        tracing::debug!(pending = self.queue.len(), "client stopped");
    }

    fn schedule_reconnect(&mut self) {
        self.attempt = self.attempt.saturating_add(1);
        let delay = self.backoff.delay_at(self.attempt);
        tracing::info!(attempt = self.attempt, delay_ms = delay.as_millis() as u64, "reconnect scheduled");
        self.pending_delay = Some(delay);
    }

    fn emit(&self, event: ClientEvent) {
        // 应用丢弃了事件接收端时照常运行
        let _ = self.events.send(event);
    }

    /// 断线期间收到的聊天消息入队
    fn enqueue(&mut self, envelope: Envelope) -> Result<SendOutcome, ClientError> {
        if let Some(dropped) = self.queue.push(envelope, Instant::now())? {
            tracing::warn!(msg_id = ?dropped.envelope.msg_id, "pending queue overflow, oldest entry dropped");
            self.emit(ClientEvent::QueueOverflow {
                dropped: dropped.envelope,
            });
        }
        Ok(SendOutcome::Queued)
    }

    /// 等待退避结束后建连；返回 `None` 表示应用要求停止
    async fn establish(&mut self) -> Option<ClientConnection> {
        loop {
            if let Some(delay) = self.pending_delay.take() {
                if let Flow::Stop = self.wait_backoff(delay).await {
                    return None;
                }
            }

            match self.connector.connect().await {
                Ok(connection) => {
                    tracing::info!(previous_attempts = self.attempt, "transport connected");
                    self.attempt = 0;
                    return Some(connection);
                }
                Err(err) => {
                    tracing::warn!(error = %err, "connect attempt failed");
                    self.schedule_reconnect();
                }
            }
        }
    }

    async fn wait_backoff(&mut self, delay: Duration) -> Flow {
        let deadline = Instant::now() + delay;
        loop {
            tokio::select! {
                _ = sleep_until(deadline) => return Flow::Continue,
                command = self.commands.recv() => match command {
                    Some(Command::Send { envelope, reply }) => {
                        let _ = reply.send(self.enqueue(envelope));
                    }
                    Some(Command::NetworkOnline) => {
                        tracing::info!("network online, reconnecting now");
                        self.attempt = 0;
                        return Flow::Continue;
                    }
                    Some(Command::VisibilityRegained) => {
                        tracing::debug!("visibility regained while disconnected, reconnecting now");
                        return Flow::Continue;
                    }
                    Some(Command::Disconnect) | None => return Flow::Stop,
                },
            }
        }
    }

    /// 单个连接的生命周期。`Continue` 表示需要重连。
    async fn session(&mut self, connection: ClientConnection) -> Flow {
        let ClientConnection { mut sink, mut inbound } = connection;
        let mut ready = false;
        let mut last_seen = Instant::now();
        let mut ping = interval_at(last_seen + self.heartbeat_interval, self.heartbeat_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let reason = loop {
            let deadline = last_seen + self.heartbeat_timeout;

            tokio::select! {
                frame = inbound.next() => match frame {
                    Some(Ok(text)) => {
                        last_seen = Instant::now();
                        if let Err(reason) = self.on_frame(sink.as_mut(), &text, &mut ready).await {
                            break reason;
                        }
                    }
                    Some(Err(ClientError::Closed)) | None => break DisconnectReason::ServerClosed,
                    Some(Err(err)) => {
                        tracing::warn!(error = %err, "inbound stream failed");
                        break DisconnectReason::TransportFailure;
                    }
                },
                _ = ping.tick() => {
                    if let Err(err) = send_envelope(sink.as_mut(), &Envelope::ping()).await {
                        tracing::warn!(error = %err, "ping failed");
                        break DisconnectReason::TransportFailure;
                    }
                }
                _ = sleep_until(deadline) => {
                    tracing::warn!(
                        silent_ms = last_seen.elapsed().as_millis() as u64,
                        "heartbeat timed out, dropping transport"
                    );
                    break DisconnectReason::HeartbeatTimeout;
                }
                command = self.commands.recv() => match command {
                    Some(Command::Send { envelope, reply }) => {
                        if !ready {
                            let _ = reply.send(self.enqueue(envelope));
                            continue;
                        }
                        match send_envelope(sink.as_mut(), &envelope).await {
                            Ok(()) => {
                                let _ = reply.send(Ok(SendOutcome::Sent));
                            }
                            Err(err) => {
                                tracing::warn!(error = %err, "send failed, message queued");
                                let _ = reply.send(self.enqueue(envelope));
                                break DisconnectReason::TransportFailure;
                            }
                        }
                    }
                    Some(Command::NetworkOnline) | Some(Command::VisibilityRegained) => {}
                    Some(Command::Disconnect) | None => {
                        if let Err(err) = sink.close().await {
                            tracing::debug!(error = %err, "close on disconnect failed");
                        }
                        self.emit(ClientEvent::Disconnected {
                            reason: DisconnectReason::ClientRequested,
                        });
                        return Flow::Stop;
                    }
                },
            }
        };

        if let Err(err) = sink.close().await {
            tracing::debug!(error = %err, "transport close failed");
        }
        tracing::info!(reason = ?reason, "disconnected");
        self.emit(ClientEvent::Disconnected { reason });
        Flow::Continue
    }

    async fn on_frame(
        &mut self,
        sink: &mut dyn ClientTransport,
        text: &str,
        ready: &mut bool,
    ) -> Result<(), DisconnectReason> {
        let envelope = match Envelope::decode(text) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::warn!(error = %err, "undecodable frame from server");
                return Ok(());
            }
        };

        match (envelope.kind, envelope.action, &envelope.payload) {
            (FrameKind::System, Some(Action::Connected), Payload::Connected(data)) => {
                *ready = true;
                self.emit(ClientEvent::Connected {
                    connection_id: data.connection_id,
                    user_id: data.user_id,
                });
                self.flush(sink).await
            }
            (FrameKind::Ping, _, _) => {
                let pong = Envelope::pong(envelope.msg_id.clone());
                send_envelope(sink, &pong).await.map_err(|err| {
                    tracing::warn!(error = %err, "pong failed");
                    DisconnectReason::TransportFailure
                })
            }
            (FrameKind::Pong, _, _) => Ok(()),
            _ => {
                self.emit(ClientEvent::Envelope(envelope));
                Ok(())
            }
        }
    }

    /// 按入队顺序补发；失败的条目放回队首，等下次连接
    async fn flush(&mut self, sink: &mut dyn ClientTransport) -> Result<(), DisconnectReason> {
        let total = self.queue.len();
        while let Some(entry) = self.queue.pop_front() {
            if let Err(err) = send_envelope(sink, &entry.envelope).await {
                tracing::warn!(error = %err, remaining = self.queue.len() + 1, "flush interrupted");
                self.queue.push_front(entry);
                return Err(DisconnectReason::TransportFailure);
            }
        }
        if total > 0 {
            tracing::info!(flushed = total, "pending queue flushed");
        }
        Ok(())
    }
}

async fn send_envelope(sink: &mut dyn ClientTransport, envelope: &Envelope) -> Result<(), ClientError> {
    let text = envelope.encode()?;
    sink.send_text(text).await
}
