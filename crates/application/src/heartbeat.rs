use std::sync::Arc;
use std::time::Duration;

use config::HeartbeatConfig;
use domain::Envelope;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::registry::{CloseReason, Connection, ConnectionRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatVerdict {
    Alive,
    TimedOut,
    /// 连接已在别处关闭
    Closed,
}

/// 心跳监督
///
/// 每条连接一个任务，按固定间隔发送 ping；超过超时阈值没有收到
/// ping/pong 的连接被关闭。
pub struct HeartbeatSupervisor {
    registry: Arc<ConnectionRegistry>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    timeout: Duration,
}

impl HeartbeatSupervisor {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        clock: Arc<dyn Clock>,
        config: &HeartbeatConfig,
    ) -> Self {
        Self::with_timing(registry, clock, config.interval(), config.timeout())
    }

    pub fn with_timing(
        registry: Arc<ConnectionRegistry>,
        clock: Arc<dyn Clock>,
        interval: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            registry,
            clock,
            interval,
            timeout,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn check(&self, connection: &Connection) -> HeartbeatVerdict {
        if !connection.is_active() {
            return HeartbeatVerdict::Closed;
        }
        let silent_for = self
            .clock
            .now()
            .saturating_duration_since(connection.last_heartbeat());
        if silent_for > self.timeout {
            HeartbeatVerdict::TimedOut
        } else {
            HeartbeatVerdict::Alive
        }
    }

    /// 一次心跳检查：超时则关闭，否则发送 ping
    pub async fn tick(&self, connection: &Arc<Connection>) -> HeartbeatVerdict {
        let verdict = self.check(connection);
        match verdict {
            HeartbeatVerdict::TimedOut => {
                warn!(
                    user_id = %connection.user_id(),
                    connection_id = %connection.id(),
                    timeout_secs = self.timeout.as_secs(),
                    "heartbeat timed out"
                );
                self.registry
                    .close(connection, CloseReason::HeartbeatTimeout)
                    .await;
            }
            HeartbeatVerdict::Alive => {
                // 写失败时由注册表驱逐，这里不关心结果
                self.registry.send_on(connection, &Envelope::ping()).await;
            }
            HeartbeatVerdict::Closed => {}
        }
        verdict
    }

    pub fn spawn(self: &Arc<Self>, connection: Arc<Connection>) -> JoinHandle<()> {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(Instant::now() + supervisor.interval, supervisor.interval);
            loop {
                tokio::select! {
                    _ = connection.closed().cancelled() => break,
                    _ = ticker.tick() => {
                        if supervisor.tick(&connection).await != HeartbeatVerdict::Alive {
                            break;
                        }
                    }
                }
            }
            debug!(connection_id = %connection.id(), "heartbeat task finished");
        })
    }
}
