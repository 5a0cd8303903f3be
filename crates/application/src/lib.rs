//! 应用层实现。
//!
//! 实时消息子系统的核心：连接注册表、会话驱动、消息分发、心跳监督和限流。
//! 外部协作方（存储、认证、在线状态）都以 trait 注入。

pub mod clock;
pub mod dispatcher;
pub mod error;
pub mod heartbeat;
pub mod presence;
pub mod rate_limiter;
pub mod registry;
pub mod session;

pub use clock::{Clock, ManualClock, SystemClock};
pub use dispatcher::{DispatchReport, DispatcherDependencies, MessageDispatcher};
pub use error::ApplicationError;
pub use heartbeat::{HeartbeatSupervisor, HeartbeatVerdict};
pub use presence::{memory::MemoryPresenceStore, PresenceStore};
pub use rate_limiter::{
    Actor, RateLimitTiers, RateLimiter, ResourceClass, TokenBucket,
};
pub use registry::{
    CloseReason, Connection, ConnectionRegistry, ConnectionState, Transport, TransportError,
};
pub use session::{ConnectionHandler, InboundFrame, SessionServices};
