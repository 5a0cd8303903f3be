//! 实时通道客户端弹性层
//!
//! 断线重连（指数退避）、断线期间的待发送队列、重连后的按序补发，
//! 以及客户端自己的心跳超时检测。

mod backoff;
mod client;
mod connector;
mod error;
mod queue;

pub use backoff::Backoff;
pub use client::{ChatClient, ClientEvent, DisconnectReason, SendOutcome};
pub use connector::{ClientConnection, ClientTransport, Connector, WsConnector};
pub use error::ClientError;
pub use queue::{PendingEntry, PendingQueue};
