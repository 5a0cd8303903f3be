//! 基础设施层实现。
//!
//! 提供消息存储、会话簿记、社交关系和在线状态的适配器，实现应用/领域层定义的接口。

pub mod builder;
pub mod memory;
pub mod migrations;
pub mod presence_storage;
pub mod repository;

pub use builder::{Infrastructure, InfrastructureError};
pub use memory::{ConversationEntry, MemoryChatStore, MemoryMessage};
pub use migrations::MIGRATOR;
pub use presence_storage::RedisPresenceStore;
pub use repository::{create_pg_pool, PgChatStore};
