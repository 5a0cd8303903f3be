use std::sync::Arc;

use application::{MemoryPresenceStore, PresenceStore};
use config::AppConfig;
use domain::{ConversationBook, FriendGraph, MessageStore, UserDirectory};
use thiserror::Error;

use crate::{
    memory::MemoryChatStore,
    migrations::MIGRATOR,
    presence_storage::RedisPresenceStore,
    repository::{create_pg_pool, PgChatStore},
};

#[derive(Debug, Error)]
pub enum InfrastructureError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// 按配置装配好的协作方
///
/// 配置了数据库地址则使用 PostgreSQL，否则使用进程内存储；在线状态同理。
#[derive(Clone)]
pub struct Infrastructure {
    pub messages: Arc<dyn MessageStore>,
    pub conversations: Arc<dyn ConversationBook>,
    pub friends: Arc<dyn FriendGraph>,
    pub users: Arc<dyn UserDirectory>,
    pub presence: Arc<dyn PresenceStore>,
}

impl Infrastructure {
    pub async fn connect(config: &AppConfig) -> Result<Self, InfrastructureError> {
        let mut infrastructure = match config.database.url.as_deref() {
            Some(url) => {
                let pool = create_pg_pool(url, config.database.max_connections).await?;
                MIGRATOR.run(&pool).await?;
                tracing::info!("using PostgreSQL chat store");
                Self::from_store(Arc::new(PgChatStore::new(pool)))
            }
            None => {
                tracing::warn!("no database configured, using in-memory chat store");
                Self::in_memory(Arc::new(MemoryChatStore::new()))
            }
        };

        if let Some(url) = config.redis.url.as_deref() {
            let client = redis::Client::open(url)?;
            infrastructure.presence = Arc::new(RedisPresenceStore::new(Arc::new(client)));
            tracing::info!("using Redis presence store");
        }

        Ok(infrastructure)
    }

    pub fn in_memory(store: Arc<MemoryChatStore>) -> Self {
        Self::from_store(store)
    }

    fn from_store<S>(store: Arc<S>) -> Self
    where
        S: MessageStore + ConversationBook + FriendGraph + UserDirectory + 'static,
    {
        Self {
            messages: store.clone(),
            conversations: store.clone(),
            friends: store.clone(),
            users: store,
            presence: Arc::new(MemoryPresenceStore::new()),
        }
    }
}
