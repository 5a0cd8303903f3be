use std::sync::Arc;

use application::{ApplicationError, PresenceStore};
use async_trait::async_trait;
use domain::UserId;

/// Redis实现的在线状态存储
///
/// 所有在线用户放在一个 Set 中，多个节点共享同一份视图。
pub struct RedisPresenceStore {
    redis_client: Arc<redis::Client>,
    key: String,
}

impl RedisPresenceStore {
    pub const DEFAULT_KEY: &'static str = "chat:online";

    pub fn new(redis_client: Arc<redis::Client>) -> Self {
        Self::with_key(redis_client, Self::DEFAULT_KEY)
    }

    pub fn with_key(redis_client: Arc<redis::Client>, key: impl Into<String>) -> Self {
        Self {
            redis_client,
            key: key.into(),
        }
    }

    /// 获取连接
    async fn get_connection(&self) -> Result<redis::aio::MultiplexedConnection, ApplicationError> {
        self.redis_client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                let message = format!("Redis connection failed: {e}");
                ApplicationError::infrastructure_with_source(message, e)
            })
    }
}

fn redis_err(e: redis::RedisError) -> ApplicationError {
    let message = format!("Redis operation failed: {e}");
    ApplicationError::infrastructure_with_source(message, e)
}

#[async_trait]
impl PresenceStore for RedisPresenceStore {
    async fn set_online(&self, user_id: UserId, online: bool) -> Result<(), ApplicationError> {
        let mut conn = self.get_connection().await?;
        let command = if online { "SADD" } else { "SREM" };
        let _: i64 = redis::cmd(command)
            .arg(&self.key)
            .arg(user_id.as_i64())
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;

        tracing::debug!(user_id = %user_id, online, "presence updated");
        Ok(())
    }

    async fn is_online(&self, user_id: UserId) -> Result<bool, ApplicationError> {
        let mut conn = self.get_connection().await?;
        redis::cmd("SISMEMBER")
            .arg(&self.key)
            .arg(user_id.as_i64())
            .query_async(&mut conn)
            .await
            .map_err(redis_err)
    }

    async fn online_users(&self) -> Result<Vec<UserId>, ApplicationError> {
        let mut conn = self.get_connection().await?;
        let members: Vec<i64> = redis::cmd("SMEMBERS")
            .arg(&self.key)
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;

        let mut users: Vec<UserId> = members.into_iter().map(UserId).collect();
        users.sort();
        Ok(users)
    }
}
