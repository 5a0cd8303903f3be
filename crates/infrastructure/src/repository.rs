use async_trait::async_trait;
use chrono::{DateTime, Utc};
use domain::{
    ChatPayload, ConversationBook, ConversationPeer, FriendGraph, GroupId, MessageId,
    MessageStore, StorageError, StoredMessage, UserDirectory, UserId, UserProfile,
};
use sqlx::{postgres::PgPoolOptions, FromRow, PgPool};

pub(crate) fn map_sqlx_err(err: sqlx::Error) -> StorageError {
    match err {
        sqlx::Error::Database(db) if db.constraint().is_some() => {
            StorageError::Constraint(db.message().to_string())
        }
        other => StorageError::unavailable(other.to_string()),
    }
}

#[derive(Debug, FromRow)]
struct MessageRecord {
    id: i64,
    created_at: DateTime<Utc>,
}

impl From<MessageRecord> for StoredMessage {
    fn from(value: MessageRecord) -> Self {
        StoredMessage {
            id: MessageId(value.id),
            created_at: value.created_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct ProfileRecord {
    id: i64,
    nickname: String,
    avatar: Option<String>,
}

impl From<ProfileRecord> for UserProfile {
    fn from(value: ProfileRecord) -> Self {
        UserProfile {
            id: UserId(value.id),
            nickname: value.nickname,
            avatar: value.avatar,
        }
    }
}

/// 会话对端在表中的编码
fn peer_columns(peer: ConversationPeer) -> (i16, i64) {
    match peer {
        ConversationPeer::User(user) => (1, user.as_i64()),
        ConversationPeer::Group(group) => (2, group.as_i64()),
    }
}

/// PostgreSQL 实现的消息存储、会话簿记、好友关系和用户资料
#[derive(Clone)]
pub struct PgChatStore {
    pool: PgPool,
}

impl PgChatStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// 检查数据库连接是否正常
    pub async fn health_check(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(())
    }
}

#[async_trait]
impl MessageStore for PgChatStore {
    async fn persist(&self, payload: &ChatPayload) -> Result<StoredMessage, StorageError> {
        let record = sqlx::query_as::<_, MessageRecord>(
            r#"
            INSERT INTO messages (sender_id, to_user_id, group_id, content, msg_type)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, created_at
            "#,
        )
        .bind(payload.sender.as_i64())
        .bind(payload.target.to_user_id().map(|user| user.as_i64()))
        .bind(payload.target.group_id().map(|group| group.as_i64()))
        .bind(&payload.content)
        .bind(i16::from(u8::from(payload.kind)))
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(record.into())
    }

    async fn resolve_group_members(&self, group_id: GroupId) -> Result<Vec<UserId>, StorageError> {
        let exists: Option<i64> = sqlx::query_scalar("SELECT id FROM chat_groups WHERE id = $1")
            .bind(group_id.as_i64())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        if exists.is_none() {
            return Err(StorageError::not_found("group", group_id));
        }

        let members: Vec<i64> = sqlx::query_scalar(
            "SELECT user_id FROM group_members WHERE group_id = $1 ORDER BY user_id",
        )
        .bind(group_id.as_i64())
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(members.into_iter().map(UserId).collect())
    }
}

#[async_trait]
impl ConversationBook for PgChatStore {
    async fn touch_last_message(
        &self,
        user_id: UserId,
        peer: ConversationPeer,
        message_id: MessageId,
    ) -> Result<(), StorageError> {
        let (peer_kind, peer_id) = peer_columns(peer);
        sqlx::query(
            r#"
            INSERT INTO conversations (user_id, peer_kind, peer_id, last_message_id, updated_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (user_id, peer_kind, peer_id)
            DO UPDATE SET last_message_id = EXCLUDED.last_message_id, updated_at = NOW()
            "#,
        )
        .bind(user_id.as_i64())
        .bind(peer_kind)
        .bind(peer_id)
        .bind(message_id.as_i64())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn increment_unread(
        &self,
        user_id: UserId,
        peer: ConversationPeer,
    ) -> Result<(), StorageError> {
        let (peer_kind, peer_id) = peer_columns(peer);
        sqlx::query(
            r#"
            INSERT INTO conversations (user_id, peer_kind, peer_id, unread_count, updated_at)
            VALUES ($1, $2, $3, 1, NOW())
            ON CONFLICT (user_id, peer_kind, peer_id)
            DO UPDATE SET unread_count = conversations.unread_count + 1, updated_at = NOW()
            "#,
        )
        .bind(user_id.as_i64())
        .bind(peer_kind)
        .bind(peer_id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }
}

#[async_trait]
impl FriendGraph for PgChatStore {
    async fn friend_ids_of(&self, user_id: UserId) -> Result<Vec<UserId>, StorageError> {
        let friends: Vec<i64> = sqlx::query_scalar(
            "SELECT friend_id FROM friendships WHERE user_id = $1 ORDER BY friend_id",
        )
        .bind(user_id.as_i64())
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(friends.into_iter().map(UserId).collect())
    }
}

#[async_trait]
impl UserDirectory for PgChatStore {
    async fn profile(&self, user_id: UserId) -> Result<Option<UserProfile>, StorageError> {
        let record = sqlx::query_as::<_, ProfileRecord>(
            "SELECT id, nickname, avatar FROM users WHERE id = $1",
        )
        .bind(user_id.as_i64())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(record.map(UserProfile::from))
    }
}

pub async fn create_pg_pool(
    database_url: &str,
    max_connections: u32,
) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
}
