//! 会话簿记接口定义

use async_trait::async_trait;

use crate::errors::StorageError;
use crate::value_objects::{ConversationPeer, MessageId, UserId};

/// 会话列表簿记：每个 `(用户, 对端)` 的最后一条消息和未读数。
#[cfg_attr(feature = "testing", mockall::automock)]
#[async_trait]
pub trait ConversationBook: Send + Sync {
    async fn touch_last_message(
        &self,
        user_id: UserId,
        peer: ConversationPeer,
        message_id: MessageId,
    ) -> Result<(), StorageError>;

    async fn increment_unread(
        &self,
        user_id: UserId,
        peer: ConversationPeer,
    ) -> Result<(), StorageError>;
}
