//! 社交关系接口定义

use async_trait::async_trait;

use crate::errors::StorageError;
use crate::value_objects::UserId;

/// 好友关系，用于上下线通知的扇出范围
#[cfg_attr(feature = "testing", mockall::automock)]
#[async_trait]
pub trait FriendGraph: Send + Sync {
    async fn friend_ids_of(&self, user_id: UserId) -> Result<Vec<UserId>, StorageError>;
}
