//! 用户资料接口定义

use async_trait::async_trait;

use crate::errors::StorageError;
use crate::message::UserProfile;
use crate::value_objects::UserId;

/// 用户资料查询，用于填充 chat/receive 中的 `from_user`
#[cfg_attr(feature = "testing", mockall::automock)]
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn profile(&self, user_id: UserId) -> Result<Option<UserProfile>, StorageError>;
}
