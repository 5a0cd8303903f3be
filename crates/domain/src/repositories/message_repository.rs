//! 消息存储接口定义

use async_trait::async_trait;

use crate::errors::StorageError;
use crate::message::{ChatPayload, StoredMessage};
use crate::value_objects::{GroupId, UserId};

/// 消息存储。`persist` 返回即视为消息已持久化，是扇出之前的持久点。
#[cfg_attr(feature = "testing", mockall::automock)]
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// 持久化一条消息并分配消息 ID
    async fn persist(&self, payload: &ChatPayload) -> Result<StoredMessage, StorageError>;

    /// 读取群成员快照
    async fn resolve_group_members(&self, group_id: GroupId) -> Result<Vec<UserId>, StorageError>;
}
