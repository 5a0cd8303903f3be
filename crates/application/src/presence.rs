use domain::UserId;

use crate::error::ApplicationError;

/// 在线状态存储trait
///
/// 注册表在连接激活和关闭时写入；读取方（状态接口、其他节点）只看这里。
#[async_trait::async_trait]
pub trait PresenceStore: Send + Sync {
    /// 标记用户上线或下线
    async fn set_online(&self, user_id: UserId, online: bool) -> Result<(), ApplicationError>;

    /// 检查用户是否在线
    async fn is_online(&self, user_id: UserId) -> Result<bool, ApplicationError>;

    /// 获取所有在线用户
    async fn online_users(&self) -> Result<Vec<UserId>, ApplicationError>;
}

pub mod memory {
    use std::collections::BTreeSet;

    use tokio::sync::RwLock;

    use super::*;

    /// 进程内在线状态存储，开发环境和测试使用
    ///
    /// 额外记录每次状态变更，便于断言上下线发布的次数。
    #[derive(Default)]
    pub struct MemoryPresenceStore {
        online: RwLock<BTreeSet<UserId>>,
        history: RwLock<Vec<(UserId, bool)>>,
    }

    impl MemoryPresenceStore {
        pub fn new() -> Self {
            Self::default()
        }

        /// 按发生顺序返回所有状态变更
        pub async fn history(&self) -> Vec<(UserId, bool)> {
            self.history.read().await.clone()
        }

        pub async fn transitions_for(&self, user_id: UserId, online: bool) -> usize {
            self.history
                .read()
                .await
                .iter()
                .filter(|(id, state)| *id == user_id && *state == online)
                .count()
        }
    }

    #[async_trait::async_trait]
    impl PresenceStore for MemoryPresenceStore {
        async fn set_online(&self, user_id: UserId, online: bool) -> Result<(), ApplicationError> {
            {
                let mut guard = self.online.write().await;
                if online {
                    guard.insert(user_id);
                } else {
                    guard.remove(&user_id);
                }
            }
            self.history.write().await.push((user_id, online));
            Ok(())
        }

        async fn is_online(&self, user_id: UserId) -> Result<bool, ApplicationError> {
            Ok(self.online.read().await.contains(&user_id))
        }

        async fn online_users(&self) -> Result<Vec<UserId>, ApplicationError> {
            Ok(self.online.read().await.iter().copied().collect())
        }
    }

}
