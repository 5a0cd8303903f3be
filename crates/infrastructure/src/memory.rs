//! 进程内存储
//!
//! 未配置数据库时使用，也用于端到端测试。重启即丢失全部数据。

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use domain::{
    ChatPayload, ConversationBook, ConversationPeer, FriendGraph, GroupId, MessageId,
    MessageStore, StorageError, StoredMessage, UserDirectory, UserId, UserProfile,
};
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
pub struct MemoryMessage {
    pub id: MessageId,
    pub payload: ChatPayload,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConversationEntry {
    pub last_message_id: Option<MessageId>,
    pub unread: u32,
}

#[derive(Default)]
struct State {
    next_message_id: i64,
    messages: Vec<MemoryMessage>,
    groups: HashMap<GroupId, BTreeSet<UserId>>,
    friends: HashMap<UserId, BTreeSet<UserId>>,
    profiles: HashMap<UserId, UserProfile>,
    conversations: HashMap<(UserId, ConversationPeer), ConversationEntry>,
}

#[derive(Default)]
pub struct MemoryChatStore {
    state: RwLock<State>,
}

impl MemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_user(&self, profile: UserProfile) {
        self.state.write().await.profiles.insert(profile.id, profile);
    }

    /// 建立双向好友关系
    pub async fn add_friendship(&self, a: UserId, b: UserId) {
        let mut state = self.state.write().await;
        state.friends.entry(a).or_default().insert(b);
        state.friends.entry(b).or_default().insert(a);
    }

    pub async fn add_group(&self, group_id: GroupId, members: impl IntoIterator<Item = UserId>) {
        self.state
            .write()
            .await
            .groups
            .insert(group_id, members.into_iter().collect());
    }

    pub async fn contains(&self, id: MessageId) -> bool {
        self.state
            .read()
            .await
            .messages
            .iter()
            .any(|message| message.id == id)
    }

    pub async fn messages(&self) -> Vec<MemoryMessage> {
        self.state.read().await.messages.clone()
    }

    pub async fn conversation(&self, user_id: UserId, peer: ConversationPeer) -> ConversationEntry {
        self.state
            .read()
            .await
            .conversations
            .get(&(user_id, peer))
            .copied()
            .unwrap_or_default()
    }
}

#[async_trait]
impl MessageStore for MemoryChatStore {
    async fn persist(&self, payload: &ChatPayload) -> Result<StoredMessage, StorageError> {
        let mut state = self.state.write().await;
        state.next_message_id += 1;
        let stored = StoredMessage {
            id: MessageId(state.next_message_id),
            created_at: Utc::now(),
        };
        state.messages.push(MemoryMessage {
            id: stored.id,
            payload: payload.clone(),
            created_at: stored.created_at,
        });
        Ok(stored)
    }

    async fn resolve_group_members(&self, group_id: GroupId) -> Result<Vec<UserId>, StorageError> {
        self.state
            .read()
            .await
            .groups
            .get(&group_id)
            .map(|members| members.iter().copied().collect())
            .ok_or_else(|| StorageError::not_found("group", group_id))
    }
}

#[async_trait]
impl ConversationBook for MemoryChatStore {
    async fn touch_last_message(
        &self,
        user_id: UserId,
        peer: ConversationPeer,
        message_id: MessageId,
    ) -> Result<(), StorageError> {
        let mut state = self.state.write().await;
        let entry = state.conversations.entry((user_id, peer)).or_default();
        entry.last_message_id = Some(message_id);
        Ok(())
    }

    async fn increment_unread(
        &self,
        user_id: UserId,
        peer: ConversationPeer,
    ) -> Result<(), StorageError> {
        let mut state = self.state.write().await;
        state.conversations.entry((user_id, peer)).or_default().unread += 1;
        Ok(())
    }
}

#[async_trait]
impl FriendGraph for MemoryChatStore {
    async fn friend_ids_of(&self, user_id: UserId) -> Result<Vec<UserId>, StorageError> {
        Ok(self
            .state
            .read()
            .await
            .friends
            .get(&user_id)
            .map(|friends| friends.iter().copied().collect())
            .unwrap_or_default())
    }
}

#[async_trait]
impl UserDirectory for MemoryChatStore {
    async fn profile(&self, user_id: UserId) -> Result<Option<UserProfile>, StorageError> {
        Ok(self.state.read().await.profiles.get(&user_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::{ChatTarget, ContentKind};

    fn payload(sender: i64, target: ChatTarget) -> ChatPayload {
        ChatPayload::new(UserId(sender), target, "hello", ContentKind::Text).unwrap()
    }

    #[tokio::test]
    async fn persist_assigns_increasing_ids() {
        let store = MemoryChatStore::new();
        let first = store
            .persist(&payload(1, ChatTarget::Direct(UserId(2))))
            .await
            .unwrap();
        let second = store
            .persist(&payload(2, ChatTarget::Direct(UserId(1))))
            .await
            .unwrap();

        assert!(second.id > first.id);
        assert!(store.contains(first.id).await);
        assert_eq!(store.messages().await.len(), 2);
    }

    #[tokio::test]
    async fn unknown_group_is_not_found() {
        let store = MemoryChatStore::new();
        store.add_group(GroupId(1), [UserId(1), UserId(2)]).await;

        assert_eq!(
            store.resolve_group_members(GroupId(1)).await.unwrap(),
            vec![UserId(1), UserId(2)]
        );
        assert!(matches!(
            store.resolve_group_members(GroupId(2)).await,
            Err(StorageError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn friendship_is_symmetric() {
        let store = MemoryChatStore::new();
        store.add_friendship(UserId(1), UserId(2)).await;
        assert_eq!(store.friend_ids_of(UserId(2)).await.unwrap(), vec![UserId(1)]);
        assert!(store.friend_ids_of(UserId(3)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn conversation_bookkeeping_accumulates() {
        let store = MemoryChatStore::new();
        let peer = ConversationPeer::Group(GroupId(4));
        store
            .touch_last_message(UserId(1), peer, MessageId(10))
            .await
            .unwrap();
        store.increment_unread(UserId(1), peer).await.unwrap();
        store.increment_unread(UserId(1), peer).await.unwrap();

        assert_eq!(
            store.conversation(UserId(1), peer).await,
            ConversationEntry {
                last_message_id: Some(MessageId(10)),
                unread: 2,
            }
        );
    }
}
