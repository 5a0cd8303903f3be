//! 消息分发
//!
//! 一条 chat/send 的完整处理路径：校验 → 解析接收者 → 持久化 → 会话簿记
//! → 回执 → 扇出。持久化是扇出之前的持久点，失败时不会有任何接收者看到
//! 这条消息。

use std::sync::Arc;

use domain::{
    ChatError, ChatPayload, ChatReceiveData, ChatSendData, ChatTarget, ConversationBook,
    ConversationPeer, Envelope, MessageId, MessageStore, UserDirectory, UserId, UserProfile,
    ValidationReason,
};
use tracing::{info, warn};

use crate::registry::{Connection, ConnectionRegistry};

/// 分发依赖
pub struct DispatcherDependencies {
    pub store: Arc<dyn MessageStore>,
    pub conversations: Arc<dyn ConversationBook>,
    pub users: Arc<dyn UserDirectory>,
    pub registry: Arc<ConnectionRegistry>,
}

/// 一次分发的投递统计
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    pub message_id: MessageId,
    pub recipients: usize,
    pub online: usize,
    pub offline: usize,
}

struct Recipients {
    /// 需要推送的用户（不含发送者）
    targets: Vec<UserId>,
    /// 需要更新会话列表的用户（含发送者）
    participants: Vec<UserId>,
}

pub struct MessageDispatcher {
    store: Arc<dyn MessageStore>,
    conversations: Arc<dyn ConversationBook>,
    users: Arc<dyn UserDirectory>,
    registry: Arc<ConnectionRegistry>,
}

impl MessageDispatcher {
    pub fn new(deps: DispatcherDependencies) -> Self {
        Self {
            store: deps.store,
            conversations: deps.conversations,
            users: deps.users,
            registry: deps.registry,
        }
    }

    /// 处理来自 `origin` 的一条消息
    ///
    /// 发送者总会收到 ack 或 error 之一。错误在回传后仍返回给调用方用于记录。
    pub async fn dispatch(
        &self,
        origin: &Arc<Connection>,
        msg_id: Option<String>,
        data: ChatSendData,
    ) -> Result<DispatchReport, ChatError> {
        match self.deliver(origin, msg_id.clone(), data).await {
            Ok(report) => Ok(report),
            Err(err) => {
                if let Some(envelope) = Envelope::from_error(msg_id, &err) {
                    self.registry.send_on(origin, &envelope).await;
                }
                Err(err)
            }
        }
    }

    async fn deliver(
        &self,
        origin: &Arc<Connection>,
        msg_id: Option<String>,
        data: ChatSendData,
    ) -> Result<DispatchReport, ChatError> {
        let sender = origin.user_id();
        let payload = data.into_payload(sender)?;
        let recipients = self.resolve(&payload).await?;

        let stored = self.store.persist(&payload).await?;
        let payload = payload.persisted(&stored);

        self.record_conversations(&payload, &recipients, stored.id)
            .await;

        // 回执与接收者是否在线无关
        self.registry
            .send_on(origin, &Envelope::ack(msg_id, &stored))
            .await;

        let profile = self.sender_profile(sender).await;
        let envelope = Envelope::receive(ChatReceiveData::from_persisted(
            &payload, &stored, profile,
        ));
        let outcomes = self
            .registry
            .send_to_many(&recipients.targets, &envelope)
            .await;

        let online = outcomes.values().filter(|delivered| **delivered).count();
        let report = DispatchReport {
            message_id: stored.id,
            recipients: recipients.targets.len(),
            online,
            offline: recipients.targets.len() - online,
        };

        info!(
            message_id = %report.message_id,
            sender = %sender,
            recipients = report.recipients,
            online = report.online,
            offline = report.offline,
            "message dispatched"
        );
        Ok(report)
    }

    async fn resolve(&self, payload: &ChatPayload) -> Result<Recipients, ChatError> {
        match payload.target {
            // 发给自己：只入库、回执、刷新会话，不推送也不计未读
            ChatTarget::Direct(to) if to == payload.sender => Ok(Recipients {
                targets: Vec::new(),
                participants: vec![to],
            }),
            ChatTarget::Direct(to) => Ok(Recipients {
                targets: vec![to],
                participants: vec![payload.sender, to],
            }),
            ChatTarget::Group(group_id) => {
                let members = self.store.resolve_group_members(group_id).await?;
                if !members.contains(&payload.sender) {
                    return Err(ValidationReason::NotGroupMember {
                        user_id: payload.sender,
                        group_id,
                    }
                    .into());
                }
                let targets = members
                    .iter()
                    .copied()
                    .filter(|member| *member != payload.sender)
                    .collect();
                Ok(Recipients {
                    targets,
                    participants: members,
                })
            }
        }
    }

    /// 会话簿记失败只记录日志，不回滚持久化
    async fn record_conversations(
        &self,
        payload: &ChatPayload,
        recipients: &Recipients,
        message_id: MessageId,
    ) {
        for &user in &recipients.participants {
            let peer = peer_for(payload, user);
            if let Err(err) = self
                .conversations
                .touch_last_message(user, peer, message_id)
                .await
            {
                warn!(user_id = %user, peer = %peer, error = %err, "failed to update last message");
            }
        }

        for &user in &recipients.targets {
            let peer = peer_for(payload, user);
            if let Err(err) = self.conversations.increment_unread(user, peer).await {
                warn!(user_id = %user, peer = %peer, error = %err, "failed to increment unread count");
            }
        }
    }

    async fn sender_profile(&self, sender: UserId) -> UserProfile {
        match self.users.profile(sender).await {
            Ok(Some(profile)) => profile,
            Ok(None) => UserProfile::anonymous(sender),
            Err(err) => {
                warn!(user_id = %sender, error = %err, "failed to load sender profile");
                UserProfile::anonymous(sender)
            }
        }
    }
}

/// `user` 视角下这条消息所属的会话
fn peer_for(payload: &ChatPayload, user: UserId) -> ConversationPeer {
    match payload.target {
        ChatTarget::Direct(_) if user != payload.sender => ConversationPeer::User(payload.sender),
        _ => payload.peer_for_sender(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::{ContentKind, GroupId};

    #[test]
    fn direct_peer_is_the_other_participant() {
        let payload = ChatPayload::new(
            UserId(1),
            ChatTarget::Direct(UserId(2)),
            "hi",
            ContentKind::Text,
        )
        .unwrap();
        assert_eq!(peer_for(&payload, UserId(1)), ConversationPeer::User(UserId(2)));
        assert_eq!(peer_for(&payload, UserId(2)), ConversationPeer::User(UserId(1)));
    }

    #[test]
    fn group_peer_is_the_group_for_everyone() {
        let payload = ChatPayload::new(
            UserId(1),
            ChatTarget::Group(GroupId(5)),
            "hi",
            ContentKind::Text,
        )
        .unwrap();
        assert_eq!(peer_for(&payload, UserId(1)), ConversationPeer::Group(GroupId(5)));
        assert_eq!(peer_for(&payload, UserId(3)), ConversationPeer::Group(GroupId(5)));
    }
}
