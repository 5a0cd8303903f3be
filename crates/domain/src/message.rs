use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::ValidationReason;
use crate::value_objects::{ConversationPeer, GroupId, MessageId, UserId};

/// 单条消息允许的最大字符数
pub const MAX_CONTENT_CHARS: usize = 4096;

/// 消息内容类型，线上以整数 1/2/3 表示。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(try_from = "u8", into = "u8")]
pub enum ContentKind {
    #[default]
    Text,
    Image,
    Voice,
}

impl TryFrom<u8> for ContentKind {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ContentKind::Text),
            2 => Ok(ContentKind::Image),
            3 => Ok(ContentKind::Voice),
            other => Err(format!("unknown msg_type {other}")),
        }
    }
}

impl From<ContentKind> for u8 {
    fn from(value: ContentKind) -> Self {
        match value {
            ContentKind::Text => 1,
            ContentKind::Image => 2,
            ContentKind::Voice => 3,
        }
    }
}

/// 消息的投递目标：单聊或群聊，二者必居其一。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChatTarget {
    Direct(UserId),
    Group(GroupId),
}

impl ChatTarget {
    /// 由线上的两个可选字段构造目标，强制“恰好一个”。
    pub fn from_fields(
        to_user_id: Option<UserId>,
        group_id: Option<GroupId>,
    ) -> Result<Self, ValidationReason> {
        match (to_user_id, group_id) {
            (Some(user), None) => Ok(ChatTarget::Direct(user)),
            (None, Some(group)) => Ok(ChatTarget::Group(group)),
            (Some(_), Some(_)) => Err(ValidationReason::AmbiguousTarget),
            (None, None) => Err(ValidationReason::MissingTarget),
        }
    }

    pub fn to_user_id(&self) -> Option<UserId> {
        match self {
            ChatTarget::Direct(user) => Some(*user),
            ChatTarget::Group(_) => None,
        }
    }

    pub fn group_id(&self) -> Option<GroupId> {
        match self {
            ChatTarget::Direct(_) => None,
            ChatTarget::Group(group) => Some(*group),
        }
    }
}

/// 经过校验的聊天消息。
///
/// `message_id` 在持久化之前为空；扇出只会发生在它被赋值之后。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatPayload {
    pub sender: UserId,
    pub target: ChatTarget,
    pub content: String,
    pub kind: ContentKind,
    pub message_id: Option<MessageId>,
}

impl ChatPayload {
    pub fn new(
        sender: UserId,
        target: ChatTarget,
        content: impl Into<String>,
        kind: ContentKind,
    ) -> Result<Self, ValidationReason> {
        // 空白只用于判空，入库和推送的是原文
        let content = content.into();
        if content.trim().is_empty() {
            return Err(ValidationReason::EmptyContent);
        }
        let len = content.chars().count();
        if len > MAX_CONTENT_CHARS {
            return Err(ValidationReason::ContentTooLong {
                len,
                max: MAX_CONTENT_CHARS,
            });
        }

        Ok(Self {
            sender,
            target,
            content,
            kind,
            message_id: None,
        })
    }

    /// 写入持久化结果
    pub fn persisted(mut self, stored: &StoredMessage) -> Self {
        self.message_id = Some(stored.id);
        self
    }

    /// 发送者视角下的会话对端
    pub fn peer_for_sender(&self) -> ConversationPeer {
        match self.target {
            ChatTarget::Direct(user) => ConversationPeer::User(user),
            ChatTarget::Group(group) => ConversationPeer::Group(group),
        }
    }
}

/// 存储层返回的持久化结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: MessageId,
    pub created_at: DateTime<Utc>,
}

/// 接收者看到的发送者资料
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: UserId,
    pub nickname: String,
    #[serde(default)]
    pub avatar: Option<String>,
}

impl UserProfile {
    /// 资料查询失败时的兜底
    pub fn anonymous(id: UserId) -> Self {
        Self {
            id,
            nickname: format!("user-{}", id),
            avatar: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_is_kept_verbatim_and_must_not_be_blank() {
        let target = ChatTarget::Direct(UserId(2));
        let payload = ChatPayload::new(UserId(1), target, "  hi\n", ContentKind::Text).unwrap();
        assert_eq!(payload.content, "  hi\n");
        assert_eq!(payload.message_id, None);

        let err = ChatPayload::new(UserId(1), target, " \n\t ", ContentKind::Text).unwrap_err();
        assert_eq!(err, ValidationReason::EmptyContent);
    }

    #[test]
    fn content_longer_than_cap_is_rejected() {
        let long = "x".repeat(MAX_CONTENT_CHARS + 1);
        let err = ChatPayload::new(UserId(1), ChatTarget::Group(GroupId(1)), long, ContentKind::Text)
            .unwrap_err();
        assert!(matches!(err, ValidationReason::ContentTooLong { .. }));
    }

    #[test]
    fn exactly_one_target_is_required() {
        assert_eq!(
            ChatTarget::from_fields(Some(UserId(2)), None),
            Ok(ChatTarget::Direct(UserId(2)))
        );
        assert_eq!(
            ChatTarget::from_fields(None, Some(GroupId(5))),
            Ok(ChatTarget::Group(GroupId(5)))
        );
        assert_eq!(
            ChatTarget::from_fields(Some(UserId(2)), Some(GroupId(5))),
            Err(ValidationReason::AmbiguousTarget)
        );
        assert_eq!(
            ChatTarget::from_fields(None, None),
            Err(ValidationReason::MissingTarget)
        );
    }

    #[test]
    fn content_kind_uses_numeric_wire_values() {
        assert_eq!(serde_json::to_string(&ContentKind::Voice).unwrap(), "3");
        let kind: ContentKind = serde_json::from_str("2").unwrap();
        assert_eq!(kind, ContentKind::Image);
        assert!(serde_json::from_str::<ContentKind>("9").is_err());
    }
}
