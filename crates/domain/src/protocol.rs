//! 实时通道的线上协议
//!
//! 每一帧都是一个 JSON 信封 `{type, action, msg_id, data}`。`data` 的形状由
//! `(type, action)` 决定，解码通过一张静态查找表完成。

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{ChatError, ErrorCode, ValidationReason};
use crate::message::{ChatPayload, ChatTarget, ContentKind, StoredMessage, UserProfile};
use crate::value_objects::{ConnectionId, GroupId, MessageId, UserId};

/// 信封的 `type` 字段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    System,
    Chat,
    Status,
    Ping,
    Pong,
    Error,
}

/// 信封的 `action` 字段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Send,
    Receive,
    Ack,
    Connected,
    OnlineStatus,
    Error,
    Response,
}

/// chat/send：客户端发出的消息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSendData {
    pub content: String,
    #[serde(default)]
    pub msg_type: ContentKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_user_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<GroupId>,
}

impl ChatSendData {
    pub fn direct(to: UserId, content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            msg_type: ContentKind::Text,
            to_user_id: Some(to),
            group_id: None,
        }
    }

    pub fn group(group: GroupId, content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            msg_type: ContentKind::Text,
            to_user_id: None,
            group_id: Some(group),
        }
    }

    /// 校验并转换为领域消息
    pub fn into_payload(self, sender: UserId) -> Result<ChatPayload, ValidationReason> {
        let target = ChatTarget::from_fields(self.to_user_id, self.group_id)?;
        ChatPayload::new(sender, target, self.content, self.msg_type)
    }
}

/// chat/receive：推送给接收者的消息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatReceiveData {
    pub message_id: MessageId,
    pub from_user_id: UserId,
    pub from_user: UserProfile,
    pub content: String,
    pub msg_type: ContentKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_user_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<GroupId>,
    /// 毫秒时间戳
    pub created_at: i64,
}

impl ChatReceiveData {
    pub fn from_persisted(
        payload: &ChatPayload,
        stored: &StoredMessage,
        from_user: UserProfile,
    ) -> Self {
        Self {
            message_id: stored.id,
            from_user_id: payload.sender,
            from_user,
            content: payload.content.clone(),
            msg_type: payload.kind,
            to_user_id: payload.target.to_user_id(),
            group_id: payload.target.group_id(),
            created_at: stored.created_at.timestamp_millis(),
        }
    }
}

/// chat/ack：持久化确认
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckData {
    pub message_id: MessageId,
    pub created_at: i64,
}

/// system/connected：握手完成
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectedData {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
}

/// status/online_status：好友上下线通知
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnlineStatusData {
    pub user_id: UserId,
    pub online: bool,
}

/// error/error：回传给发送者的错误
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorData {
    pub code: ErrorCode,
    pub message: String,
}

/// 按 `(type, action)` 区分的载荷
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    ChatSend(ChatSendData),
    ChatReceive(ChatReceiveData),
    Ack(AckData),
    Connected(ConnectedData),
    OnlineStatus(OnlineStatusData),
    Error(ErrorData),
    Empty,
}

/// 线上信封。值对象，只存活于一次分发过程。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub kind: FrameKind,
    pub action: Option<Action>,
    pub msg_id: Option<String>,
    pub payload: Payload,
}

#[derive(Serialize, Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: FrameKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    action: Option<Action>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    msg_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

type Decoder = fn(Value) -> Result<Payload, serde_json::Error>;

#[derive(Clone, Copy)]
enum ActionMatch {
    Exact(Action),
    Any,
}

impl ActionMatch {
    fn matches(self, action: Option<Action>) -> bool {
        match self {
            ActionMatch::Exact(expected) => action == Some(expected),
            ActionMatch::Any => true,
        }
    }
}

fn decode_chat_send(data: Value) -> Result<Payload, serde_json::Error> {
    serde_json::from_value(data).map(Payload::ChatSend)
}

fn decode_chat_receive(data: Value) -> Result<Payload, serde_json::Error> {
    serde_json::from_value(data).map(Payload::ChatReceive)
}

fn decode_ack(data: Value) -> Result<Payload, serde_json::Error> {
    serde_json::from_value(data).map(Payload::Ack)
}

fn decode_connected(data: Value) -> Result<Payload, serde_json::Error> {
    serde_json::from_value(data).map(Payload::Connected)
}

fn decode_online_status(data: Value) -> Result<Payload, serde_json::Error> {
    serde_json::from_value(data).map(Payload::OnlineStatus)
}

fn decode_error(data: Value) -> Result<Payload, serde_json::Error> {
    serde_json::from_value(data).map(Payload::Error)
}

fn decode_empty(_: Value) -> Result<Payload, serde_json::Error> {
    Ok(Payload::Empty)
}

/// `(type, action)` → 载荷解码器
const DECODERS: &[(FrameKind, ActionMatch, Decoder)] = &[
    (FrameKind::Chat, ActionMatch::Exact(Action::Send), decode_chat_send),
    (FrameKind::Chat, ActionMatch::Exact(Action::Receive), decode_chat_receive),
    (FrameKind::Chat, ActionMatch::Exact(Action::Ack), decode_ack),
    (FrameKind::System, ActionMatch::Exact(Action::Connected), decode_connected),
    (FrameKind::Status, ActionMatch::Exact(Action::OnlineStatus), decode_online_status),
    (FrameKind::Error, ActionMatch::Any, decode_error),
    (FrameKind::Ping, ActionMatch::Any, decode_empty),
    (FrameKind::Pong, ActionMatch::Any, decode_empty),
];

fn lookup_decoder(kind: FrameKind, action: Option<Action>) -> Option<Decoder> {
    DECODERS
        .iter()
        .find(|(k, a, _)| *k == kind && a.matches(action))
        .map(|(_, _, decoder)| *decoder)
}

impl Envelope {
    /// 解析一帧文本。格式错误或未知组合视为协议违规；chat/send 的 data
    /// 无法解析时返回 `InvalidPayload`，带上客户端的 msg_id 以便回传。
    pub fn decode(text: &str) -> Result<Self, ChatError> {
        let raw: RawEnvelope = serde_json::from_str(text)
            .map_err(|err| ChatError::protocol(format!("malformed envelope: {err}")))?;

        let decoder = lookup_decoder(raw.kind, raw.action).ok_or_else(|| {
            ChatError::protocol(format!(
                "unsupported frame {:?}/{:?}",
                raw.kind, raw.action
            ))
        })?;

        let is_chat_send = raw.kind == FrameKind::Chat && raw.action == Some(Action::Send);
        let payload = match decoder(raw.data.unwrap_or(Value::Null)) {
            Ok(payload) => payload,
            Err(err) if is_chat_send => {
                return Err(ChatError::InvalidPayload {
                    msg_id: raw.msg_id,
                    reason: err.to_string(),
                })
            }
            Err(err) => {
                return Err(ChatError::protocol(format!(
                    "invalid {:?} payload: {err}",
                    raw.kind
                )))
            }
        };

        Ok(Self {
            kind: raw.kind,
            action: raw.action,
            msg_id: raw.msg_id,
            payload,
        })
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        let data = match &self.payload {
            Payload::ChatSend(data) => Some(serde_json::to_value(data)?),
            Payload::ChatReceive(data) => Some(serde_json::to_value(data)?),
            Payload::Ack(data) => Some(serde_json::to_value(data)?),
            Payload::Connected(data) => Some(serde_json::to_value(data)?),
            Payload::OnlineStatus(data) => Some(serde_json::to_value(data)?),
            Payload::Error(data) => Some(serde_json::to_value(data)?),
            Payload::Empty => None,
        };

        serde_json::to_string(&RawEnvelope {
            kind: self.kind,
            action: self.action,
            msg_id: self.msg_id.clone(),
            data,
        })
    }

    pub fn ping() -> Self {
        Self {
            kind: FrameKind::Ping,
            action: None,
            msg_id: None,
            payload: Payload::Empty,
        }
    }

    pub fn pong(msg_id: Option<String>) -> Self {
        Self {
            kind: FrameKind::Pong,
            action: None,
            msg_id,
            payload: Payload::Empty,
        }
    }

    pub fn connected(connection_id: ConnectionId, user_id: UserId) -> Self {
        Self {
            kind: FrameKind::System,
            action: Some(Action::Connected),
            msg_id: None,
            payload: Payload::Connected(ConnectedData {
                connection_id,
                user_id,
            }),
        }
    }

    pub fn chat_send(msg_id: Option<String>, data: ChatSendData) -> Self {
        Self {
            kind: FrameKind::Chat,
            action: Some(Action::Send),
            msg_id,
            payload: Payload::ChatSend(data),
        }
    }

    pub fn receive(data: ChatReceiveData) -> Self {
        Self {
            kind: FrameKind::Chat,
            action: Some(Action::Receive),
            msg_id: None,
            payload: Payload::ChatReceive(data),
        }
    }

    pub fn ack(msg_id: Option<String>, stored: &StoredMessage) -> Self {
        Self {
            kind: FrameKind::Chat,
            action: Some(Action::Ack),
            msg_id,
            payload: Payload::Ack(AckData {
                message_id: stored.id,
                created_at: stored.created_at.timestamp_millis(),
            }),
        }
    }

    pub fn online_status(user_id: UserId, online: bool) -> Self {
        Self {
            kind: FrameKind::Status,
            action: Some(Action::OnlineStatus),
            msg_id: None,
            payload: Payload::OnlineStatus(OnlineStatusData { user_id, online }),
        }
    }

    pub fn error(msg_id: Option<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            kind: FrameKind::Error,
            action: Some(Action::Error),
            msg_id,
            payload: Payload::Error(ErrorData {
                code,
                message: message.into(),
            }),
        }
    }

    /// 由错误分类生成回传信封；不应回传的错误返回 `None`。
    pub fn from_error(msg_id: Option<String>, error: &ChatError) -> Option<Self> {
        error
            .wire_code()
            .map(|code| Self::error(msg_id, code, error.to_string()))
    }
}
