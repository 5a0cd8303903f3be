//! 领域模型错误定义
//!
//! 实时消息子系统的错误分类：哪些错误回传给发送者、哪些只记录日志、
//! 哪些会导致连接关闭，都由这里的类型决定。

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::value_objects::{GroupId, UserId};

/// 发给客户端的机器可读错误码（`error` 信封中的 `code` 字段）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidPayload,
    EmptyContent,
    ContentTooLong,
    AmbiguousTarget,
    MissingTarget,
    NotGroupMember,
    RateLimited,
    PersistenceFailure,
}

/// 聊天载荷校验失败的原因
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationReason {
    #[error("message content is empty")]
    EmptyContent,
    #[error("message content too long: {len} > {max}")]
    ContentTooLong { len: usize, max: usize },
    #[error("exactly one of to_user_id / group_id must be set, got both")]
    AmbiguousTarget,
    #[error("exactly one of to_user_id / group_id must be set, got neither")]
    MissingTarget,
    #[error("user {user_id} is not a member of group {group_id}")]
    NotGroupMember { user_id: UserId, group_id: GroupId },
}

impl ValidationReason {
    pub fn code(&self) -> ErrorCode {
        match self {
            ValidationReason::EmptyContent => ErrorCode::EmptyContent,
            ValidationReason::ContentTooLong { .. } => ErrorCode::ContentTooLong,
            ValidationReason::AmbiguousTarget => ErrorCode::AmbiguousTarget,
            ValidationReason::MissingTarget => ErrorCode::MissingTarget,
            ValidationReason::NotGroupMember { .. } => ErrorCode::NotGroupMember,
        }
    }
}

/// 存储协作方返回的错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("{resource} {id} not found")]
    NotFound { resource: &'static str, id: String },
    #[error("storage constraint violated: {0}")]
    Constraint(String),
}

impl StorageError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }

    pub fn not_found(resource: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            resource,
            id: id.to_string(),
        }
    }
}

/// 认证协作方返回的错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("missing credential")]
    MissingToken,
    #[error("invalid credential: {0}")]
    InvalidToken(String),
    #[error("credential expired")]
    Expired,
}

/// 实时消息子系统的错误分类
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    /// 握手被拒绝，连接从未创建
    #[error("unauthenticated: {0}")]
    Unauthenticated(#[from] AuthError),

    /// 帧格式错误：记录日志、丢弃该帧，连接保持
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// chat/send 的 data 无法解析：回传 error 信封，连接保持
    #[error("invalid chat payload: {reason}")]
    InvalidPayload {
        msg_id: Option<String>,
        reason: String,
    },

    /// 聊天载荷不合法：回传 error 信封，连接保持
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationReason),

    /// 限流拒绝：回传 error 信封，连接保持
    #[error("rate limited")]
    RateLimited,

    /// 持久化失败：回传 error 信封，不扇出
    #[error("persistence failure: {0}")]
    PersistenceFailure(#[from] StorageError),

    /// 某个接收者不可达：只计数，不告知发送者
    #[error("delivery to user {0} failed")]
    DeliveryFailure(UserId),

    /// 传输层读写失败：连接被强制关闭
    #[error("transport failure: {0}")]
    TransportFailure(String),

    /// 心跳超时：连接被强制关闭
    #[error("heartbeat timeout")]
    HeartbeatTimeout,
}

impl ChatError {
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::ProtocolViolation(message.into())
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::TransportFailure(message.into())
    }

    /// 需要以 error 信封回传给发送者时的错误码
    pub fn wire_code(&self) -> Option<ErrorCode> {
        match self {
            ChatError::Validation(reason) => Some(reason.code()),
            ChatError::RateLimited => Some(ErrorCode::RateLimited),
            ChatError::PersistenceFailure(_) => Some(ErrorCode::PersistenceFailure),
            ChatError::InvalidPayload { .. } => Some(ErrorCode::InvalidPayload),
            ChatError::ProtocolViolation(_)
            | ChatError::Unauthenticated(_)
            | ChatError::DeliveryFailure(_)
            | ChatError::TransportFailure(_)
            | ChatError::HeartbeatTimeout => None,
        }
    }
}
