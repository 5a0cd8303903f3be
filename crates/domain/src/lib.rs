//! 实时聊天系统核心领域模型
//!
//! 包含标识符、聊天消息、线上信封与错误分类，以及实时子系统依赖的协作方接口。

pub mod errors;
pub mod message;
pub mod protocol;
pub mod repositories;
pub mod services;
pub mod value_objects;

// 重新导出常用类型
pub use errors::*;
pub use message::*;
pub use protocol::*;
pub use repositories::*;
pub use services::*;
pub use value_objects::*;
