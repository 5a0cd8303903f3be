//! 协作方接口定义
//!
//! 实时消息子系统只通过这些窄接口访问外部世界：消息存储、会话簿记、
//! 社交关系和用户资料。内层定义接口，外层（infrastructure）实现接口。

pub mod conversation_repository;
pub mod friend_repository;
pub mod message_repository;
pub mod user_repository;

pub use conversation_repository::ConversationBook;
pub use friend_repository::FriendGraph;
pub use message_repository::MessageStore;
pub use user_repository::UserDirectory;

#[cfg(feature = "testing")]
pub use conversation_repository::MockConversationBook;
#[cfg(feature = "testing")]
pub use friend_repository::MockFriendGraph;
#[cfg(feature = "testing")]
pub use message_repository::MockMessageStore;
#[cfg(feature = "testing")]
pub use user_repository::MockUserDirectory;
