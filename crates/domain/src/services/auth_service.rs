//! 握手认证接口
//!
//! 凭证对实时通道是不透明的：原样交给认证方，只关心它换出的用户 ID。

use async_trait::async_trait;

use crate::errors::AuthError;
use crate::value_objects::UserId;

#[cfg_attr(feature = "testing", mockall::automock)]
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn validate(&self, token: &str) -> Result<UserId, AuthError>;
}
