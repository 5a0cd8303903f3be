pub mod auth_service;

pub use auth_service::Authenticator;
#[cfg(feature = "testing")]
pub use auth_service::MockAuthenticator;
