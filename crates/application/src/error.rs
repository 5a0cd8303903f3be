use domain::{ChatError, StorageError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApplicationError {
    #[error("chat error: {0}")]
    Chat(#[from] ChatError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("infrastructure error: {message}")]
    Infrastructure {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl ApplicationError {
    /// 创建基础设施错误
    pub fn infrastructure(message: impl Into<String>) -> Self {
        ApplicationError::Infrastructure {
            message: message.into(),
            source: None,
        }
    }

    pub fn infrastructure_with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        ApplicationError::Infrastructure {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}
