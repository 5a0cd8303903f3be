use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("connection closed")]
    Closed,
    #[error("failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("pending queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },
    #[error("client has been stopped")]
    Stopped,
}
