use thiserror::Error;

#[derive(Debug, Error)]
pub enum EgressError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Provider HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Malformed payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Unexpected reply shape: {0}")]
    ReplyShape(String),
}

pub type Result<T> = std::result::Result<T, EgressError>;
