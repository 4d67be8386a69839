use thiserror::Error;

#[derive(Error, Debug)]
pub enum BufferError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Buffer entry error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, BufferError>;
