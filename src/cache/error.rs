use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Redis connection error: {0}")]
    ConnectionError(String),

    #[error("Redis command failed: {0}")]
    CommandError(String),
}

pub type CacheResult<T> = Result<T, CacheError>;

impl From<redis::RedisError> for CacheError {
    fn from(error: redis::RedisError) -> Self {
        Self::CommandError(error.to_string())
    }
}

impl From<bb8::RunError<redis::RedisError>> for CacheError {
    fn from(error: bb8::RunError<redis::RedisError>) -> Self {
        Self::ConnectionError(error.to_string())
    }
}
