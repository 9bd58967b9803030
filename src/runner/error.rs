use redis::RedisError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Invalid enqueue request: {0}")]
    Validation(String),

    #[error("Queue is empty: {0}")]
    NotFound(String),

    #[error("Failed to deserialize entry from {key}: {source}")]
    Deserialize {
        key: String,
        entry: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Payload serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Queue store error: {0}")]
    Store(String),

    #[error("Redis pool error: {0}")]
    Pool(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Dispatcher is already running")]
    AlreadyRunning,
}

impl From<RedisError> for QueueError {
    fn from(err: RedisError) -> Self {
        QueueError::Store(err.to_string())
    }
}

impl From<figment::Error> for QueueError {
    fn from(err: figment::Error) -> Self {
        QueueError::Config(err.to_string())
    }
}

impl QueueError {
    /// `NotFound` is the ordinary "nothing to do" outcome of a pop.
    pub fn is_empty_queue(&self) -> bool {
        matches!(self, QueueError::NotFound(_))
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            QueueError::Store(_) => true,
            QueueError::Pool(_) => true,
            _ => false,
        }
    }
}
