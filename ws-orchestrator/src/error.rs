use thiserror::Error;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not supported: {0}")]
    Unsupported(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Runtime error: {0}")]
    Runtime(#[from] ws_core::Error),

    #[error("Proxy error: {0}")]
    Proxy(#[from] ws_proxy::ProxyError),

    #[error("Queue error: {0}")]
    Queue(#[from] ws_queue::QueueError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    /// HTTP status an API layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            OrchestratorError::NotFound(_) => 404,
            OrchestratorError::Conflict(_) => 409,
            OrchestratorError::InvalidInput(_) => 400,
            OrchestratorError::Unsupported(_) => 501,
            _ => 500,
        }
    }

    /// Whether the error is the caller's fault rather than an internal failure.
    pub fn is_user_facing(&self) -> bool {
        self.status_code() < 500
    }

    /// Map a validation failure from `ws-core` to [`OrchestratorError::InvalidInput`].
    pub(crate) fn invalid(err: ws_core::Error) -> Self {
        match err {
            ws_core::Error::Validation(message) => OrchestratorError::InvalidInput(message),
            other => OrchestratorError::InvalidInput(other.to_string()),
        }
    }
}
