use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("UNAVAILABLE: {0}")]
    Unavailable(String),
    #[error("PROTOCOL_ERROR {code}: {message}")]
    Protocol {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },
    #[error("TIMEOUT: {method} did not respond within {timeout_ms}ms")]
    Timeout { method: String, timeout_ms: u64 },
    #[error("PROCESS_EXITED: {0}")]
    ProcessExited(String),
    #[error("VALIDATION: {0}")]
    Validation(String),
    #[error("IO_FAILURE: {0}")]
    Io(String),
    #[error("NOT_FOUND: {0}")]
    NotFound(String),
    #[error("INTERNAL: {0}")]
    Internal(String),
}

impl AppError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "unavailable",
            Self::Protocol { .. } => "protocol_error",
            Self::Timeout { .. } => "timeout",
            Self::ProcessExited(_) => "process_exited",
            Self::Validation(_) => "validation",
            Self::Io(_) => "io_failure",
            Self::NotFound(_) => "not_found",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(value: serde_json::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<serde_yaml::Error> for AppError {
    fn from(value: serde_yaml::Error) -> Self {
        Self::Validation(value.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(value: anyhow::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;
