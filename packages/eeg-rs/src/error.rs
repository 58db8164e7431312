use thiserror::Error;

#[derive(Error, Debug)]
pub enum EegError {
    #[error("Invalid buffer capacity: {0} (must be at least 1)")]
    InvalidCapacity(usize),

    #[error("Unknown channel: {0}")]
    UnknownChannel(String),

    #[error("Malformed burst for channel {channel}: {reason}")]
    MalformedBurst { channel: String, reason: String },

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Invalid stage transition: {0}")]
    InvalidStageTransition(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EegError {
    /// Short machine-readable code for status banners
    pub fn code(&self) -> &'static str {
        match self {
            EegError::InvalidCapacity(_) => "INVALID_CAPACITY",
            EegError::UnknownChannel(_) => "UNKNOWN_CHANNEL",
            EegError::MalformedBurst { .. } => "MALFORMED_BURST",
            EegError::BackendUnavailable(_) => "BACKEND_UNAVAILABLE",
            EegError::InvalidStageTransition(_) => "INVALID_STAGE_TRANSITION",
            EegError::InvalidConfig(_) => "INVALID_CONFIG",
            EegError::Io(_) => "IO_ERROR",
            EegError::Json(_) => "JSON_ERROR",
        }
    }
}

pub type EegResult<T> = std::result::Result<T, EegError>;
