use thiserror::Error;

/// Top-level error for configuration and wiring. Subsystems carry their own
/// error enums; this one covers what the host process itself can fail at.
#[derive(Debug, Error)]
pub enum ConciergeError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ConciergeError {
    /// Short error code string recorded in logs and admin replies.
    pub fn code(&self) -> &'static str {
        match self {
            ConciergeError::Config(_) => "CONFIG_ERROR",
            ConciergeError::Serialization(_) => "SERIALIZATION_ERROR",
            ConciergeError::Io(_) => "IO_ERROR",
            ConciergeError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, ConciergeError>;
