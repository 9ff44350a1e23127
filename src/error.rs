use thiserror::Error;

/// Errors raised while planning, reserving, or processing images.
#[derive(Error, Debug)]
pub enum ProcessingError {
    /// Required configuration (credentials, endpoint) is missing or invalid.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Network-level request failure with context.
    #[error("{context}: {source}")]
    Network {
        context: String,
        source: reqwest::Error,
    },

    /// The remote call did not answer in time.
    #[error("Request to {0} timed out")]
    Timeout(String),

    /// The remote endpoint rejected our credentials or signature.
    #[error("Authentication rejected (HTTP {status}): {message}")]
    Auth { status: u16, message: String },

    /// The remote endpoint returned a non-success status.
    #[error("Remote processing failed (HTTP {status}): {message}")]
    Remote { status: u16, message: String },

    /// Image decode/encode failure.
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// Processing was cancelled cooperatively.
    #[error("Processing was cancelled")]
    Cancelled,

    /// A reservation would exceed the remaining quota.
    #[error("Quota exceeded: requested {requested}, remaining {remaining}")]
    QuotaExceeded { requested: u32, remaining: u32 },

    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Invalid status transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: String,
        from: String,
        to: String,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<anyhow::Error> for ProcessingError {
    fn from(err: anyhow::Error) -> Self {
        ProcessingError::Other(format!("{:#}", err))
    }
}

impl ProcessingError {
    /// Whether a retry of the same request could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ProcessingError::Network { .. } | ProcessingError::Timeout(_) => true,
            ProcessingError::Remote { status, .. } => {
                *status == 408 || *status == 429 || *status >= 500
            }
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ProcessingError::Cancelled)
    }

    /// Message shown on the job's tile.
    pub fn user_message(&self) -> String {
        match self {
            ProcessingError::Network { .. } | ProcessingError::Timeout(_) => {
                "Could not reach the processing service, please try again".to_string()
            }
            ProcessingError::Auth { .. } => {
                "The processing service rejected the request signature".to_string()
            }
            ProcessingError::Remote { message, .. } if !message.is_empty() => message.clone(),
            ProcessingError::Remote { status, .. } => {
                format!("Processing failed (HTTP {})", status)
            }
            other => other.to_string(),
        }
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, ProcessingError>;
