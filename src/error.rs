use thiserror::Error;

#[derive(Error, Debug)]
pub enum PyrunError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    #[error("TOML parse error: {0}")]
    TomlParse(String),

    // Validation errors
    #[error("No code provided")]
    EmptyCode,

    #[error("Invalid timeout of {seconds} seconds (allowed: 1..={max})")]
    InvalidTimeout { seconds: u64, max: u64 },

    // Sandbox errors
    #[error("Executor '{executor}' is not available: {reason}")]
    ExecutorUnavailable { executor: String, reason: String },

    #[error("Sandbox infrastructure error: {0}")]
    Infrastructure(String),

    #[error("Failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Internal error: {0}")]
    Internal(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Generic wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PyrunError {
    /// Errors the caller caused by sending a malformed request.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::EmptyCode | Self::InvalidTimeout { .. })
    }

    /// Sandbox-side failures a caller may resubmit after.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Infrastructure(_) | Self::ExecutorUnavailable { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, PyrunError>;
