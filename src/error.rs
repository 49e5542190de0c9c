use thiserror::Error;

/// Result alias used across the analyses.
pub type Result<T> = std::result::Result<T, AnalysisError>;

#[derive(Debug, Error)]
pub enum AnalysisError {
    /// The function handed over by the frontend does not describe a well-formed CFG.
    #[error("malformed input in `{function}`: {reason}")]
    MalformedInput { function: String, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AnalysisError {
    pub fn malformed(function: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedInput {
            function: function.into(),
            reason: reason.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn is_malformed_input(&self) -> bool {
        matches!(self, Self::MalformedInput { .. })
    }
}
