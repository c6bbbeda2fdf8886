use thiserror::Error;

#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Provider call timed out: {0}")]
    ProviderTimeout(String),

    #[error("Required source missing: {0}")]
    RequiredSourceMissing(String),

    #[error("Scoring error: {0}")]
    ScoringError(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Timestamp parse error: {0}")]
    ParseDate(#[from] chrono::ParseError),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),
}

impl AnalysisError {
    /// Whether the queue worker should retry the job after backoff.
    /// Invariant violations are terminal: they indicate corrupted queue
    /// state, not a transient condition.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, AnalysisError::InvariantViolation(_))
    }
}
