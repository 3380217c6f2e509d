//! Error types for the counting core

/// Main error type for Podium operations
#[derive(Debug, thiserror::Error)]
pub enum PodiumError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Record is sealed: {0}")]
    RecordSealed(String),

    /// Storage-layer write failure. The in-memory store has no fallible
    /// writes; external [`RecordStore`](crate::store::RecordStore)
    /// implementations map their driver errors to this.
    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Access revoked for this record")]
    PermissionRevoked,

    #[error("Section ownership lost: {0}")]
    OwnershipLost(String),

    #[error("Subscription error: {0}")]
    Subscription(String),
}

impl PodiumError {
    /// Revocation is a quiet teardown, never surfaced as an alarm (the
    /// access grant was withdrawn mid-session, which is a normal event).
    pub fn is_quiet_termination(&self) -> bool {
        matches!(self, Self::PermissionRevoked)
    }
}

impl From<serde_json::Error> for PodiumError {
    fn from(err: serde_json::Error) -> Self {
        Self::Validation(format!("JSON error: {}", err))
    }
}

/// Result type alias for Podium operations
pub type Result<T> = std::result::Result<T, PodiumError>;
