//! Error types for collaborator calls

/// Result type for collaborator operations
pub type CollaboratorResult<T> = std::result::Result<T, CollaboratorError>;

/// Failures talking to an external collaborator.
///
/// None of these is a decision. A permission checker that is reachable and
/// says "no" returns a denied [`crate::PermissionDecision`], not an error.
#[derive(Debug, thiserror::Error)]
pub enum CollaboratorError {
    /// Collaborator could not be reached
    #[error("Collaborator unavailable: {0}")]
    Unavailable(String),

    /// Collaborator did not answer in time
    #[error("Collaborator timed out after {0}ms")]
    Timeout(u64),

    /// Collaborator answered with something unusable
    #[error("Invalid collaborator response: {0}")]
    InvalidResponse(String),

    /// Audit event could not be recorded
    #[error("Audit emission failed: {0}")]
    EmitFailed(String),
}

impl CollaboratorError {
    /// Check if the failure means the collaborator was never consulted
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            CollaboratorError::Unavailable(_) | CollaboratorError::Timeout(_)
        )
    }
}

impl From<serde_json::Error> for CollaboratorError {
    fn from(err: serde_json::Error) -> Self {
        CollaboratorError::InvalidResponse(format!("JSON error: {}", err))
    }
}
