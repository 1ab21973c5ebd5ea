//! Error types for the Keva operator

use thiserror::Error;

/// Errors that can occur during operator operations
#[derive(Error, Debug)]
pub enum OperatorError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Invalid spec; requires the user to change the object
    #[error("invalid spec: {0}")]
    InvalidSpec(String),

    /// An existing object matches an expected offshoot name but is not
    /// owned by this database; never adopted, requires operator action
    #[error("naming conflict: {kind} '{name}' exists but is not managed by this database")]
    NamingConflict { kind: String, name: String },

    /// Incoming spec does not match the parked origin spec
    #[error("dormant database mismatch: {0}")]
    DormantMismatch(String),

    /// Optimistic-concurrency retries exhausted
    #[error("write conflict not resolved after {attempts} attempts: {message}")]
    WriteConflict { attempts: u32, message: String },

    /// Reconciliation failed
    #[error("reconciliation failed: {0}")]
    ReconcileFailed(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Bounded wait for infrastructure convergence expired
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type for operator operations
pub type Result<T> = std::result::Result<T, OperatorError>;

impl OperatorError {
    /// Whether re-running reconciliation can resolve this error.
    ///
    /// User/spec errors and naming conflicts are not retryable: they only
    /// resolve when a human changes something.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OperatorError::KubeError(_)
                | OperatorError::Timeout(_)
                | OperatorError::WriteConflict { .. }
                | OperatorError::ReconcileFailed(_)
        )
    }

    /// Whether the error is caused by the user's spec rather than
    /// infrastructure
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            OperatorError::InvalidSpec(_) | OperatorError::DormantMismatch(_)
        )
    }

    /// Suggested requeue delay for retryable errors
    pub fn requeue_delay(&self) -> Option<std::time::Duration> {
        if self.is_retryable() {
            Some(std::time::Duration::from_secs(30))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_errors_are_not_retryable() {
        let err = OperatorError::InvalidSpec("cluster.master must be >= 3".into());
        assert!(!err.is_retryable());
        assert!(err.is_user_error());
        assert!(err.requeue_delay().is_none());
    }

    #[test]
    fn naming_conflict_is_terminal() {
        let err = OperatorError::NamingConflict {
            kind: "StatefulSet".into(),
            name: "mydb".into(),
        };
        assert!(!err.is_retryable());
        assert!(!err.is_user_error());
        assert!(err.to_string().contains("StatefulSet"));
        assert!(err.to_string().contains("mydb"));
    }

    #[test]
    fn infrastructure_errors_are_retryable() {
        let err = OperatorError::Timeout("pods not ready".into());
        assert!(err.is_retryable());
        assert!(err.requeue_delay().is_some());

        let err = OperatorError::WriteConflict {
            attempts: 5,
            message: "status".into(),
        };
        assert!(err.is_retryable());
    }
}
