//! Typed error hierarchy for the deployment core.
//!
//! Every failure the pipeline, gateway, or API can produce is a
//! `DeployError`. The variant decides two things downstream: whether the
//! job queue may retry the deployment (`is_retryable`) and which HTTP
//! status the API layer maps it to.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("clone failed: {0}")]
    CloneFailed(String),

    #[error("build failed: {tail}")]
    BuildFailed { tail: String },

    #[error("image missing after build: {hint}")]
    ImageMissingAfterBuild { hint: String },

    #[error("container run failed: {0}")]
    RunFailed(String),

    #[error("command timed out after {seconds} seconds")]
    Timeout { seconds: u64 },

    #[error("queue backend unavailable: {0}")]
    QueueUnavailable(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl DeployError {
    /// Whether the job queue should re-deliver a deployment that failed
    /// with this error. User/input errors and terminal infrastructure
    /// errors are not retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DeployError::CloneFailed(_)
                | DeployError::BuildFailed { .. }
                | DeployError::ImageMissingAfterBuild { .. }
                | DeployError::RunFailed(_)
        )
    }
}

impl From<rusqlite::Error> for DeployError {
    fn from(err: rusqlite::Error) -> Self {
        DeployError::Database(err.to_string())
    }
}

impl From<std::io::Error> for DeployError {
    fn from(err: std::io::Error) -> Self {
        DeployError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_step_errors_are_retryable() {
        assert!(DeployError::CloneFailed("network".into()).is_retryable());
        assert!(DeployError::BuildFailed { tail: "npm ERR!".into() }.is_retryable());
        assert!(
            DeployError::ImageMissingAfterBuild { hint: "start script".into() }.is_retryable()
        );
        assert!(DeployError::RunFailed("port bound".into()).is_retryable());
    }

    #[test]
    fn user_and_terminal_errors_are_not_retryable() {
        assert!(!DeployError::NotFound("project 7".into()).is_retryable());
        assert!(!DeployError::Validation("bad command".into()).is_retryable());
        assert!(!DeployError::Unauthorized.is_retryable());
        assert!(!DeployError::Timeout { seconds: 30 }.is_retryable());
        assert!(!DeployError::QueueUnavailable("refused".into()).is_retryable());
        assert!(!DeployError::Database("locked".into()).is_retryable());
        assert!(!DeployError::Internal("bug".into()).is_retryable());
    }

    #[test]
    fn build_failed_carries_output_tail() {
        let err = DeployError::BuildFailed {
            tail: "error TS2304: cannot find name".into(),
        };
        assert!(err.to_string().contains("TS2304"));
    }

    #[test]
    fn timeout_message_names_the_limit() {
        let err = DeployError::Timeout { seconds: 30 };
        assert!(err.to_string().contains("30 seconds"));
    }

    #[test]
    fn io_errors_convert_to_internal() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: DeployError = io.into();
        assert!(matches!(err, DeployError::Internal(_)));
    }
}
