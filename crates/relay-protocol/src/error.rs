//! Error taxonomy for relay mesh operations.

use thiserror::Error;

/// Errors surfaced through the tool layer. Every variant renders as a
/// single trimmed line; the tool surface wraps it in an `{"error": …}`
/// envelope rather than a protocol-level failure.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("{0}")]
    InvalidArgument(String),
    #[error("agent not found: {0}")]
    AgentNotFound(String),
    #[error("sender agent not found: {0}")]
    SenderUnknown(String),
    #[error("target agent not found: {0}")]
    TargetUnknown(String),
    #[error("session_id is required (or must be present in request headers)")]
    SessionRequired,
    #[error("message not found: {0}")]
    MessageNotFound(String),
    #[error("transport: {0}")]
    Transport(String),
}

/// Convenience result type for relay mesh operations.
pub type RelayResult<T> = Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sender_unknown_names_the_agent() {
        let err = RelayError::SenderUnknown("ag-missing".to_owned());
        assert!(err.to_string().contains("sender agent not found"));
        assert!(err.to_string().contains("ag-missing"));
    }

    #[test]
    fn messages_are_single_line() {
        let errors = [
            RelayError::InvalidArgument("description is required".to_owned()),
            RelayError::AgentNotFound("ag-x".to_owned()),
            RelayError::SessionRequired,
            RelayError::Transport("publish failed".to_owned()),
        ];
        for err in errors {
            assert!(!err.to_string().contains('\n'));
        }
    }
}
