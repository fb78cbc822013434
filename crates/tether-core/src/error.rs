//! Error taxonomy for orchestration operations.

use std::time::Duration;

use uuid::Uuid;

/// Errors raised by drivers, the tunnel allocator, the agent protocol and
/// the task service.
#[derive(Debug, thiserror::Error)]
pub enum TetherError {
    /// A computing resource lacks a parameter its kind needs, or the
    /// container cannot run on it. Raised before any subprocess runs.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A backend subprocess exited non-zero.
    #[error("`{command}` failed ({}): {stderr}", .exit_code.map_or_else(|| "signal".to_owned(), |c| format!("exit {c}")))]
    Execution {
        command: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    /// A backend subprocess did not finish in time and was killed.
    #[error("`{command}` timed out after {}s", .after.as_secs())]
    TimedOut { command: String, after: Duration },

    /// Lookup failed, or the object belongs to another user.
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    /// Malformed agent callback or unparseable backend output.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Every relay port is held by a live task.
    #[error("no free tunnel port in {first}..={last}")]
    TunnelPortsExhausted { first: u16, last: u16 },

    /// The operation is not allowed in the task's current state.
    #[error("{0}")]
    InvalidState(String),

    /// Rejected user input.
    #[error("invalid input: {0}")]
    Invalid(String),

    /// A callback presented a missing or wrong token.
    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl TetherError {
    pub fn not_found(entity: &'static str, id: Uuid) -> Self {
        Self::NotFound { entity, id }
    }

    /// Whether the error should be shown to the user verbatim. Execution
    /// failures and store errors are logged and reported generically.
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_)
                | Self::NotFound { .. }
                | Self::Protocol(_)
                | Self::TunnelPortsExhausted { .. }
                | Self::InvalidState(_)
                | Self::Invalid(_)
                | Self::Forbidden(_)
        )
    }
}

pub type Result<T, E = TetherError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_error_carries_stderr_verbatim() {
        let err = TetherError::Execution {
            command: "docker run".into(),
            exit_code: Some(125),
            stderr: "Unable to find image 'demo/image:latest' locally".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("exit 125"), "{msg}");
        assert!(msg.contains("Unable to find image"), "{msg}");
        assert!(!err.is_user_facing());
    }

    #[test]
    fn timed_out_reports_seconds() {
        let err = TetherError::TimedOut {
            command: "ssh".into(),
            after: Duration::from_secs(30),
        };
        assert_eq!(err.to_string(), "`ssh` timed out after 30s");
    }

    #[test]
    fn not_found_is_user_facing() {
        let id = Uuid::nil();
        let err = TetherError::not_found("task", id);
        assert_eq!(err.to_string(), format!("task {id} not found"));
        assert!(err.is_user_facing());
    }
}
