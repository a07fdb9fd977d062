//! Error types for the agent runtime.

use thiserror::Error;

/// Errors raised by agents and their runtime.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Failure from the core crates (I/O, validation, timeouts).
    #[error(transparent)]
    Core(#[from] ecosmart_core::Error),

    #[error("Agent {0} is not running")]
    NotRunning(String),

    #[error("Agent {0} is already running")]
    AlreadyRunning(String),

    /// A tick panicked or otherwise failed outside the core taxonomy.
    #[error("Agent {agent} tick failed: {message}")]
    TickFailed { agent: String, message: String },

    /// The agent already reported `Stopped` and may not publish.
    #[error("Agent {0} is stopped")]
    Stopped(String),
}

impl AgentError {
    /// Whether a retry on the next tick may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            AgentError::Core(e) => e.is_transient(),
            AgentError::TickFailed { .. } => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;

#[cfg(test)]
mod tests {
    use super::*;
    use ecosmart_core::Error;

    #[test]
    fn test_core_errors_convert() {
        let err: AgentError = Error::timeout("weather fetch exceeded 5s").into();
        assert!(err.is_transient());
        assert_eq!(err.to_string(), "Timeout: weather fetch exceeded 5s");
    }

    #[test]
    fn test_lifecycle_errors_are_not_transient() {
        assert!(!AgentError::Stopped("monitor".into()).is_transient());
        assert_eq!(
            AgentError::AlreadyRunning("weather".into()).to_string(),
            "Agent weather is already running"
        );
    }
}
