//! Error types for the NodeServer interface.

use thiserror::Error;

/// Result type for interface operations.
pub type PolyResult<T> = Result<T, PolyError>;

/// Error type for the NodeServer interface.
///
/// Only [`PolyError::Identity`] is fatal to a process; every other variant is
/// caught where it occurs and logged.
#[derive(Debug, Error)]
pub enum PolyError {
    /// Connect, publish or subscribe failure on the broker connection
    #[error("Transport error: {0}")]
    Transport(String),

    /// Malformed payload or a message missing required fields
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Operation requires state that has not arrived yet (e.g. no config)
    #[error("State error: {0}")]
    State(String),

    /// Node lifecycle violation (unknown node, add denied)
    #[error("Lifecycle error: {0}")]
    Lifecycle(String),

    /// No profile number could be resolved
    #[error("Identity error: {0}")]
    Identity(String),

    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A second process-wide instance was requested
    #[error("Only one {0} is allowed per process")]
    Singleton(&'static str),

    /// JSON encode/decode failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PolyError {
    /// Protocol faults drop a single message, nothing else.
    pub fn is_protocol(&self) -> bool {
        matches!(self, Self::Protocol(_) | Self::Serialization(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(
            PolyError::Singleton("Controller").to_string(),
            "Only one Controller is allowed per process"
        );
        assert_eq!(
            PolyError::State("no config".into()).to_string(),
            "State error: no config"
        );
    }

    #[test]
    fn test_serde_error_is_protocol() {
        let err: PolyError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert!(err.is_protocol());
        assert!(!PolyError::Transport("x".into()).is_protocol());
    }
}
