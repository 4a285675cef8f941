use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure returned by a source handler's transform.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandleError {
    /// Transient problem (e.g. a lookup is temporarily unavailable). Retried.
    #[error("transform error: {0}")]
    Transform(String),

    /// The payload structurally cannot be mapped. Dead-lettered immediately.
    #[error("validation error: {0}")]
    Validation(String),
}

impl HandleError {
    pub fn transform(msg: impl Into<String>) -> Self {
        Self::Transform(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Transform(_) => FailureKind::Transform,
            Self::Validation(_) => FailureKind::Validation,
        }
    }
}

/// Classification of a message-level failure.
///
/// Recorded on dead letters so operators can tell a malformed input from a
/// message that simply ran out of attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Deserialization,
    Validation,
    Transform,
    Publish,
}

impl FailureKind {
    /// Whether another delivery attempt could change the outcome.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Transform | Self::Publish)
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Deserialization => "deserialization",
            Self::Validation => "validation",
            Self::Transform => "transform",
            Self::Publish => "publish",
        };
        f.write_str(s)
    }
}

/// Errors raised while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        assert!(FailureKind::Transform.is_retryable());
        assert!(FailureKind::Publish.is_retryable());
        assert!(!FailureKind::Validation.is_retryable());
        assert!(!FailureKind::Deserialization.is_retryable());
    }

    #[test]
    fn handle_error_maps_to_kind() {
        assert_eq!(HandleError::transform("lookup down").kind(), FailureKind::Transform);
        assert_eq!(HandleError::validation("no summary").kind(), FailureKind::Validation);
    }

    #[test]
    fn failure_kind_serializes_snake_case() {
        let json = serde_json::to_string(&FailureKind::Deserialization).unwrap();
        assert_eq!(json, "\"deserialization\"");
    }
}
