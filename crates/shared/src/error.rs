use thiserror::Error;

use crate::domain::SourceId;

/// Inbound payloads that cannot be turned into a typed message.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    MalformedFrame(#[source] serde_json::Error),
    #[error("frame element is not a JSON object")]
    NotAnObject,
    #[error("invalid `{action}` payload: {reason}")]
    InvalidPayload { action: String, reason: String },
}

impl ProtocolError {
    pub fn invalid_payload(action: impl Into<String>, reason: impl ToString) -> Self {
        Self::InvalidPayload {
            action: action.into(),
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScanConfigError {
    #[error("vertical angles must be between 1 and 10, got {0}")]
    VerticalAngles(u32),
    #[error("horizontal step must be between 1 and 90 degrees, got {0}")]
    HorizontalStep(u32),
    #[error("movement delay must be between 0.5 and 10 seconds, got {0}")]
    MovementDelay(f64),
}

/// Application-level failure reported by the service (`success: false`).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{action} failed: {message}")]
pub struct CommandFailure {
    pub action: String,
    pub source_id: Option<SourceId>,
    pub message: String,
}

impl CommandFailure {
    pub fn new(
        action: impl Into<String>,
        source_id: Option<SourceId>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            action: action.into(),
            source_id,
            message: message.into(),
        }
    }
}
