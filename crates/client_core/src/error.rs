use shared::{domain::Axis, error::ScanConfigError};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("session is closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScanError {
    #[error("a scan task is already running")]
    AlreadyRunning,
    #[error("no scan task is running")]
    NotRunning,
    #[error("cannot reset position while a scan task is running")]
    ResetWhileRunning,
    #[error("scan configuration yields no positions")]
    NoPositions,
    #[error(transparent)]
    InvalidConfig(#[from] ScanConfigError),
    #[error(transparent)]
    Session(#[from] SessionError),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ControllerError {
    #[error("{axis} angle {value} is out of range")]
    InvalidAngle { axis: Axis, value: f64 },
    #[error("manual control is locked while a scan task is running")]
    ManualControlLocked,
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error(transparent)]
    Session(#[from] SessionError),
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to load settings: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid server url `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("invalid `{field}`: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}
