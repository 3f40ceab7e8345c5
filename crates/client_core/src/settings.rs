use std::{path::Path, time::Duration};

use serde::Deserialize;
use url::Url;

use crate::error::SettingsError;

const ENV_PREFIX: &str = "SCANLINK";
const DEFAULT_SETTINGS_FILE: &str = "scanlink";

/// How the command gate decides that the in-flight command was answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckDiscipline {
    /// Only a reply under the command's own action name, an explicit
    /// `ready` or a bare error releases the gate. Pushes leave it closed.
    #[default]
    ExplicitReply,
    /// Also accepts push names (`metrics`, `status`, `update_platform`, ...)
    /// as replies, for services that answer that way. A periodic push with
    /// the same name can then release the gate early.
    PushAlias,
    /// Any routed message releases the gate.
    AnyMessage,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControllerSettings {
    pub server_url: String,
    pub initial_retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    pub command_timeout_ms: u64,
    /// Upper bound on one connection attempt; expiry counts as a close.
    pub connect_timeout_ms: u64,
    pub ack_discipline: AckDiscipline,
    /// Queue `list_cameras` and `get_status` every time the channel opens.
    pub refresh_on_open: bool,
    pub event_capacity: usize,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:8765/ws".into(),
            initial_retry_delay_ms: 1_000,
            max_retry_delay_ms: 30_000,
            command_timeout_ms: 10_000,
            connect_timeout_ms: 10_000,
            ack_discipline: AckDiscipline::ExplicitReply,
            refresh_on_open: true,
            event_capacity: 1024,
        }
    }
}

impl ControllerSettings {
    /// Defaults, then `scanlink.toml` in the working directory if present,
    /// then `SCANLINK__*` environment variables.
    pub fn load() -> Result<Self, SettingsError> {
        Self::load_from(Path::new(DEFAULT_SETTINGS_FILE), false)
    }

    pub fn from_file(path: &Path) -> Result<Self, SettingsError> {
        Self::load_from(path, true)
    }

    fn load_from(path: &Path, required: bool) -> Result<Self, SettingsError> {
        let settings: Self = config::Config::builder()
            .add_source(config::File::from(path).required(required))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        validate_server_url(&self.server_url)?;
        if self.initial_retry_delay_ms == 0 {
            return Err(SettingsError::InvalidValue {
                field: "initial_retry_delay_ms",
                reason: "must be at least 1".into(),
            });
        }
        if self.connect_timeout_ms == 0 {
            return Err(SettingsError::InvalidValue {
                field: "connect_timeout_ms",
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }

    pub fn initial_retry_delay(&self) -> Duration {
        Duration::from_millis(self.initial_retry_delay_ms)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_millis(self.max_retry_delay_ms.max(self.initial_retry_delay_ms))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

pub fn validate_server_url(raw: &str) -> Result<Url, SettingsError> {
    let invalid = |reason: String| SettingsError::InvalidUrl {
        url: raw.to_string(),
        reason,
    };
    let url = Url::parse(raw).map_err(|err| invalid(err.to_string()))?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(invalid(format!("unsupported scheme `{other}`, expected ws or wss"))),
    }
}

#[cfg(test)]
#[path = "tests/settings_tests.rs"]
mod tests;
