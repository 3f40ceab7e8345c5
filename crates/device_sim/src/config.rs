use std::{fs, path::Path};

use serde::Deserialize;

const SETTINGS_FILE: &str = "device_sim.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub bind_addr: String,
    pub sources: Vec<String>,
    pub push_interval_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8765".into(),
            sources: vec!["default".into(), "external_rtsp".into()],
            push_interval_ms: 1_000,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    bind_addr: Option<String>,
    sources: Option<Vec<String>>,
    push_interval_ms: Option<u64>,
}

pub fn load_settings() -> Settings {
    load_settings_from(Path::new(SETTINGS_FILE), |key| std::env::var(key).ok())
}

/// Defaults, then the TOML file at `path` if readable, then environment
/// overrides looked up through `env`.
pub fn load_settings_from(path: &Path, env: impl Fn(&str) -> Option<String>) -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<FileSettings>(&raw) {
            Ok(file_cfg) => apply_file(&mut settings, file_cfg),
            Err(err) => tracing::warn!(path = %path.display(), %err, "ignoring unreadable settings file"),
        }
    }

    if let Some(v) = env("SCANLINK_SIM__BIND_ADDR") {
        settings.bind_addr = v;
    }
    if let Some(v) = env("SCANLINK_SIM__SOURCES") {
        settings.sources = parse_sources(&v);
    }
    if let Some(v) = env("SCANLINK_SIM__PUSH_INTERVAL_MS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.push_interval_ms = parsed;
        }
    }

    settings.push_interval_ms = settings.push_interval_ms.max(10);
    settings
}

fn apply_file(settings: &mut Settings, file_cfg: FileSettings) {
    if let Some(v) = file_cfg.bind_addr {
        settings.bind_addr = v;
    }
    if let Some(v) = file_cfg.sources {
        settings.sources = v;
    }
    if let Some(v) = file_cfg.push_interval_ms {
        settings.push_interval_ms = v;
    }
}

/// Comma-separated source keys; blanks are dropped.
fn parse_sources(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|source| !source.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
