use std::{
    env, fs,
    path::PathBuf,
    time::{SystemTime, UNIX_EPOCH},
};

use super::*;

fn temp_settings_path() -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time before unix epoch")
        .as_nanos();
    env::temp_dir().join(format!("scanlink-settings-{nanos}.toml"))
}

#[test]
fn defaults_point_at_local_device() {
    let settings = ControllerSettings::default();

    assert_eq!(settings.server_url, "ws://127.0.0.1:8765/ws");
    assert_eq!(settings.initial_retry_delay(), Duration::from_secs(1));
    assert_eq!(settings.max_retry_delay(), Duration::from_secs(30));
    assert_eq!(settings.command_timeout(), Duration::from_secs(10));
    assert_eq!(settings.connect_timeout(), Duration::from_secs(10));
    assert_eq!(settings.ack_discipline, AckDiscipline::ExplicitReply);
    assert!(settings.refresh_on_open);
    settings.validate().expect("defaults are valid");
}

#[test]
fn from_file_overrides_selected_keys() {
    let path = temp_settings_path();
    fs::write(
        &path,
        r#"
server_url = "wss://scanner.local:9000/ws"
initial_retry_delay_ms = 250
ack_discipline = "any_message"
refresh_on_open = false
"#,
    )
    .expect("write temp settings");

    let settings = ControllerSettings::from_file(&path).expect("settings load");
    let _ = fs::remove_file(&path);

    assert_eq!(settings.server_url, "wss://scanner.local:9000/ws");
    assert_eq!(settings.initial_retry_delay(), Duration::from_millis(250));
    assert_eq!(settings.max_retry_delay(), Duration::from_secs(30));
    assert_eq!(settings.ack_discipline, AckDiscipline::AnyMessage);
    assert!(!settings.refresh_on_open);
}

#[test]
fn from_file_rejects_non_websocket_url() {
    let path = temp_settings_path();
    fs::write(&path, "server_url = \"http://scanner.local/ws\"\n").expect("write temp settings");

    let err = ControllerSettings::from_file(&path).expect_err("http is not a websocket scheme");
    let _ = fs::remove_file(&path);

    assert!(matches!(err, SettingsError::InvalidUrl { .. }));
}

#[test]
fn missing_required_file_is_a_load_error() {
    let path = temp_settings_path();
    let err = ControllerSettings::from_file(&path).expect_err("file does not exist");
    assert!(matches!(err, SettingsError::Load(_)));
}

#[test]
fn validate_server_url_accepts_ws_and_wss_only() {
    assert!(validate_server_url("ws://127.0.0.1:8765/ws").is_ok());
    assert!(validate_server_url("wss://scanner.example/ws").is_ok());
    assert!(validate_server_url("not a url").is_err());
    assert!(validate_server_url("ftp://scanner.example").is_err());
}

#[test]
fn max_retry_delay_is_at_least_initial() {
    let settings = ControllerSettings {
        initial_retry_delay_ms: 5_000,
        max_retry_delay_ms: 1_000,
        ..ControllerSettings::default()
    };
    assert_eq!(settings.max_retry_delay(), Duration::from_secs(5));
}

#[test]
fn zero_retry_delay_is_rejected() {
    let settings = ControllerSettings {
        initial_retry_delay_ms: 0,
        ..ControllerSettings::default()
    };
    let err = settings.validate().expect_err("zero delay would reconnect in a hot loop");
    assert!(matches!(
        err,
        SettingsError::InvalidValue {
            field: "initial_retry_delay_ms",
            ..
        }
    ));

    let settings = ControllerSettings {
        connect_timeout_ms: 0,
        ..ControllerSettings::default()
    };
    assert!(matches!(
        settings.validate(),
        Err(SettingsError::InvalidValue {
            field: "connect_timeout_ms",
            ..
        })
    ));
}

#[test]
fn push_alias_discipline_parses_from_file() {
    let path = temp_settings_path();
    fs::write(
        &path,
        "ack_discipline = \"push_alias\"\nconnect_timeout_ms = 2500\n",
    )
    .expect("write temp settings");

    let settings = ControllerSettings::from_file(&path).expect("settings load");
    let _ = fs::remove_file(&path);

    assert_eq!(settings.ack_discipline, AckDiscipline::PushAlias);
    assert_eq!(settings.connect_timeout(), Duration::from_millis(2500));
}
