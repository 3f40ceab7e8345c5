use std::{
    collections::HashMap,
    env, fs,
    time::{SystemTime, UNIX_EPOCH},
};

use super::*;

fn no_env(_: &str) -> Option<String> {
    None
}

#[test]
fn missing_file_keeps_defaults() {
    let settings = load_settings_from(Path::new("does-not-exist.toml"), no_env);
    assert_eq!(settings, Settings::default());
}

#[test]
fn file_then_env_override_defaults() {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let path = env::temp_dir().join(format!("scanlink_device_sim_{suffix}.toml"));
    fs::write(
        &path,
        "bind_addr = \"0.0.0.0:9000\"\nsources = [\"cam-a\", \"cam-b\"]\npush_interval_ms = 250\n",
    )
    .expect("write settings");

    let from_file = load_settings_from(&path, no_env);
    assert_eq!(from_file.bind_addr, "0.0.0.0:9000");
    assert_eq!(from_file.sources, vec!["cam-a", "cam-b"]);
    assert_eq!(from_file.push_interval_ms, 250);

    let overrides: HashMap<&str, &str> = HashMap::from([
        ("SCANLINK_SIM__BIND_ADDR", "127.0.0.1:0"),
        ("SCANLINK_SIM__SOURCES", " front , ,rear "),
        ("SCANLINK_SIM__PUSH_INTERVAL_MS", "not-a-number"),
    ]);
    let settings = load_settings_from(&path, |key| overrides.get(key).map(|v| v.to_string()));
    fs::remove_file(&path).expect("cleanup");

    assert_eq!(settings.bind_addr, "127.0.0.1:0");
    assert_eq!(settings.sources, vec!["front", "rear"]);
    assert_eq!(settings.push_interval_ms, 250);
}

#[test]
fn push_interval_has_a_floor() {
    let settings = load_settings_from(Path::new("does-not-exist.toml"), |key| {
        (key == "SCANLINK_SIM__PUSH_INTERVAL_MS").then(|| "0".to_string())
    });
    assert_eq!(settings.push_interval_ms, 10);
}
