use super::*;

use std::{
    collections::HashMap,
    env,
    time::{SystemTime, UNIX_EPOCH},
};

#[test]
fn defaults_enable_queue_and_bounded_message_cache() {
    let config = ClientConfig::default();
    assert!(config.use_message_queue);
    assert_eq!(config.message_cache_size, 100);
    assert_eq!(config.connect_timeout(), Duration::from_secs(30));
}

#[test]
fn env_overrides_replace_file_values_and_skip_garbage() {
    let vars: HashMap<&str, &str> = [
        ("APP__API_URL", "http://127.0.0.1:9000/api"),
        ("APP__MESSAGE_CACHE_SIZE", "2"),
        ("APP__USE_MESSAGE_QUEUE", "false"),
        ("APP__CONNECT_TIMEOUT_MS", "not-a-number"),
    ]
    .into_iter()
    .collect();

    let config = apply_env_overrides(ClientConfig::default(), |key| {
        vars.get(key).map(|v| v.to_string())
    });

    assert_eq!(config.api_url, "http://127.0.0.1:9000/api");
    assert_eq!(config.message_cache_size, 2);
    assert!(!config.use_message_queue);
    assert_eq!(config.connect_timeout_ms, 30_000);
}

#[test]
fn partial_config_file_keeps_remaining_defaults() {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let path = env::temp_dir().join(format!("client_core_config_test_{suffix}.toml"));
    fs::write(&path, "message_cache_size = 5\nauto_reconnect = false\n").expect("write config");

    let config = load_config_file(&path).expect("load config");
    assert_eq!(config.message_cache_size, 5);
    assert!(!config.auto_reconnect);
    assert_eq!(config.api_url, ClientConfig::default().api_url);

    fs::remove_file(path).expect("cleanup");
}

#[test]
fn malformed_config_file_reports_path() {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let path = env::temp_dir().join(format!("client_core_bad_config_{suffix}.toml"));
    fs::write(&path, "message_cache_size = \"lots\"\n").expect("write config");

    let err = load_config_file(&path).expect_err("must fail");
    assert!(format!("{err:#}").contains("failed to parse client config"));

    fs::remove_file(path).expect("cleanup");
}

#[test]
fn max_reconnect_delay_never_below_initial_delay() {
    let config = ClientConfig {
        reconnect_delay_ms: 5_000,
        max_reconnect_delay_ms: 10,
        ..ClientConfig::default()
    };
    assert_eq!(config.max_reconnect_delay(), Duration::from_secs(5));
}
