use super::settings::Settings;
use super::{load_config, load_config_from};
use serial_test::serial;
use std::fs;
use std::time::Duration;
use tempfile::TempDir;

#[test]
fn test_default_settings() {
    let settings = Settings::default();
    assert_eq!(settings.server.host, "127.0.0.1");
    assert_eq!(settings.server.port, 8080);
    assert_eq!(settings.engine.tick_interval(), Duration::from_secs(1));
    assert_eq!(settings.engine.producer_max_retries, 5);
    assert_eq!(settings.connection.heartbeat_interval_ms, 30_000);
    assert_eq!(settings.connection.max_connection_lifetime(), None);
    assert_eq!(settings.client.max_retries, None);
    assert_eq!(settings.logging.level, "info");
}

#[test]
#[serial]
fn load_config_without_sources_uses_defaults() {
    let tmp = TempDir::new().expect("create tempdir");
    let missing = tmp.path().join("absent");

    let cfg = load_config_from(missing.to_str().unwrap()).expect("load_config failed");
    assert_eq!(cfg.server.port, 8080);
    assert_eq!(cfg.client.base_delay_ms, 500);
}

#[test]
#[serial]
fn load_config_from_file_overrides_defaults() {
    let tmp = TempDir::new().expect("create tempdir");
    let path = tmp.path().join("streamhub.toml");
    let toml = r#"
        [server]
        host = "0.0.0.0"
        port = 9000

        [engine]
        tick_interval_ms = 250

        [connection]
        max_connection_lifetime_ms = 60000

        [client]
        max_retries = 3
    "#;
    fs::write(&path, toml).expect("write config file");

    let cfg = load_config_from(path.to_str().unwrap()).expect("load_config failed");
    assert_eq!(cfg.server.host, "0.0.0.0");
    assert_eq!(cfg.server.port, 9000);
    assert_eq!(cfg.engine.tick_interval_ms, 250);
    // untouched keys in a partially specified section keep their defaults
    assert_eq!(cfg.engine.outbox_capacity, 1024);
    assert_eq!(
        cfg.connection.max_connection_lifetime(),
        Some(Duration::from_secs(60))
    );
    assert_eq!(cfg.client.max_retries, Some(3));
}

#[test]
#[serial]
fn environment_overrides_defaults() {
    temp_env::with_vars(
        [
            ("STREAMHUB__SERVER__PORT", Some("9100")),
            ("STREAMHUB__CONNECTION__HEARTBEAT_INTERVAL_MS", Some("5000")),
            ("STREAMHUB__LOGGING__LEVEL", Some("debug")),
        ],
        || {
            let cfg = load_config().expect("load_config failed");
            assert_eq!(cfg.server.port, 9100);
            assert_eq!(cfg.connection.heartbeat_interval_ms, 5000);
            assert_eq!(cfg.logging.level, "debug");
        },
    );
}
