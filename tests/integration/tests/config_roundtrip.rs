//! Config save/load roundtrip integration tests.

use pushgate_core::config::{Config, LogFormat};
use pushgate_core::types::{FailureRule, RuleAction, RuleScene};
use pushgate_integration_tests::{config, APP_SECRET, PROVIDER};
use std::path::Path;
use tempfile::TempDir;

#[test]
fn test_config_save_and_load() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("pushgate.json5");

    let mut original = config(Some("http://127.0.0.1:9/hook".to_string()));
    original.rules.push(
        FailureRule::new(7, RuleScene::SendFailure, RuleAction::Retry)
            .with_priority(10)
            .with_error_codes("E1,E2"),
    );
    original.save(&path).unwrap();

    let loaded = Config::load(&path).unwrap();
    assert_eq!(loaded.server.port, original.server.port);
    assert_eq!(loaded.queue.stream, original.queue.stream);
    assert_eq!(loaded.providers[0].provider_code, PROVIDER);
    assert_eq!(loaded.channels, original.channels);
    assert_eq!(loaded.rules, original.rules);
    // Secrets are written in clear so the file can be reloaded
    assert_eq!(loaded.applications[0].app_secret.expose_secret(), APP_SECRET);
    assert!(loaded.validate().is_ok());
}

#[test]
fn test_config_modify_and_reload() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("pushgate.json5");

    let mut original = Config::default();
    original.server.port = 9090;
    original.logging.format = LogFormat::Json;
    original.save(&path).unwrap();

    let loaded = Config::load(&path).unwrap();
    assert_eq!(loaded.server.port, 9090);
    assert_eq!(loaded.logging.format, LogFormat::Json);
}

#[test]
fn test_config_load_nonexistent() {
    let result = Config::load(Path::new("/nonexistent/pushgate.json5"));
    assert!(result.is_err());
}

#[test]
fn test_config_parse_invalid() {
    assert!(Config::parse("not valid json").is_err());
}

#[test]
fn test_cli_loader_reads_json5() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("pushgate.json5");
    std::fs::write(
        &path,
        r#"{
            // trailing commas and comments
            worker: { count: 3, },
            providers: [{ id: 1, provider_code: "zrwinfo" }],
            channels: [{ id: 1, channel_id: 2, message_type: "sms", provider_account_id: 1 }],
        }"#,
    )
    .unwrap();

    let loaded = pushgate_cli::load_config(Some(&path)).unwrap();
    assert_eq!(loaded.worker.count, 3);
    assert_eq!(loaded.channels[0].channel_id, 2);
}
