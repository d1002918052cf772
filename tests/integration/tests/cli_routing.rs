//! CLI binary integration tests.
//!
//! These run the compiled `pushgate` binary from the workspace target
//! directory and are skipped when it has not been built yet.

use std::path::PathBuf;
use std::process::Command;

fn pushgate_bin() -> Option<PathBuf> {
    let manifest_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    // tests/integration -> workspace root
    let workspace_root = manifest_dir.parent()?.parent()?;
    let bin = workspace_root.join("target").join("debug").join("pushgate");
    if bin.exists() {
        Some(bin)
    } else {
        eprintln!("pushgate binary not found at {}, skipping", bin.display());
        None
    }
}

fn pushgate_cmd() -> Option<Command> {
    let mut cmd = Command::new(pushgate_bin()?);
    cmd.env_remove("PUSHGATE_CONFIG");
    Some(cmd)
}

#[test]
fn test_cli_version() {
    let Some(mut cmd) = pushgate_cmd() else { return };
    let output = cmd.arg("version").output().expect("failed to run pushgate");
    assert!(output.status.success(), "version command should succeed");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.starts_with("pushgate "), "got: {}", stdout);
}

#[test]
fn test_cli_help_lists_commands() {
    let Some(mut cmd) = pushgate_cmd() else { return };
    let output = cmd.arg("--help").output().expect("failed to run pushgate");
    assert!(output.status.success(), "--help should succeed");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("serve"), "got: {}", stdout);
    assert!(stdout.contains("config"), "got: {}", stdout);
}

#[test]
fn test_cli_unknown_command() {
    let Some(mut cmd) = pushgate_cmd() else { return };
    let output = cmd.arg("nonexistent-command").output().expect("failed to run pushgate");
    assert!(!output.status.success(), "unknown command should fail");
}

#[test]
fn test_cli_config_validate_and_show() {
    let Some(_) = pushgate_bin() else { return };
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pushgate.json5");
    std::fs::write(
        &path,
        r#"{
            applications: [{ app_id: "shop", app_secret: "very-secret-9876" }],
            providers: [{ id: 1, provider_code: "zrwinfo", config: { access_key: "ak-000001" } }],
            channels: [{ id: 1, channel_id: 1, message_type: "sms", provider_account_id: 1 }],
        }"#,
    )
    .unwrap();

    let output = pushgate_cmd()
        .unwrap()
        .arg("--config")
        .arg(&path)
        .args(["config", "validate"])
        .output()
        .expect("failed to run pushgate config validate");
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("Configuration is valid"));

    let output = pushgate_cmd()
        .unwrap()
        .arg("--config")
        .arg(&path)
        .args(["config", "show"])
        .output()
        .expect("failed to run pushgate config show");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("****9876"), "got: {}", stdout);
    assert!(!stdout.contains("very-secret-9876"));
    assert!(!stdout.contains("ak-000001"));
}

#[test]
fn test_cli_config_validate_rejects_dangling_binding() {
    let Some(mut cmd) = pushgate_cmd() else { return };
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pushgate.json5");
    std::fs::write(
        &path,
        r#"{ channels: [{ id: 1, channel_id: 1, message_type: "sms", provider_account_id: 42 }] }"#,
    )
    .unwrap();

    let output = cmd
        .arg("--config")
        .arg(&path)
        .args(["config", "validate"])
        .output()
        .expect("failed to run pushgate config validate");
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("unknown provider account 42"));
}
