use serde_json::Value;
use std::process::Command;
use tempfile::TempDir;

fn heartbridge(config_dir: &TempDir) -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_heartbridge"));
    command
        .arg("--config-dir")
        .arg(config_dir.path())
        .env("RUST_LOG", "off")
        .env("HEARTBRIDGE__LOGGING__DIR", config_dir.path().join("logs"))
        .env_remove("HEARTBRIDGE_USER")
        .env_remove("HEARTBRIDGE_PASSWORD");
    command
}

#[test]
fn test_config_command_prints_effective_config() {
    let config_dir = TempDir::new().unwrap();
    std::fs::write(
        config_dir.path().join("config.json"),
        r#"{"downstream":{"queue":"audit_queue"}}"#,
    )
    .unwrap();

    let output = heartbridge(&config_dir)
        .arg("config")
        .env("HEARTBRIDGE__UPSTREAM__HOST", "mq-a")
        .output()
        .expect("Failed to run heartbridge");
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let config: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(config["upstream"]["host"], "mq-a");
    assert_eq!(config["downstream"]["queue"], "audit_queue");
    assert_eq!(config["downstream"]["heartbeat_s"], 10);
}

#[test]
fn test_invalid_config_fails() {
    let config_dir = TempDir::new().unwrap();

    let output = heartbridge(&config_dir)
        .arg("config")
        .env("HEARTBRIDGE__DOWNSTREAM__HEARTBEAT_S", "1")
        .output()
        .expect("Failed to run heartbridge");
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("heartbeat_s"));
}
