// CLI integration tests for resolver-bridge

use std::process::Command;

#[test]
fn test_help_lists_subcommands() {
    let output = Command::new(env!("CARGO_BIN_EXE_resolver-bridge"))
        .arg("--help")
        .output()
        .expect("Failed to execute command");

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(output.status.success(), "Help should exit with success");
    assert!(stdout.contains("peer"), "Help should list peer. Got: {}", stdout);
    assert!(stdout.contains("ping"), "Help should list ping. Got: {}", stdout);
}

#[test]
fn test_ping_without_program_reports_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("bridge.toml");
    std::fs::write(&config, "[restart]\nbudget = 0\n").unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_resolver-bridge"))
        .arg("--config")
        .arg(&config)
        .arg("ping")
        .output()
        .expect("Failed to execute command");

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(!output.status.success());
    assert!(
        stderr.contains("subprocess.program"),
        "Should name the missing setting. Got: {}",
        stderr
    );
}

#[test]
fn test_peer_fails_without_listener() {
    // Bind and drop to get a port nobody listens on.
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();

    let output = Command::new(env!("CARGO_BIN_EXE_resolver-bridge"))
        .args(["peer", "--port", &port.to_string(), "--auth", "7"])
        .output()
        .expect("Failed to execute command");

    assert!(!output.status.success());
}
