//! CLI integration tests

use std::process::Command;

fn orchbench() -> Command {
    Command::new(env!("CARGO_BIN_EXE_orchbench"))
}

/// Test that the runner shows help
#[test]
fn test_cli_help() {
    let output = orchbench()
        .arg("--help")
        .output()
        .expect("Failed to execute command");

    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "Help should succeed");
    assert!(stdout.contains("--platform"), "Should show platform option");
    assert!(stdout.contains("--category"), "Should show category option");
    assert!(stdout.contains("--quick"), "Should show quick option");
    assert!(stdout.contains("--metrics-port"), "Should show metrics port option");
}

/// Test that --list prints every scenario without touching a cluster
#[test]
fn test_list_scenarios() {
    let output = orchbench()
        .arg("--list")
        .output()
        .expect("Failed to execute command");

    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "List should succeed");
    for name in [
        "fault-tolerance",
        "health-check",
        "resource-overhead",
        "rolling-update",
        "scheduling-overhead",
        "concurrent-deployments",
        "scalability",
        "service-discovery",
        "network-latency",
        "storage-persistence",
    ] {
        assert!(stdout.contains(name), "Should list {name}");
    }
}

/// Test that an unknown platform is rejected by argument parsing
#[test]
fn test_unknown_platform_rejected() {
    let output = orchbench()
        .args(["--platform", "mesos", "--list"])
        .output()
        .expect("Failed to execute command");

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("unknown platform"));
}

/// Test that an unknown category fails before any scenario runs
#[test]
fn test_unknown_category_fails() {
    let dir = tempfile::tempdir().unwrap();
    let output = orchbench()
        .args(["--category", "networking", "--log-format", "text"])
        .current_dir(dir.path())
        .env_remove("ORCHBENCH_CONFIG")
        .output()
        .expect("Failed to execute command");

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("unknown category"));
    assert!(!dir.path().join("results").exists());
}
