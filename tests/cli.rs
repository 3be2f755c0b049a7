//! Smoke tests for the CLI surface. Anything touching a real block
//! device needs root and loop devices, so these stick to argument
//! handling.

use std::process::Command;

fn blockshift() -> Command {
    Command::new(env!("CARGO_BIN_EXE_blockshift"))
}

#[test]
fn help_lists_the_subcommands() {
    let output = blockshift().arg("--help").output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for cmd in ["to-lvm", "to-bcache", "resize", "rotate"] {
        assert!(stdout.contains(cmd), "--help does not mention {cmd}");
    }
}

#[test]
fn lvmify_is_an_alias() {
    let output = blockshift()
        .args(["lvmify", "--help"])
        .output()
        .unwrap();
    assert!(output.status.success());
}

#[test]
fn resize_rejects_malformed_sizes() {
    let output = blockshift()
        .args(["resize", "/dev/null", "12x"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("unit suffix"), "stderr: {stderr}");
}

#[test]
fn missing_device_is_a_usage_error() {
    let output = blockshift()
        .args(["resize", "/definitely/not/a/device", "1g"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn vg_name_and_join_conflict() {
    let output = blockshift()
        .args(["to-lvm", "--vg-name", "vg0", "--join", "vg1", "/dev/null"])
        .output()
        .unwrap();
    assert!(!output.status.success());
}
