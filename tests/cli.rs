use std::fs;
use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use tempfile::tempdir;

fn netsup(config: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("netsup"));
    cmd.arg("--config").arg(config).env_remove("NETSUP_CONFIG");
    cmd
}

#[test]
fn save_interface_then_compile_emits_nameservers_key() {
    let dir = tempdir().expect("tempdir");
    let config = dir.path().join("config.toml");

    netsup(&config)
        .args([
            "save-interface",
            "eth0",
            "--type",
            "wired",
            "--ipv4-method",
            "static",
            "--ipv4-address",
            "192.168.1.50",
            "--ipv4-gateway",
            "192.168.1.1",
            "--ipv4-subnet-mask",
            "255.255.255.0",
            "--name-servers",
            "8.8.8.8 8.8.4.4",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("Saved interface 'eth0'"));

    let saved = fs::read_to_string(&config).expect("read config");
    assert!(saved.contains("name_servers = \"8.8.8.8 8.8.4.4\""));

    let output = netsup(&config).arg("compile").output().expect("compile output");
    assert!(output.status.success(), "compile should succeed");

    let compiled: Value = serde_json::from_slice(&output.stdout).expect("json parse");
    let options = &compiled[0]["driver_options"];
    assert_eq!(compiled[0]["interface_name"], "eth0");
    assert_eq!(options["ipv4_address"], "192.168.1.50");
    assert_eq!(options["nameservers"], serde_json::json!(["8.8.8.8", "8.8.4.4"]));
    assert!(options.get("name_servers").is_none());
}

#[test]
fn compile_reports_bad_records_and_keeps_good_ones() {
    let dir = tempdir().expect("tempdir");
    let config = dir.path().join("config.toml");
    fs::write(
        &config,
        r#"
[[interfaces]]
name = "wlan0"
type = "wireless"
ssid = "Barn"
security = "WEP"

[[interfaces]]
name = "wlan1"
type = "wireless"
ssid = "Field"
security = "WPA-PSK"
psk = "hunter22"
"#,
    )
    .expect("write config");

    let output = netsup(&config).arg("compile").output().expect("compile output");
    assert!(!output.status.success());

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Unsupported security mode 'WEP'"));

    let compiled: Value = serde_json::from_slice(&output.stdout).expect("json parse");
    let compiled = compiled.as_array().expect("array");
    assert_eq!(compiled.len(), 1);
    assert_eq!(compiled[0]["interface_name"], "wlan1");
    assert_eq!(compiled[0]["driver_options"]["key_mgmt"], "WPA-PSK");
    assert_eq!(compiled[0]["driver_options"]["scan_ssid"], 1);
}

#[test]
fn show_config_masks_secrets() {
    let dir = tempdir().expect("tempdir");
    let config = dir.path().join("config.toml");

    netsup(&config)
        .args([
            "save-interface",
            "wlan0",
            "--type",
            "wireless",
            "--ssid",
            "Barn",
            "--security",
            "WPA-PSK",
            "--psk",
            "supersecret",
        ])
        .assert()
        .success();

    netsup(&config)
        .arg("show-config")
        .assert()
        .success()
        .stdout(predicate::str::contains("wlan0"))
        .stdout(predicate::str::contains("Barn"))
        .stdout(predicate::str::contains("***********"))
        .stdout(predicate::str::contains("supersecret").not())
        .stdout(predicate::str::contains("NTP servers:  0.pool.ntp.org, 1.pool.ntp.org"));
}

#[test]
fn saving_same_interface_twice_replaces_it() {
    let dir = tempdir().expect("tempdir");
    let config = dir.path().join("config.toml");

    for ssid in ["Barn", "Field"] {
        netsup(&config)
            .args(["save-interface", "wlan0", "--type", "wireless", "--ssid", ssid])
            .assert()
            .success();
    }

    let saved = fs::read_to_string(&config).expect("read config");
    assert_eq!(saved.matches("[[interfaces]]").count(), 1);
    assert!(saved.contains("Field"));
}

#[test]
fn show_config_without_file() {
    let dir = tempdir().expect("tempdir");

    netsup(&dir.path().join("missing.toml"))
        .arg("show-config")
        .assert()
        .success()
        .stdout(predicate::str::contains("No saved interfaces."));
}
