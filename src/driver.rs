//! Operating-system driver layer.
//!
//! The supervision engine never touches the OS directly; everything goes
//! through [`Driver`]. [`SystemDriver`] is the Linux implementation and
//! shells out to the usual tools:
//!
//! | Operation              | Backend                                  |
//! |------------------------|------------------------------------------|
//! | enumerate / status     | `/sys/class/net`                         |
//! | regulatory domain      | `iw reg set`                             |
//! | bring up (wireless)    | `wpa_cli add_network/set_network/...`    |
//! | bring up (IPv4)        | `ip addr`, `ip route`, `dhclient`        |
//! | name servers / domain  | `resolvectl dns/domain`                  |
//! | scan                   | `wpa_cli scan`, `wpa_cli scan_results`   |
//! | NTP                    | timesyncd drop-in + `systemctl restart`  |
//! | resolver cache         | `resolvectl flush-caches`                |
//! | resolution             | `tokio::net::lookup_host`                |

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::process::Command;

use crate::compiler::{DriverOptions, OptionValue};
use crate::error::NetworkError;

/// Snapshot of one interface as reported by the driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InterfaceStatus {
    pub name: String,
    /// Kernel operational state ("up", "down", "dormant", ...).
    pub operstate: String,
    pub mac_address: Option<String>,
    pub wireless: bool,
    pub is_usb: bool,
}

impl InterfaceStatus {
    pub fn is_up(&self) -> bool {
        self.operstate == "up"
    }
}

#[async_trait]
pub trait Driver: Send + Sync {
    async fn enumerate_interfaces(&self) -> Result<Vec<String>, NetworkError>;

    async fn interface_status(&self, name: &str) -> Result<InterfaceStatus, NetworkError>;

    async fn set_regulatory_domain(&self, domain: &str) -> Result<(), NetworkError>;

    async fn bring_up(&self, name: &str, options: &DriverOptions) -> Result<(), NetworkError>;

    /// Undo [`Driver::bring_up`]. Drivers without teardown support may keep
    /// the default no-op.
    async fn bring_down(&self, _name: &str) -> Result<(), NetworkError> {
        Ok(())
    }

    async fn request_scan(&self, name: &str) -> Result<(), NetworkError>;

    /// Raw scan result lines, one visible BSS per line.
    async fn poll_scan_results(&self, name: &str) -> Result<Vec<String>, NetworkError>;

    async fn set_ntp_servers(&self, servers: &[String]) -> Result<(), NetworkError>;

    async fn resolve_hostname(&self, name: &str) -> Result<Vec<IpAddr>, NetworkError>;

    async fn clear_resolver_cache(&self) -> Result<(), NetworkError>;
}

/// wpa_supplicant network keys whose values must be quoted strings.
const QUOTED_KEYS: [&str; 6] = ["ssid", "psk", "identity", "password", "phase1", "phase2"];

/// Keys that are passed straight to wpa_supplicant.
const WPA_KEYS: [&str; 11] = [
    "ssid", "psk", "scan_ssid", "key_mgmt", "pairwise", "group", "eap", "identity", "password",
    "phase1", "phase2",
];

/// What a bring-up left behind on an interface.
#[derive(Debug, Clone, Default)]
struct Lease {
    network_id: Option<String>,
    dhcp: bool,
}

/// Linux driver backed by sysfs and standard userspace tools.
#[derive(Debug, Clone)]
pub struct SystemDriver {
    sysfs_root: PathBuf,
    ntp_drop_in: PathBuf,
    bin_dir: Option<PathBuf>,
    leases: Arc<Mutex<HashMap<String, Lease>>>,
}

impl Default for SystemDriver {
    fn default() -> Self {
        Self {
            sysfs_root: PathBuf::from("/sys/class/net"),
            ntp_drop_in: PathBuf::from("/etc/systemd/timesyncd.conf.d/netsup.conf"),
            bin_dir: None,
            leases: Arc::default(),
        }
    }
}

impl SystemDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read interfaces from an alternate sysfs tree.
    pub fn with_sysfs_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.sysfs_root = root.into();
        self
    }

    /// Run tools from `dir` instead of `$PATH`.
    pub fn with_bin_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.bin_dir = Some(dir.into());
        self
    }

    async fn run(&self, program: &str, args: &[&str]) -> Result<String, NetworkError> {
        match &self.bin_dir {
            Some(dir) => run(&dir.join(program).to_string_lossy(), args).await,
            None => run(program, args).await,
        }
    }

    fn leases(&self) -> std::sync::MutexGuard<'_, HashMap<String, Lease>> {
        self.leases.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remove the wpa_supplicant network and DHCP client a previous
    /// bring-up left on `name`. Failures are logged; teardown carries on.
    async fn release(&self, name: &str) {
        let Some(lease) = self.leases().remove(name) else {
            return;
        };
        if let Some(id) = lease.network_id {
            if let Err(e) = self.wpa_cli(name, &["remove_network", &id]).await {
                tracing::warn!(interface = name, network_id = %id, "failed to remove network: {e}");
            }
        }
        if lease.dhcp {
            if let Err(e) = self.run("dhclient", &["-r", name]).await {
                tracing::warn!(interface = name, "failed to release DHCP lease: {e}");
            }
        }
    }

    async fn wpa_cli(&self, iface: &str, args: &[&str]) -> Result<String, NetworkError> {
        let mut full = vec!["-i", iface];
        full.extend_from_slice(args);
        let out = self.run("wpa_cli", &full).await?;
        // wpa_cli exits 0 even when the daemon rejects a command.
        if out.trim() == "FAIL" {
            return Err(NetworkError::CommandFailed {
                command: format!("wpa_cli {}", full.join(" ")),
                reason: "wpa_supplicant replied FAIL".to_string(),
            });
        }
        Ok(out)
    }

    async fn configure_wireless(&self, name: &str, options: &DriverOptions) -> Result<(), NetworkError> {
        let id = self.wpa_cli(name, &["add_network"]).await?;
        let id = id.trim().lines().last().unwrap_or_default().to_string();
        if id.parse::<u32>().is_err() {
            return Err(NetworkError::Parse(format!("unexpected network id '{id}'")));
        }
        self.leases().entry(name.to_string()).or_default().network_id = Some(id.clone());

        for key in WPA_KEYS.iter() {
            let Some(value) = options.get(*key) else {
                continue;
            };
            let value = wpa_value(key, value);
            self.wpa_cli(name, &["set_network", &id, key, &value]).await?;
        }

        self.wpa_cli(name, &["enable_network", &id]).await?;
        self.wpa_cli(name, &["select_network", &id]).await?;
        Ok(())
    }

    async fn configure_ipv4(&self, name: &str, options: &DriverOptions) -> Result<(), NetworkError> {
        let is_static = matches!(
            options.get("ipv4_address_method"),
            Some(OptionValue::Text(m)) if m == "static"
        );

        if is_static {
            let text = |key: &'static str| match options.get(key) {
                Some(OptionValue::Text(s)) => Ok(s.as_str()),
                _ => Err(NetworkError::MissingField { interface: name.to_string(), field: key }),
            };
            let address = text("ipv4_address")?;
            let gateway = text("ipv4_gateway")?;
            let prefix = netmask_to_prefix(text("ipv4_subnet_mask")?)?;

            self.run("ip", &["addr", "flush", "dev", name]).await?;
            self.run("ip", &["addr", "add", &format!("{address}/{prefix}"), "dev", name]).await?;
            self.run("ip", &["route", "replace", "default", "via", gateway, "dev", name]).await?;
        } else {
            self.run("dhclient", &["-nw", name]).await?;
            self.leases().entry(name.to_string()).or_default().dhcp = true;
        }

        if let Some(OptionValue::List(servers)) = options.get("nameservers") {
            let mut args = vec!["dns", name];
            args.extend(servers.iter().map(String::as_str));
            self.run("resolvectl", &args).await?;
        }
        if let Some(OptionValue::Text(domain)) = options.get("domain") {
            self.run("resolvectl", &["domain", name, domain]).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Driver for SystemDriver {
    async fn enumerate_interfaces(&self) -> Result<Vec<String>, NetworkError> {
        let mut entries = tokio::fs::read_dir(&self.sysfs_root)
            .await
            .map_err(|e| command_error(&format!("read_dir {}", self.sysfs_root.display()), e))?;

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| command_error("read_dir", e))?
        {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    async fn interface_status(&self, name: &str) -> Result<InterfaceStatus, NetworkError> {
        let base = self.sysfs_root.join(name);
        if !base.exists() {
            return Err(NetworkError::InterfaceNotFound(name.to_string()));
        }

        let read = |file: &str| {
            let path = base.join(file);
            async move {
                tokio::fs::read_to_string(path)
                    .await
                    .ok()
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
            }
        };

        Ok(InterfaceStatus {
            name: name.to_string(),
            operstate: read("operstate").await.unwrap_or_else(|| "unknown".to_string()),
            mac_address: read("address").await,
            wireless: base.join("wireless").exists() || base.join("phy80211").exists(),
            is_usb: is_usb_interface(&base),
        })
    }

    async fn set_regulatory_domain(&self, domain: &str) -> Result<(), NetworkError> {
        self.run("iw", &["reg", "set", domain]).await.map(drop)
    }

    async fn bring_up(&self, name: &str, options: &DriverOptions) -> Result<(), NetworkError> {
        // A restarted worker brings the interface up again without a
        // bring-down in between.
        self.release(name).await;
        self.run("ip", &["link", "set", name, "up"]).await?;
        if options.contains_key("ssid") {
            self.configure_wireless(name, options).await?;
        }
        self.configure_ipv4(name, options).await
    }

    async fn bring_down(&self, name: &str) -> Result<(), NetworkError> {
        self.release(name).await;
        self.run("ip", &["addr", "flush", "dev", name]).await?;
        self.run("ip", &["link", "set", name, "down"]).await.map(drop)
    }

    async fn request_scan(&self, name: &str) -> Result<(), NetworkError> {
        self.wpa_cli(name, &["scan"]).await.map(drop)
    }

    async fn poll_scan_results(&self, name: &str) -> Result<Vec<String>, NetworkError> {
        let out = self.wpa_cli(name, &["scan_results"]).await?;
        Ok(out.lines().map(str::to_string).collect())
    }

    async fn set_ntp_servers(&self, servers: &[String]) -> Result<(), NetworkError> {
        let body = format!("[Time]\nNTP={}\n", servers.join(" "));
        if let Some(parent) = self.ntp_drop_in.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| command_error("create timesyncd drop-in dir", e))?;
        }
        tokio::fs::write(&self.ntp_drop_in, body)
            .await
            .map_err(|e| command_error("write timesyncd drop-in", e))?;
        self.run("systemctl", &["restart", "systemd-timesyncd"]).await.map(drop)
    }

    async fn resolve_hostname(&self, name: &str) -> Result<Vec<IpAddr>, NetworkError> {
        let addrs = tokio::net::lookup_host((name, 0))
            .await
            .map_err(|e| NetworkError::Resolution {
                hostname: name.to_string(),
                reason: e.to_string(),
            })?;

        let mut ips: Vec<IpAddr> = Vec::new();
        for addr in addrs {
            if !ips.contains(&addr.ip()) {
                ips.push(addr.ip());
            }
        }
        if ips.is_empty() {
            return Err(NetworkError::Resolution {
                hostname: name.to_string(),
                reason: "no addresses returned".to_string(),
            });
        }
        Ok(ips)
    }

    async fn clear_resolver_cache(&self) -> Result<(), NetworkError> {
        self.run("resolvectl", &["flush-caches"]).await.map(drop)
    }
}

/// Run a command and return its stdout, mapping a non-zero exit to
/// [`NetworkError::CommandFailed`] with stderr (or stdout) as the reason.
async fn run(program: &str, args: &[&str]) -> Result<String, NetworkError> {
    let command = format!("{program} {}", args.join(" "));
    tracing::trace!(%command, "exec");

    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| command_error(&command, e))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let reason = if stderr.trim().is_empty() { stdout } else { stderr };
        return Err(NetworkError::CommandFailed {
            command,
            reason: reason.trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn command_error(command: &str, err: std::io::Error) -> NetworkError {
    NetworkError::CommandFailed {
        command: command.to_string(),
        reason: err.to_string(),
    }
}

/// Check if a network interface is USB-based by examining sysfs.
fn is_usb_interface(iface_dir: &Path) -> bool {
    let device = iface_dir.join("device");
    if !device.exists() {
        return false;
    }

    // The device link resolves through the USB bus for USB adapters.
    if let Ok(resolved) = std::fs::read_link(&device) {
        if resolved.to_string_lossy().contains("usb") {
            return true;
        }
    }

    std::fs::read_to_string(device.join("uevent"))
        .map(|content| content.contains("usb"))
        .unwrap_or(false)
}

/// Render an option for `wpa_cli set_network`.
///
/// String keys are quoted. An SSID that is not plain printable ASCII goes
/// out in hex form; other strings fall back to the `P"..."` escaped form. A
/// 64-digit hex PSK is a raw key and stays unquoted.
fn wpa_value(key: &str, value: &OptionValue) -> String {
    fn plain(s: &str) -> bool {
        s.bytes().all(|b| (0x20..0x7f).contains(&b) && b != b'"' && b != b'\\')
    }

    match value {
        OptionValue::Text(s) if key == "psk" && s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit()) => {
            s.clone()
        }
        OptionValue::Text(s) if QUOTED_KEYS.contains(&key) && plain(s) => format!("\"{s}\""),
        OptionValue::Text(s) if key == "ssid" => s.bytes().map(|b| format!("{b:02x}")).collect(),
        OptionValue::Text(s) if QUOTED_KEYS.contains(&key) => {
            let mut escaped = String::from("P\"");
            for b in s.bytes() {
                match b {
                    b'"' => escaped.push_str("\\\""),
                    b'\\' => escaped.push_str("\\\\"),
                    0x20..=0x7e => escaped.push(b as char),
                    _ => escaped.push_str(&format!("\\x{b:02x}")),
                }
            }
            escaped.push('"');
            escaped
        }
        OptionValue::Text(s) => s.clone(),
        OptionValue::Int(i) => i.to_string(),
        OptionValue::List(items) => items.join(" "),
    }
}

/// "255.255.255.0" -> 24. Non-contiguous masks are rejected.
pub fn netmask_to_prefix(mask: &str) -> Result<u32, NetworkError> {
    let bits = u32::from(
        mask.parse::<Ipv4Addr>()
            .map_err(|_| NetworkError::Parse(format!("invalid subnet mask '{mask}'")))?,
    );
    let prefix = bits.count_ones();
    if bits.checked_shl(prefix).unwrap_or(0) != 0 {
        return Err(NetworkError::Parse(format!("non-contiguous subnet mask '{mask}'")));
    }
    Ok(prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn netmask_prefixes() {
        assert_eq!(netmask_to_prefix("255.255.255.0").unwrap(), 24);
        assert_eq!(netmask_to_prefix("255.255.0.0").unwrap(), 16);
        assert_eq!(netmask_to_prefix("255.255.255.255").unwrap(), 32);
        assert_eq!(netmask_to_prefix("0.0.0.0").unwrap(), 0);
        assert!(netmask_to_prefix("255.0.255.0").is_err());
        assert!(netmask_to_prefix("not-a-mask").is_err());
    }

    #[tokio::test]
    async fn reads_interfaces_from_sysfs_tree() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        for (name, state) in [("lo", "unknown"), ("wlan0", "up"), ("eth0", "down")] {
            std::fs::create_dir_all(root.join(name)).unwrap();
            std::fs::write(root.join(name).join("operstate"), format!("{state}\n")).unwrap();
        }
        std::fs::create_dir_all(root.join("wlan0").join("wireless")).unwrap();
        std::fs::write(root.join("wlan0").join("address"), "aa:bb:cc:dd:ee:ff\n").unwrap();

        let driver = SystemDriver::new().with_sysfs_root(root);
        assert_eq!(
            driver.enumerate_interfaces().await.unwrap(),
            vec!["eth0", "lo", "wlan0"]
        );

        let wlan = driver.interface_status("wlan0").await.unwrap();
        assert!(wlan.wireless);
        assert!(wlan.is_up());
        assert!(!wlan.is_usb);
        assert_eq!(wlan.mac_address.as_deref(), Some("aa:bb:cc:dd:ee:ff"));

        let eth = driver.interface_status("eth0").await.unwrap();
        assert!(!eth.wireless);
        assert_eq!(eth.operstate, "down");

        assert!(matches!(
            driver.interface_status("wlan9").await,
            Err(NetworkError::InterfaceNotFound(_))
        ));
    }

    #[test]
    fn wpa_values_are_quoted_or_encoded() {
        let text = |s: &str| OptionValue::Text(s.to_string());
        assert_eq!(wpa_value("ssid", &text("Barn")), "\"Barn\"");
        assert_eq!(wpa_value("ssid", &text("a\"b")), "612262");
        assert_eq!(wpa_value("ssid", &text("caf\u{e9}")), "636166c3a9");
        assert_eq!(wpa_value("psk", &text("hunter22")), "\"hunter22\"");
        assert_eq!(wpa_value("psk", &text("say \"hi\"")), "P\"say \\\"hi\\\"\"");
        let raw = "0123456789abcdef".repeat(4);
        assert_eq!(wpa_value("psk", &text(&raw)), raw);
        assert_eq!(wpa_value("key_mgmt", &text("WPA-PSK")), "WPA-PSK");
        assert_eq!(wpa_value("scan_ssid", &OptionValue::Int(1)), "1");
        assert_eq!(
            wpa_value("pairwise", &OptionValue::List(vec!["CCMP".into(), "TKIP".into()])),
            "CCMP TKIP"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn bring_up_again_replaces_the_previous_network() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("calls.log");
        for tool in ["ip", "wpa_cli", "dhclient"] {
            let path = dir.path().join(tool);
            let script = format!(
                "#!/bin/sh\necho \"{tool} $*\" >> '{}'\ncase \"$*\" in *add_network*) echo 7;; *) echo OK;; esac\n",
                log.display()
            );
            std::fs::write(&path, script).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let driver = SystemDriver::new().with_bin_dir(dir.path());
        let mut options = DriverOptions::new();
        options.insert("ssid".into(), "Barn".into());
        options.insert("scan_ssid".into(), OptionValue::Int(1));
        driver.bring_up("wlan0", &options).await.unwrap();
        driver.bring_up("wlan0", &options).await.unwrap();
        driver.bring_down("wlan0").await.unwrap();

        let calls = std::fs::read_to_string(&log).unwrap();
        let count = |needle: &str| calls.lines().filter(|l| l.contains(needle)).count();
        assert_eq!(count("add_network"), 2);
        assert_eq!(count("remove_network 7"), 2);
        assert_eq!(count("dhclient -nw wlan0"), 2);
        assert_eq!(count("dhclient -r wlan0"), 2);
        assert!(calls.contains("set_network 7 ssid \"Barn\""));

        // Nothing left to release.
        driver.bring_down("wlan0").await.unwrap();
        let calls = std::fs::read_to_string(&log).unwrap();
        assert_eq!(calls.lines().filter(|l| l.contains("remove_network")).count(), 2);
    }
}
