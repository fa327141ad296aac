use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable that overrides the config file location.
pub const CONFIG_ENV: &str = "NETSUP_CONFIG";

pub const DEFAULT_DNS_NAME: &str = "example.com";
pub const DEFAULT_NTP_SERVERS: [&str; 2] = ["0.pool.ntp.org", "1.pool.ntp.org"];
pub const DEFAULT_REGULATORY_DOMAIN: &str = "US";
pub const DEFAULT_NOT_FOUND_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceType {
    Wired,
    Wireless,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ipv4Method {
    #[default]
    Dhcp,
    Static,
}

/// One persisted interface description.
///
/// `security` stays a free-form string so an unknown mode survives loading
/// and is rejected by the compiler for that record only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterfaceRecord {
    pub name: String,
    #[serde(rename = "type")]
    pub interface_type: InterfaceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub psk: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regulatory_domain: Option<String>,
    #[serde(default)]
    pub ipv4_method: Ipv4Method,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4_gateway: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4_subnet_mask: Option<String>,
    // Stored under this exact key. The compiled option is `nameservers`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_servers: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

impl NetworkInterfaceRecord {
    pub fn wired(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            interface_type: InterfaceType::Wired,
            security: None,
            ssid: None,
            psk: None,
            identity: None,
            password: None,
            regulatory_domain: None,
            ipv4_method: Ipv4Method::Dhcp,
            ipv4_address: None,
            ipv4_gateway: None,
            ipv4_subnet_mask: None,
            name_servers: None,
            domain: None,
        }
    }

    pub fn wireless(name: impl Into<String>, ssid: impl Into<String>, security: &str) -> Self {
        Self {
            interface_type: InterfaceType::Wireless,
            ssid: Some(ssid.into()),
            security: Some(security.to_string()),
            ..Self::wired(name)
        }
    }
}

/// Which typed view of a setting the caller wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    String,
    Bool,
    Float,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    String(String),
    Bool(bool),
    Float(f64),
}

impl ConfigValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ConfigValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ConfigValue::Float(f) => Some(*f),
            _ => None,
        }
    }
}

/// Read-only access to persisted configuration.
pub trait ConfigStore: Send + Sync {
    fn network_interface_records(&self) -> Vec<NetworkInterfaceRecord>;

    fn config_value(&self, kind: ValueKind, section: &str, key: &str) -> Option<ConfigValue>;
}

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub interfaces: Vec<NetworkInterfaceRecord>,
    /// `[settings.<section>]` tables of loosely typed values.
    #[serde(default)]
    pub settings: BTreeMap<String, toml::Table>,
}

impl Config {
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    pub fn find_interface(&self, name: &str) -> Option<&NetworkInterfaceRecord> {
        self.interfaces.iter().find(|r| r.name == name)
    }

    pub fn add_interface(&mut self, record: NetworkInterfaceRecord) {
        self.interfaces.retain(|r| r.name != record.name);
        self.interfaces.push(record);
    }

    pub fn set_value(&mut self, section: &str, key: &str, value: impl Into<toml::Value>) {
        self.settings
            .entry(section.to_string())
            .or_default()
            .insert(key.to_string(), value.into());
    }
}

impl ConfigStore for Config {
    fn network_interface_records(&self) -> Vec<NetworkInterfaceRecord> {
        self.interfaces.clone()
    }

    fn config_value(&self, kind: ValueKind, section: &str, key: &str) -> Option<ConfigValue> {
        let value = self.settings.get(section)?.get(key)?;
        match (kind, value) {
            (ValueKind::String, toml::Value::String(s)) => Some(ConfigValue::String(s.clone())),
            (ValueKind::Bool, toml::Value::Boolean(b)) => Some(ConfigValue::Bool(*b)),
            (ValueKind::Float, toml::Value::Float(f)) => Some(ConfigValue::Float(*f)),
            (ValueKind::Float, toml::Value::Integer(i)) => Some(ConfigValue::Float(*i as f64)),
            _ => None,
        }
    }
}

/// A store that re-reads the TOML file on every access, so edits made by
/// the CLI are picked up by a running supervisor on reload.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn snapshot(&self) -> Config {
        Config::load_from(&self.path).unwrap_or_else(|e| {
            tracing::warn!(path = %self.path.display(), "falling back to empty config: {e:#}");
            Config::default()
        })
    }
}

impl ConfigStore for FileStore {
    fn network_interface_records(&self) -> Vec<NetworkInterfaceRecord> {
        self.snapshot().interfaces
    }

    fn config_value(&self, kind: ValueKind, section: &str, key: &str) -> Option<ConfigValue> {
        self.snapshot().config_value(kind, section, key)
    }
}

/// Well-known settings consumed by the networking subsystem.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkSettings {
    pub api_server_url: Option<String>,
    pub default_dns_name: String,
    pub ntp_servers: [String; 2],
    pub not_found_timeout: Duration,
    pub scan_timeout: Duration,
}

impl NetworkSettings {
    pub fn from_store(store: &dyn ConfigStore) -> Self {
        let string = |section: &str, key: &str| {
            store
                .config_value(ValueKind::String, section, key)
                .and_then(|v| v.as_str().map(str::to_string))
                .filter(|s| !s.is_empty())
        };
        let seconds = |key: &str, default: Duration| {
            store
                .config_value(ValueKind::Float, "network", key)
                .and_then(|v| v.as_f64())
                .and_then(|s| Duration::try_from_secs_f64(s).ok())
                .filter(|d| !d.is_zero())
                .unwrap_or(default)
        };

        Self {
            api_server_url: string("authorization", "server"),
            default_dns_name: string("network", "default_dns_name")
                .unwrap_or_else(|| DEFAULT_DNS_NAME.to_string()),
            ntp_servers: [
                string("network", "ntp_server_1")
                    .unwrap_or_else(|| DEFAULT_NTP_SERVERS[0].to_string()),
                string("network", "ntp_server_2")
                    .unwrap_or_else(|| DEFAULT_NTP_SERVERS[1].to_string()),
            ],
            not_found_timeout: seconds("not_found_timeout_secs", DEFAULT_NOT_FOUND_TIMEOUT),
            scan_timeout: seconds("scan_timeout_secs", DEFAULT_SCAN_TIMEOUT),
        }
    }
}

pub fn config_path() -> Result<PathBuf> {
    if let Some(path) = std::env::var_os(CONFIG_ENV) {
        return Ok(PathBuf::from(path));
    }
    let config_dir = dirs::config_dir().context("Could not determine config directory")?;
    Ok(config_dir.join("netsup").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SAMPLE: &str = r#"
[[interfaces]]
name = "wlan0"
type = "wireless"
security = "WPA-PSK"
ssid = "Barn"
psk = "hunter22"
name_servers = "8.8.8.8 8.8.4.4"

[[interfaces]]
name = "eth0"
type = "wired"
ipv4_method = "static"
ipv4_address = "10.0.0.5"
ipv4_gateway = "10.0.0.1"
ipv4_subnet_mask = "255.255.255.0"

[settings.authorization]
server = "https://api.example.org"

[settings.network]
ntp_server_1 = "time.example.org"
not_found_timeout_secs = 5
"#;

    #[test]
    fn parses_records_with_historical_field_name() {
        let cfg: Config = toml::from_str(SAMPLE).unwrap();
        assert_eq!(cfg.interfaces.len(), 2);

        let wlan = cfg.find_interface("wlan0").unwrap();
        assert_eq!(wlan.interface_type, InterfaceType::Wireless);
        assert_eq!(wlan.name_servers.as_deref(), Some("8.8.8.8 8.8.4.4"));
        assert_eq!(wlan.ipv4_method, Ipv4Method::Dhcp);

        let eth = cfg.find_interface("eth0").unwrap();
        assert_eq!(eth.ipv4_method, Ipv4Method::Static);
    }

    #[test]
    fn serializes_name_servers_verbatim() {
        let mut record = NetworkInterfaceRecord::wired("eth0");
        record.name_servers = Some("1.1.1.1".into());
        let mut cfg = Config::default();
        cfg.add_interface(record);

        let text = toml::to_string_pretty(&cfg).unwrap();
        assert!(text.contains("name_servers = \"1.1.1.1\""));
        assert!(!text.contains("nameservers"));
    }

    #[test]
    fn typed_config_values() {
        let cfg: Config = toml::from_str(SAMPLE).unwrap();

        assert_eq!(
            cfg.config_value(ValueKind::String, "authorization", "server"),
            Some(ConfigValue::String("https://api.example.org".into()))
        );
        // Integers are widened for float lookups.
        assert_eq!(
            cfg.config_value(ValueKind::Float, "network", "not_found_timeout_secs"),
            Some(ConfigValue::Float(5.0))
        );
        assert_eq!(cfg.config_value(ValueKind::Bool, "authorization", "server"), None);
        assert_eq!(cfg.config_value(ValueKind::String, "missing", "server"), None);
    }

    #[test]
    fn settings_fall_back_to_defaults() {
        let cfg: Config = toml::from_str(SAMPLE).unwrap();
        let settings = NetworkSettings::from_store(&cfg);

        assert_eq!(settings.api_server_url.as_deref(), Some("https://api.example.org"));
        assert_eq!(settings.default_dns_name, DEFAULT_DNS_NAME);
        assert_eq!(settings.ntp_servers[0], "time.example.org");
        assert_eq!(settings.ntp_servers[1], DEFAULT_NTP_SERVERS[1]);
        assert_eq!(settings.not_found_timeout, Duration::from_secs(5));
        assert_eq!(settings.scan_timeout, DEFAULT_SCAN_TIMEOUT);
    }

    #[test]
    fn out_of_range_timeouts_use_defaults() {
        let mut cfg = Config::default();
        cfg.set_value("network", "not_found_timeout_secs", 1e20);
        cfg.set_value("network", "scan_timeout_secs", 0);
        let settings = NetworkSettings::from_store(&cfg);
        assert_eq!(settings.not_found_timeout, DEFAULT_NOT_FOUND_TIMEOUT);
        assert_eq!(settings.scan_timeout, DEFAULT_SCAN_TIMEOUT);

        cfg.set_value("network", "not_found_timeout_secs", -3.0);
        cfg.set_value("network", "scan_timeout_secs", 2.5);
        let settings = NetworkSettings::from_store(&cfg);
        assert_eq!(settings.not_found_timeout, DEFAULT_NOT_FOUND_TIMEOUT);
        assert_eq!(settings.scan_timeout, Duration::from_millis(2500));
    }

    #[test]
    fn add_interface_replaces_same_name() {
        let mut cfg = Config::default();
        cfg.add_interface(NetworkInterfaceRecord::wireless("wlan0", "A", "NONE"));
        cfg.add_interface(NetworkInterfaceRecord::wireless("wlan0", "B", "NONE"));

        assert_eq!(cfg.interfaces.len(), 1);
        assert_eq!(cfg.interfaces[0].ssid.as_deref(), Some("B"));
    }

    #[test]
    fn file_store_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let store = FileStore::new(&path);
        assert!(store.network_interface_records().is_empty());

        let mut cfg = Config::default();
        cfg.add_interface(NetworkInterfaceRecord::wired("eth0"));
        cfg.set_value("network", "default_dns_name", "probe.example.net");
        cfg.save_to(&path).unwrap();

        assert_eq!(store.network_interface_records().len(), 1);
        assert_eq!(
            NetworkSettings::from_store(&store).default_dns_name,
            "probe.example.net"
        );
    }
}
