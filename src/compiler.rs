//! Compiles persisted interface records into driver-ready settings.
//!
//! A [`NetworkInterfaceRecord`] is generic over interface type and security
//! mode. [`compile_record`] branches on both and produces the concrete option
//! set the driver needs; [`to_driver_config`] additionally applies the
//! record's regulatory domain for wireless interfaces.
//!
//! # Option keys
//!
//! | Record                     | Options                                              |
//! |----------------------------|------------------------------------------------------|
//! | wired                      | IPv4 settings only                                   |
//! | wireless, `NONE`           | `ssid`, `scan_ssid`                                  |
//! | wireless, `WPA-PSK`        | `ssid`, `psk`, `scan_ssid`, `key_mgmt`               |
//! | wireless, `WPA-EAP`        | `ssid`, `scan_ssid`, `key_mgmt`, `pairwise`, `group`, `eap`, `identity`, `password`, `phase1`, `phase2` |
//!
//! IPv4 settings add `ipv4_address_method`, `ipv4_address`, `ipv4_gateway`
//! and `ipv4_subnet_mask` for static addressing, then `nameservers` and
//! `domain` when the record carries them.

use serde::Serialize;
use std::collections::BTreeMap;
use std::str::FromStr;

use crate::config::{DEFAULT_REGULATORY_DOMAIN, InterfaceType, Ipv4Method, NetworkInterfaceRecord};
use crate::driver::Driver;
use crate::error::NetworkError;

/// One driver option value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(untagged)]
pub enum OptionValue {
    Text(String),
    Int(i64),
    List(Vec<String>),
}

impl From<&str> for OptionValue {
    fn from(s: &str) -> Self {
        OptionValue::Text(s.to_string())
    }
}

impl From<String> for OptionValue {
    fn from(s: String) -> Self {
        OptionValue::Text(s)
    }
}

impl From<i64> for OptionValue {
    fn from(i: i64) -> Self {
        OptionValue::Int(i)
    }
}

impl From<Vec<String>> for OptionValue {
    fn from(items: Vec<String>) -> Self {
        OptionValue::List(items)
    }
}

pub type DriverOptions = BTreeMap<String, OptionValue>;

/// A compiled interface, immutable once built. A configuration change
/// produces a new value rather than editing this one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CompiledConfig {
    pub interface_name: String,
    #[serde(rename = "type")]
    pub interface_type: InterfaceType,
    pub driver_options: DriverOptions,
}

/// Driver options that carry credentials.
pub const SECRET_OPTIONS: [&str; 2] = ["psk", "password"];

impl CompiledConfig {
    pub fn is_wireless(&self) -> bool {
        self.interface_type == InterfaceType::Wireless
    }

    /// A copy with every credential replaced by a fixed mask, for display.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        for key in SECRET_OPTIONS {
            if let Some(value) = copy.driver_options.get_mut(key) {
                *value = OptionValue::Text("********".to_string());
            }
        }
        copy
    }
}

/// Wireless security modes understood by the compiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Security {
    None,
    WpaPsk,
    WpaEap,
}

impl FromStr for Security {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NONE" => Ok(Security::None),
            "WPA-PSK" => Ok(Security::WpaPsk),
            "WPA-EAP" => Ok(Security::WpaEap),
            _ => Err(()),
        }
    }
}

/// Compile a record without touching the driver.
pub fn compile_record(record: &NetworkInterfaceRecord) -> Result<CompiledConfig, NetworkError> {
    let driver_options = match record.interface_type {
        InterfaceType::Wired => ip_settings(record)?,
        InterfaceType::Wireless => {
            let mut options = wireless_settings(record)?;
            options.extend(ip_settings(record)?);
            options
        }
    };

    Ok(CompiledConfig {
        interface_name: record.name.clone(),
        interface_type: record.interface_type,
        driver_options,
    })
}

/// Compile a record and, for wireless interfaces, apply its regulatory
/// domain through the driver.
///
/// The regulatory domain is only applied once the record compiled; a failure
/// to set it is logged and does not fail compilation.
pub async fn to_driver_config(
    record: &NetworkInterfaceRecord,
    driver: &dyn Driver,
) -> Result<CompiledConfig, NetworkError> {
    let compiled = compile_record(record)?;

    if compiled.is_wireless() {
        let domain = record
            .regulatory_domain
            .as_deref()
            .filter(|d| !d.is_empty())
            .unwrap_or(DEFAULT_REGULATORY_DOMAIN);
        if let Err(e) = driver.set_regulatory_domain(domain).await {
            tracing::warn!(interface = %record.name, domain, "failed to set regulatory domain: {e}");
        }
    }

    Ok(compiled)
}

fn wireless_settings(record: &NetworkInterfaceRecord) -> Result<DriverOptions, NetworkError> {
    let raw = record.security.as_deref().unwrap_or("NONE");
    let security = raw.parse::<Security>().map_err(|_| NetworkError::UnsupportedSecurity {
        interface: record.name.clone(),
        security: raw.to_string(),
    })?;

    let ssid = required(record, "ssid", &record.ssid)?;
    let mut options = DriverOptions::new();
    options.insert("ssid".into(), ssid.into());
    options.insert("scan_ssid".into(), OptionValue::Int(1));

    match security {
        Security::None => {}
        Security::WpaPsk => {
            let psk = required(record, "psk", &record.psk)?;
            options.insert("psk".into(), psk.into());
            options.insert("key_mgmt".into(), "WPA-PSK".into());
        }
        Security::WpaEap => {
            let identity = required(record, "identity", &record.identity)?;
            let password = required(record, "password", &record.password)?;
            options.insert("key_mgmt".into(), "WPA-EAP".into());
            options.insert("pairwise".into(), "CCMP TKIP".into());
            options.insert("group".into(), "CCMP TKIP".into());
            options.insert("eap".into(), "PEAP".into());
            options.insert("identity".into(), identity.into());
            options.insert("password".into(), password.into());
            options.insert("phase1".into(), "peapver=auto".into());
            options.insert("phase2".into(), "MSCHAPV2".into());
        }
    }

    Ok(options)
}

/// IPv4 addressing, name servers and search domain for a record.
pub fn ip_settings(record: &NetworkInterfaceRecord) -> Result<DriverOptions, NetworkError> {
    let mut options = DriverOptions::new();

    if record.ipv4_method == Ipv4Method::Static {
        options.insert("ipv4_address_method".into(), "static".into());
        options.insert(
            "ipv4_address".into(),
            required(record, "ipv4_address", &record.ipv4_address)?.into(),
        );
        options.insert(
            "ipv4_gateway".into(),
            required(record, "ipv4_gateway", &record.ipv4_gateway)?.into(),
        );
        options.insert(
            "ipv4_subnet_mask".into(),
            required(record, "ipv4_subnet_mask", &record.ipv4_subnet_mask)?.into(),
        );
    }

    // Persisted as `name_servers`, emitted as `nameservers`. Stored configs
    // and the driver both depend on these exact keys.
    if let Some(servers) = record.name_servers.as_deref() {
        let servers: Vec<String> = servers.split_whitespace().map(str::to_string).collect();
        if !servers.is_empty() {
            options.insert("nameservers".into(), servers.into());
        }
    }

    if let Some(domain) = record.domain.as_deref().filter(|d| !d.is_empty()) {
        options.insert("domain".into(), domain.into());
    }

    Ok(options)
}

fn required<'a>(
    record: &NetworkInterfaceRecord,
    field: &'static str,
    value: &'a Option<String>,
) -> Result<&'a str, NetworkError> {
    value
        .as_deref()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| NetworkError::MissingField {
            interface: record.name.clone(),
            field,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockDriver;
    use pretty_assertions::assert_eq;

    fn keys(options: &DriverOptions) -> Vec<&str> {
        options.keys().map(String::as_str).collect()
    }

    fn static_wired() -> NetworkInterfaceRecord {
        let mut record = NetworkInterfaceRecord::wired("eth0");
        record.ipv4_method = Ipv4Method::Static;
        record.ipv4_address = Some("192.168.1.50".into());
        record.ipv4_gateway = Some("192.168.1.1".into());
        record.ipv4_subnet_mask = Some("255.255.255.0".into());
        record
    }

    #[test]
    fn wired_static_yields_exactly_four_keys() {
        let compiled = compile_record(&static_wired()).unwrap();
        assert_eq!(compiled.interface_name, "eth0");
        assert_eq!(
            keys(&compiled.driver_options),
            vec!["ipv4_address", "ipv4_address_method", "ipv4_gateway", "ipv4_subnet_mask"]
        );
        assert_eq!(
            compiled.driver_options["ipv4_address_method"],
            OptionValue::Text("static".into())
        );
    }

    #[test]
    fn wired_dhcp_yields_no_options() {
        let compiled = compile_record(&NetworkInterfaceRecord::wired("eth0")).unwrap();
        assert!(compiled.driver_options.is_empty());
    }

    #[test]
    fn name_servers_are_emitted_as_nameservers() {
        let mut record = static_wired();
        record.name_servers = Some("8.8.8.8 8.8.4.4".into());

        let options = compile_record(&record).unwrap().driver_options;
        assert_eq!(
            options.get("nameservers"),
            Some(&OptionValue::List(vec!["8.8.8.8".into(), "8.8.4.4".into()]))
        );
        // The persisted field name must never leak into driver options.
        assert!(!options.contains_key("name_servers"));
    }

    #[test]
    fn domain_is_added_when_present() {
        let mut record = NetworkInterfaceRecord::wired("eth0");
        record.domain = Some("farm.local".into());

        let options = compile_record(&record).unwrap().driver_options;
        assert_eq!(keys(&options), vec!["domain"]);
    }

    #[test]
    fn open_wireless_network() {
        let record = NetworkInterfaceRecord::wireless("wlan0", "Cafe", "NONE");
        let options = compile_record(&record).unwrap().driver_options;

        assert_eq!(keys(&options), vec!["scan_ssid", "ssid"]);
        assert_eq!(options["scan_ssid"], OptionValue::Int(1));
    }

    #[test]
    fn missing_security_is_treated_as_open() {
        let mut record = NetworkInterfaceRecord::wireless("wlan0", "Cafe", "NONE");
        record.security = None;
        assert!(compile_record(&record).is_ok());
    }

    #[test]
    fn wpa_psk_network_with_dhcp() {
        let mut record = NetworkInterfaceRecord::wireless("wlan0", "Barn", "WPA-PSK");
        record.psk = Some("hunter22".into());

        let options = compile_record(&record).unwrap().driver_options;
        assert_eq!(keys(&options), vec!["key_mgmt", "psk", "scan_ssid", "ssid"]);
        assert_eq!(options["key_mgmt"], OptionValue::Text("WPA-PSK".into()));
        assert_eq!(options["psk"], OptionValue::Text("hunter22".into()));
    }

    #[test]
    fn wpa_eap_network_has_full_option_set() {
        let mut record = NetworkInterfaceRecord::wireless("wlan0", "Campus", "WPA-EAP");
        record.identity = Some("farmer".into());
        record.password = Some("s3cret".into());

        let options = compile_record(&record).unwrap().driver_options;
        assert_eq!(options.len(), 10);
        assert_eq!(
            keys(&options),
            vec![
                "eap", "group", "identity", "key_mgmt", "pairwise", "password", "phase1",
                "phase2", "scan_ssid", "ssid"
            ]
        );
        assert_eq!(options["phase1"], OptionValue::Text("peapver=auto".into()));
        assert_eq!(options["phase2"], OptionValue::Text("MSCHAPV2".into()));
        assert_eq!(options["eap"], OptionValue::Text("PEAP".into()));
        assert_eq!(options["pairwise"], OptionValue::Text("CCMP TKIP".into()));
    }

    #[test]
    fn wireless_merges_ip_settings() {
        let mut record = NetworkInterfaceRecord::wireless("wlan0", "Barn", "NONE");
        record.ipv4_method = Ipv4Method::Static;
        record.ipv4_address = Some("10.0.0.2".into());
        record.ipv4_gateway = Some("10.0.0.1".into());
        record.ipv4_subnet_mask = Some("255.0.0.0".into());
        record.name_servers = Some("1.1.1.1".into());

        let options = compile_record(&record).unwrap().driver_options;
        assert_eq!(options.len(), 7);
        assert!(options.contains_key("nameservers"));
    }

    #[test]
    fn unsupported_security_fails_only_that_record() {
        let bad = NetworkInterfaceRecord::wireless("wlan0", "Old", "WEP");
        let good = NetworkInterfaceRecord::wireless("wlan1", "New", "NONE");

        let err = compile_record(&bad).unwrap_err();
        assert!(matches!(
            err,
            NetworkError::UnsupportedSecurity { ref security, .. } if security == "WEP"
        ));
        assert!(err.is_configuration_error());
        assert!(compile_record(&good).is_ok());
    }

    #[test]
    fn static_addressing_requires_all_fields() {
        let mut record = static_wired();
        record.ipv4_gateway = None;

        assert!(matches!(
            compile_record(&record),
            Err(NetworkError::MissingField { field: "ipv4_gateway", .. })
        ));
    }

    #[test]
    fn wired_records_ignore_security() {
        let mut record = NetworkInterfaceRecord::wired("eth0");
        record.security = Some("WEP".into());
        assert!(compile_record(&record).is_ok());
    }

    #[tokio::test]
    async fn regulatory_domain_applied_for_wireless_only() {
        let driver = MockDriver::new();

        let mut wireless = NetworkInterfaceRecord::wireless("wlan0", "Barn", "NONE");
        wireless.regulatory_domain = Some("DE".into());
        to_driver_config(&wireless, &driver).await.unwrap();
        to_driver_config(&NetworkInterfaceRecord::wired("eth0"), &driver)
            .await
            .unwrap();

        let mut no_domain = NetworkInterfaceRecord::wireless("wlan1", "Barn", "NONE");
        no_domain.regulatory_domain = None;
        to_driver_config(&no_domain, &driver).await.unwrap();

        assert_eq!(driver.regulatory_domains(), vec!["DE", DEFAULT_REGULATORY_DOMAIN]);
    }

    #[tokio::test]
    async fn failed_compilation_does_not_touch_driver() {
        let driver = MockDriver::new();
        let bad = NetworkInterfaceRecord::wireless("wlan0", "Old", "WEP");

        assert!(to_driver_config(&bad, &driver).await.is_err());
        assert!(driver.regulatory_domains().is_empty());
    }
}
