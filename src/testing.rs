//! Scripted [`Driver`] for tests.
//!
//! Responses are queued per call site; once a queue drains, the last
//! response keeps being returned. Every side-effecting call is recorded so
//! tests can assert on what the engine asked the OS to do.
//!
//! ```rust,ignore
//! let driver = MockDriver::new()
//!     .with_enumerations(vec![vec!["lo"], vec!["lo", "wlan0"]])
//!     .with_scan_results("wlan0", vec![vec![], vec!["aa:bb\t2412\t-40\t[ESS]\tBarn"]]);
//! ```

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::compiler::DriverOptions;
use crate::driver::{Driver, InterfaceStatus};
use crate::error::NetworkError;

#[derive(Default)]
struct Script {
    enumerations: VecDeque<Vec<String>>,
    scan_results: HashMap<String, VecDeque<Vec<String>>>,
    resolutions: HashMap<String, Vec<IpAddr>>,
    failing_bring_up: HashSet<String>,
    unplugged: HashSet<String>,
    statuses: HashMap<String, InterfaceStatus>,
}

#[derive(Default)]
struct Calls {
    enumerate: usize,
    regulatory_domains: Vec<String>,
    bring_ups: Vec<(String, DriverOptions)>,
    bring_downs: Vec<String>,
    scan_requests: Vec<String>,
    polls: usize,
    ntp_servers: Vec<Vec<String>>,
    resolves: Vec<String>,
    cache_clears: usize,
}

#[derive(Default)]
pub struct MockDriver {
    script: Mutex<Script>,
    calls: Mutex<Calls>,
}

fn pop_or_repeat<T: Clone + Default>(queue: &mut VecDeque<T>) -> T {
    if queue.len() > 1 {
        queue.pop_front().unwrap_or_default()
    } else {
        queue.front().cloned().unwrap_or_default()
    }
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn calls(&self) -> MutexGuard<'_, Calls> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Successive `enumerate_interfaces` results.
    pub fn with_enumerations<S: Into<String>>(self, rounds: Vec<Vec<S>>) -> Self {
        {
            let mut script = self.script();
            script.enumerations = rounds
                .into_iter()
                .map(|r| r.into_iter().map(Into::into).collect())
                .collect();
        }
        self
    }

    /// Successive raw `poll_scan_results` outputs for `iface`.
    pub fn with_scan_results<S: Into<String>>(self, iface: &str, rounds: Vec<Vec<S>>) -> Self {
        {
            let mut script = self.script();
            script.scan_results.insert(
                iface.to_string(),
                rounds
                    .into_iter()
                    .map(|r| r.into_iter().map(Into::into).collect())
                    .collect(),
            );
        }
        self
    }

    pub fn with_resolution(self, hostname: &str, addrs: Vec<IpAddr>) -> Self {
        self.script()
            .resolutions
            .insert(hostname.to_string(), addrs);
        self
    }

    pub fn with_status(self, status: InterfaceStatus) -> Self {
        self.script()
            .statuses
            .insert(status.name.clone(), status);
        self
    }

    /// Make `bring_up` fail for `iface` until [`MockDriver::heal`] is called.
    pub fn fail_bring_up(&self, iface: &str) {
        self.script()
            .failing_bring_up
            .insert(iface.to_string());
    }

    pub fn heal(&self, iface: &str) {
        self.script().failing_bring_up.remove(iface);
    }

    /// Make `interface_status` report `iface` as gone, as after a hot unplug.
    pub fn unplug(&self, iface: &str) {
        self.script().unplugged.insert(iface.to_string());
    }

    pub fn plug(&self, iface: &str) {
        self.script().unplugged.remove(iface);
    }

    pub fn enumerate_calls(&self) -> usize {
        self.calls().enumerate
    }

    pub fn regulatory_domains(&self) -> Vec<String> {
        self.calls().regulatory_domains.clone()
    }

    pub fn bring_ups(&self) -> Vec<(String, DriverOptions)> {
        self.calls().bring_ups.clone()
    }

    pub fn bring_up_count(&self, iface: &str) -> usize {
        self.calls()
            .bring_ups
            .iter()
            .filter(|(name, _)| name == iface)
            .count()
    }

    pub fn bring_downs(&self) -> Vec<String> {
        self.calls().bring_downs.clone()
    }

    pub fn scan_requests(&self) -> Vec<String> {
        self.calls().scan_requests.clone()
    }

    pub fn poll_count(&self) -> usize {
        self.calls().polls
    }

    pub fn ntp_servers(&self) -> Vec<Vec<String>> {
        self.calls().ntp_servers.clone()
    }

    pub fn resolves(&self) -> Vec<String> {
        self.calls().resolves.clone()
    }

    pub fn cache_clears(&self) -> usize {
        self.calls().cache_clears
    }
}

#[async_trait]
impl Driver for MockDriver {
    async fn enumerate_interfaces(&self) -> Result<Vec<String>, NetworkError> {
        self.calls().enumerate += 1;
        Ok(pop_or_repeat(&mut self.script().enumerations))
    }

    async fn interface_status(&self, name: &str) -> Result<InterfaceStatus, NetworkError> {
        let script = self.script();
        if script.unplugged.contains(name) {
            return Err(NetworkError::InterfaceNotFound(name.to_string()));
        }
        Ok(script.statuses.get(name).cloned().unwrap_or_else(|| InterfaceStatus {
            name: name.to_string(),
            operstate: "up".to_string(),
            mac_address: None,
            wireless: name.starts_with("wl"),
            is_usb: false,
        }))
    }

    async fn set_regulatory_domain(&self, domain: &str) -> Result<(), NetworkError> {
        self.calls()
            .regulatory_domains
            .push(domain.to_string());
        Ok(())
    }

    async fn bring_up(&self, name: &str, options: &DriverOptions) -> Result<(), NetworkError> {
        self.calls()
            .bring_ups
            .push((name.to_string(), options.clone()));
        if self.script().failing_bring_up.contains(name) {
            return Err(NetworkError::CommandFailed {
                command: format!("bring_up {name}"),
                reason: "scripted failure".to_string(),
            });
        }
        Ok(())
    }

    async fn bring_down(&self, name: &str) -> Result<(), NetworkError> {
        self.calls().bring_downs.push(name.to_string());
        Ok(())
    }

    async fn request_scan(&self, name: &str) -> Result<(), NetworkError> {
        self.calls()
            .scan_requests
            .push(name.to_string());
        Ok(())
    }

    async fn poll_scan_results(&self, name: &str) -> Result<Vec<String>, NetworkError> {
        self.calls().polls += 1;
        let mut script = self.script();
        Ok(script
            .scan_results
            .get_mut(name)
            .map(pop_or_repeat)
            .unwrap_or_default())
    }

    async fn set_ntp_servers(&self, servers: &[String]) -> Result<(), NetworkError> {
        self.calls().ntp_servers.push(servers.to_vec());
        Ok(())
    }

    async fn resolve_hostname(&self, name: &str) -> Result<Vec<IpAddr>, NetworkError> {
        self.calls().resolves.push(name.to_string());
        self.script()
            .resolutions
            .get(name)
            .cloned()
            .ok_or_else(|| NetworkError::Resolution {
                hostname: name.to_string(),
                reason: "NXDOMAIN".to_string(),
            })
    }

    async fn clear_resolver_cache(&self) -> Result<(), NetworkError> {
        self.calls().cache_clears += 1;
        Ok(())
    }
}
