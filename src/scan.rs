//! Wireless network scanning.
//!
//! A scan asks the driver to start scanning, then polls for results until at
//! least one line decodes. The decoded entries are cleaned up before they are
//! returned:
//!
//! 1. sorted by signal level, strongest first (stable)
//! 2. entries without an SSID are dropped (hidden networks)
//! 3. SSIDs carrying an embedded NUL are dropped (driver artifact)
//! 4. duplicate SSIDs collapse to their first, strongest, occurrence
//!
//! Scans only run on interfaces that currently have a live connection
//! session. The interface supervisor registers one with [`ScanEngine::register`]
//! when it brings an interface up; without one a scan returns an empty list.
//!
//! # Blocking
//!
//! Polling repeats every [`ScanOptions::poll_interval`] until results show up.
//! [`ScanOptions::timeout`] bounds the wait and a [`CancellationToken`] can end
//! it early. With `timeout: None` and a token that is never cancelled, a scan
//! on an interface that never reports results blocks forever.
//!
//! # Example
//!
//! ```no_run
//! # async fn demo(engine: std::sync::Arc<netsup::ScanEngine>) -> Result<(), netsup::NetworkError> {
//! let _session = engine.register("wlan0");
//! let networks = engine.scan("wlan0").await?;
//! netsup::scan::display_networks(&networks);
//! # Ok(())
//! # }
//! ```

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::driver::Driver;
use crate::error::NetworkError;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Security advertised by an access point, derived from its flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ApSecurity {
    #[serde(rename = "WPA-EAP")]
    WpaEap,
    #[serde(rename = "WPA-PSK")]
    WpaPsk,
    #[serde(rename = "WEP")]
    Wep,
    #[serde(rename = "NONE")]
    Open,
}

impl ApSecurity {
    /// Classify driver capability flags such as `[WPA2-PSK-CCMP][ESS]`.
    pub fn from_flags(flags: &str) -> Self {
        if flags.contains("EAP") {
            ApSecurity::WpaEap
        } else if ["PSK", "SAE", "WPA", "RSN"].iter().any(|f| flags.contains(*f)) {
            ApSecurity::WpaPsk
        } else if flags.contains("WEP") {
            ApSecurity::Wep
        } else {
            ApSecurity::Open
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ApSecurity::WpaEap => "WPA-EAP",
            ApSecurity::WpaPsk => "WPA-PSK",
            ApSecurity::Wep => "WEP",
            ApSecurity::Open => "NONE",
        }
    }
}

/// One visible BSS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanEntry {
    pub bssid: String,
    /// Raw driver units.
    pub frequency: i64,
    pub level: i64,
    /// Raw capability flags.
    pub flags: String,
    pub ssid: Option<String>,
    pub security: ApSecurity,
}

/// Decode one tab-separated result line:
/// `bssid \t frequency \t level \t flags [\t ssid]`.
///
/// Anything that is not exactly 4 or 5 fields with numeric frequency and
/// level yields `None`; that covers the header line `wpa_cli` prints.
pub fn decode_line(line: &str) -> Option<ScanEntry> {
    let fields: Vec<&str> = line.trim_end_matches(['\r', '\n']).split('\t').collect();
    let (bssid, frequency, level, flags, ssid) = match fields.as_slice() {
        [bssid, frequency, level, flags] => (bssid, frequency, level, flags, None),
        [bssid, frequency, level, flags, ssid] => (bssid, frequency, level, flags, Some(*ssid)),
        _ => return None,
    };

    Some(ScanEntry {
        bssid: bssid.to_string(),
        frequency: frequency.trim().parse().ok()?,
        level: level.trim().parse().ok()?,
        flags: flags.to_string(),
        ssid: ssid.filter(|s| !s.is_empty()).map(str::to_string),
        security: ApSecurity::from_flags(flags),
    })
}

pub fn decode_lines<S: AsRef<str>>(lines: &[S]) -> Vec<ScanEntry> {
    lines.iter().filter_map(|l| decode_line(l.as_ref())).collect()
}

/// `wpa_cli` prints a NUL inside an SSID as the escape `\x00`.
fn has_embedded_nul(ssid: &str) -> bool {
    ssid.contains('\0') || ssid.contains("\\x00")
}

/// Sort, strip hidden and corrupt SSIDs, and deduplicate by SSID.
pub fn postprocess(mut entries: Vec<ScanEntry>) -> Vec<ScanEntry> {
    entries.sort_by(|a, b| b.level.cmp(&a.level));

    let mut seen_ssids = HashSet::new();
    entries
        .into_iter()
        .filter(|e| match e.ssid.as_deref() {
            Some(ssid) => !has_embedded_nul(ssid) && seen_ssids.insert(ssid.to_string()),
            None => false,
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanOptions {
    pub poll_interval: Duration,
    /// `None` waits for results indefinitely.
    pub timeout: Option<Duration>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            timeout: Some(crate::config::DEFAULT_SCAN_TIMEOUT),
        }
    }
}

impl ScanOptions {
    pub fn unbounded() -> Self {
        Self {
            timeout: None,
            ..Self::default()
        }
    }
}

/// A live connection session on an interface.
#[derive(Debug, Clone)]
pub struct ScanSession {
    id: u64,
    pub interface: String,
}

/// Removes its session from the engine when dropped.
#[must_use = "the session is removed as soon as the guard is dropped"]
pub struct SessionGuard {
    engine: Arc<ScanEngine>,
    interface: String,
    id: u64,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.engine.unregister(&self.interface, self.id);
    }
}

pub struct ScanEngine {
    driver: Arc<dyn Driver>,
    options: ScanOptions,
    sessions: RwLock<HashMap<String, ScanSession>>,
    next_id: AtomicU64,
}

impl ScanEngine {
    pub fn new(driver: Arc<dyn Driver>, options: ScanOptions) -> Arc<Self> {
        Arc::new(Self {
            driver,
            options,
            sessions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Record a live session for `interface`, replacing any previous one.
    pub fn register(self: &Arc<Self>, interface: &str) -> SessionGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let session = ScanSession {
            id,
            interface: interface.to_string(),
        };
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(interface.to_string(), session);
        tracing::debug!(interface, "scan session registered");

        SessionGuard {
            engine: Arc::clone(self),
            interface: interface.to_string(),
            id,
        }
    }

    fn unregister(&self, interface: &str, id: u64) {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        // A restarted worker may already have replaced this session.
        if sessions.get(interface).is_some_and(|s| s.id == id) {
            sessions.remove(interface);
            tracing::debug!(interface, "scan session removed");
        }
    }

    pub fn session(&self, interface: &str) -> Option<ScanSession> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(interface)
            .cloned()
    }

    pub fn sessions(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Scan with the engine's default options and no cancellation.
    pub async fn scan(&self, interface: &str) -> Result<Vec<ScanEntry>, NetworkError> {
        self.scan_with(interface, self.options, &CancellationToken::new())
            .await
    }

    pub async fn scan_with(
        &self,
        interface: &str,
        options: ScanOptions,
        cancel: &CancellationToken,
    ) -> Result<Vec<ScanEntry>, NetworkError> {
        if self.session(interface).is_none() {
            tracing::debug!(interface, "no live session, not scan capable");
            return Ok(Vec::new());
        }

        self.driver.request_scan(interface).await?;

        let poll = async {
            let poll = self.poll_until_results(interface, options.poll_interval);
            match options.timeout {
                Some(timeout) => match tokio::time::timeout(timeout, poll).await {
                    Ok(result) => result,
                    Err(_) => Err(NetworkError::ScanTimedOut {
                        interface: interface.to_string(),
                        timeout,
                    }),
                },
                None => poll.await,
            }
        };

        let entries = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(NetworkError::ScanCancelled(interface.to_string()));
            }
            result = poll => result?,
        };

        Ok(postprocess(entries))
    }

    async fn poll_until_results(
        &self,
        interface: &str,
        poll_interval: Duration,
    ) -> Result<Vec<ScanEntry>, NetworkError> {
        let mut polls = 0u32;
        loop {
            let lines = self.driver.poll_scan_results(interface).await?;
            let entries = decode_lines(&lines);
            if !entries.is_empty() {
                tracing::debug!(interface, polls, found = entries.len(), "scan results ready");
                return Ok(entries);
            }
            polls += 1;
            tracing::trace!(interface, polls, "no scan results yet");
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Signal level of the strongest entry named `ssid`, from a fresh scan.
    pub async fn get_level(&self, interface: &str, ssid: &str) -> Result<Option<i64>, NetworkError> {
        Ok(self
            .scan(interface)
            .await?
            .into_iter()
            .find(|e| e.ssid.as_deref() == Some(ssid))
            .map(|e| e.level))
    }
}

/// Print networks as a table.
///
/// ```text
/// SSID                              LEVEL      SECURITY
/// ------------------------------------------------------------
/// Barn                              -42 ████ WPA-PSK
/// Guest                             -71 █░░░ NONE
/// ```
pub fn display_networks(networks: &[ScanEntry]) {
    if networks.is_empty() {
        println!("No networks found.");
        return;
    }

    println!("{:<32} {:>6}      {}", "SSID", "LEVEL", "SECURITY");
    println!("{}", "-".repeat(60));

    for network in networks {
        println!(
            "{:<32} {:>6} {} {}",
            truncate_ssid(network.ssid.as_deref().unwrap_or_default(), 32),
            network.level,
            level_to_bar(network.level),
            network.security.as_str()
        );
    }
}

fn truncate_ssid(ssid: &str, max_len: usize) -> String {
    if ssid.chars().count() > max_len {
        let head: String = ssid.chars().take(max_len - 3).collect();
        format!("{head}...")
    } else {
        ssid.to_string()
    }
}

/// Four-segment bar for a dBm level.
fn level_to_bar(level: i64) -> &'static str {
    match level {
        -50..=i64::MAX => "████",
        -60..=-51 => "███░",
        -70..=-61 => "██░░",
        -80..=-71 => "█░░░",
        _ => "░░░░",
    }
}
