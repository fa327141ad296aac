//! Network supervision for an embedded device controller
//!
//! This library discovers network interfaces, scans for wireless networks,
//! compiles persisted interface records into driver configurations and keeps
//! one supervised worker per configured interface running.
//!
//! # Modules
//!
//! - [`compiler`] - Turns interface records into driver options
//! - [`config`] - TOML-backed persisted records and settings
//! - [`dns`] - DNS reachability probe
//! - [`driver`] - The OS boundary and its Linux implementation
//! - [`error`] - Custom error types for the library
//! - [`interface`] - Interface enumeration with boot settling
//! - [`logging`] - tracing subscriber setup
//! - [`network`] - The dynamic interface supervisor
//! - [`root`] - The top-level process tree
//! - [`scan`] - Wireless scanning and result decoding
//! - [`server`] - Local JSON API
//! - [`supervisor`] - Generic one-for-one supervision
//! - [`testing`] - Scripted driver for tests
//!
//! # Example Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use netsup::{ScanEngine, ScanOptions, SystemDriver};
//!
//! # async fn demo() -> Result<(), netsup::NetworkError> {
//! let driver = Arc::new(SystemDriver::new());
//! let engine = ScanEngine::new(driver, ScanOptions::default());
//!
//! // Scans only run on interfaces with a live session.
//! let _session = engine.register("wlan0");
//! for entry in engine.scan("wlan0").await? {
//!     println!("{:?} {}", entry.ssid, entry.level);
//! }
//! # Ok(())
//! # }
//! ```

/// Configuration compiler producing per-interface driver options.
pub mod compiler;

/// Configuration module for persisted interface records and settings.
/// Handles reading/writing TOML config files.
pub mod config;

pub mod dns;

/// OS/driver boundary.
pub mod driver;

/// Error module defining custom error types for the library.
/// Uses `thiserror` for ergonomic error handling.
pub mod error;

/// Interface module for adapter discovery.
/// Handles listing interfaces, detecting USB adapters, and interface resolution.
pub mod interface;

pub mod logging;

/// Per-interface workers and the supervisor that owns them.
pub mod network;

pub mod root;

/// Scan module for discovering available WiFi networks.
/// Triggers scans and decodes `wpa_cli scan_results` output.
pub mod scan;

/// Server module providing the local JSON API.
pub mod server;

pub mod supervisor;

pub mod testing;

// Re-export the main error types for library users
pub use error::{NetworkError, SupervisorError};

pub use compiler::{compile_record, to_driver_config, CompiledConfig, DriverOptions, OptionValue};
pub use config::{Config, ConfigStore, NetworkInterfaceRecord};
pub use dns::{DnsProbe, DnsResolution};
pub use driver::{Driver, InterfaceStatus, SystemDriver};
pub use interface::{get_interface, list_interfaces, resolve_interface};
pub use network::{InterfaceSupervisor, NetworkHandle, NetworkOptions};
pub use root::{Collaborator, RootTree};
pub use scan::{ScanEngine, ScanEntry, ScanOptions};
pub use supervisor::{ChildSpec, Intensity, RestartPolicy, Supervisor, SupervisorHandle, Worker};
