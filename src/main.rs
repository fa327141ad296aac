use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use netsup::{
    compiler,
    config::{self, Config, FileStore, InterfaceType, Ipv4Method, NetworkInterfaceRecord, NetworkSettings},
    dns::DnsProbe,
    interface, logging,
    network::{InterfaceSupervisor, NetworkOptions},
    root::{Collaborator, RootTree},
    scan::{self, ScanEngine, ScanOptions},
    server::{ApiState, HttpApi, ServerConfig},
    ConfigStore, Driver, SystemDriver,
};

#[derive(Parser)]
#[command(name = "netsup")]
#[command(about = "Discover, scan and supervise the network interfaces of a device controller")]
#[command(version)]
struct Cli {
    /// Config file (defaults to $NETSUP_CONFIG or the user config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum TypeArg {
    Wired,
    Wireless,
}

#[derive(Clone, Copy, ValueEnum)]
enum MethodArg {
    Dhcp,
    Static,
}

#[derive(Subcommand)]
enum Commands {
    /// List usable network interfaces
    ListInterfaces {
        /// Enumeration attempts while only loopback is present
        #[arg(long, default_value_t = interface::DEFAULT_MAX_ATTEMPTS)]
        attempts: u32,
    },

    /// Scan for WiFi networks
    Scan {
        /// Interface to use (defaults to the first wireless interface, USB preferred)
        #[arg(short, long)]
        interface: Option<String>,

        /// Seconds to wait for results; 0 waits forever
        #[arg(short, long)]
        timeout: Option<u64>,
    },

    /// Show the signal level of a network
    Level {
        /// SSID to look for
        ssid: String,

        #[arg(short, long)]
        interface: Option<String>,
    },

    /// Probe DNS resolution
    Dns {
        /// Hostname (defaults to the API server host)
        host: Option<String>,
    },

    /// Print the compiled driver configuration of every saved interface as JSON
    Compile,

    /// Save an interface record to the config file
    SaveInterface {
        /// Interface name, e.g. wlan0
        name: String,

        #[arg(short = 't', long = "type", value_enum)]
        interface_type: TypeArg,

        #[arg(long)]
        ssid: Option<String>,

        /// NONE, WPA-PSK or WPA-EAP
        #[arg(long)]
        security: Option<String>,

        #[arg(long)]
        psk: Option<String>,

        #[arg(long)]
        identity: Option<String>,

        #[arg(long)]
        password: Option<String>,

        #[arg(long)]
        regulatory_domain: Option<String>,

        #[arg(long, value_enum, default_value = "dhcp")]
        ipv4_method: MethodArg,

        #[arg(long)]
        ipv4_address: Option<String>,

        #[arg(long)]
        ipv4_gateway: Option<String>,

        #[arg(long)]
        ipv4_subnet_mask: Option<String>,

        /// Space-separated list, e.g. "8.8.8.8 8.8.4.4"
        #[arg(long)]
        name_servers: Option<String>,

        #[arg(long)]
        domain: Option<String>,
    },

    /// Show saved configuration
    ShowConfig,

    /// Run the supervision tree until Ctrl-C
    Run {
        /// Also serve the local JSON API on this port
        #[arg(long)]
        http_port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();
    let cli = Cli::parse();

    let path = match cli.config {
        Some(path) => path,
        None => config::config_path()?,
    };

    match cli.command {
        Commands::ListInterfaces { attempts } => cmd_list_interfaces(attempts).await,
        Commands::Scan { interface, timeout } => cmd_scan(&path, interface.as_deref(), timeout).await,
        Commands::Level { ssid, interface } => cmd_level(&path, &ssid, interface.as_deref()).await,
        Commands::Dns { host } => cmd_dns(&path, host.as_deref()).await,
        Commands::Compile => cmd_compile(&path),
        Commands::SaveInterface {
            name,
            interface_type,
            ssid,
            security,
            psk,
            identity,
            password,
            regulatory_domain,
            ipv4_method,
            ipv4_address,
            ipv4_gateway,
            ipv4_subnet_mask,
            name_servers,
            domain,
        } => {
            let record = NetworkInterfaceRecord {
                name,
                interface_type: match interface_type {
                    TypeArg::Wired => InterfaceType::Wired,
                    TypeArg::Wireless => InterfaceType::Wireless,
                },
                security,
                ssid,
                psk,
                identity,
                password,
                regulatory_domain,
                ipv4_method: match ipv4_method {
                    MethodArg::Dhcp => Ipv4Method::Dhcp,
                    MethodArg::Static => Ipv4Method::Static,
                },
                ipv4_address,
                ipv4_gateway,
                ipv4_subnet_mask,
                name_servers,
                domain,
            };
            cmd_save_interface(&path, record)
        }
        Commands::ShowConfig => cmd_show_config(&path),
        Commands::Run { http_port } => cmd_run(path, http_port).await,
    }
}

async fn cmd_list_interfaces(attempts: u32) -> Result<()> {
    let driver = SystemDriver::new();
    let interfaces = interface::list_interfaces(&driver, attempts).await?;

    if interfaces.is_empty() {
        println!("No network interfaces found.");
        return Ok(());
    }

    println!("{:<16} {:<12} {:<10} {}", "INTERFACE", "STATE", "KIND", "MAC");
    println!("{}", "-".repeat(60));

    for iface in interfaces.values() {
        let kind = match (iface.wireless, iface.is_usb) {
            (true, true) => "wifi/USB",
            (true, false) => "wifi",
            (false, _) => "wired",
        };
        let mac = iface.mac_address.as_deref().unwrap_or("-");
        println!("{:<16} {:<12} {:<10} {}", iface.name, iface.operstate, kind, mac);
    }

    Ok(())
}

fn scan_engine(path: &Path, timeout: Option<u64>) -> Arc<ScanEngine> {
    let settings = NetworkSettings::from_store(&FileStore::new(path));
    let timeout = match timeout {
        Some(0) => None,
        Some(secs) => Some(Duration::from_secs(secs)),
        None => Some(settings.scan_timeout),
    };
    let driver = Arc::new(SystemDriver::new());
    ScanEngine::new(
        driver,
        ScanOptions {
            timeout,
            ..ScanOptions::default()
        },
    )
}

async fn cmd_scan(path: &Path, interface: Option<&str>, timeout: Option<u64>) -> Result<()> {
    let iface = interface::resolve_interface(&SystemDriver::new(), interface).await?;
    println!("Scanning on interface: {}", iface.name);
    println!();

    let engine = scan_engine(path, timeout);
    // The CLI drives wpa_supplicant directly, so it holds the session itself.
    let _session = engine.register(&iface.name);
    let networks = engine.scan(&iface.name).await?;
    scan::display_networks(&networks);

    Ok(())
}

async fn cmd_level(path: &Path, ssid: &str, interface: Option<&str>) -> Result<()> {
    let iface = interface::resolve_interface(&SystemDriver::new(), interface).await?;
    let engine = scan_engine(path, None);
    let _session = engine.register(&iface.name);

    match engine.get_level(&iface.name, ssid).await? {
        Some(level) => println!("{ssid}: {level} dBm"),
        None => bail!("'{}' not visible on {}", ssid, iface.name),
    }

    Ok(())
}

async fn cmd_dns(path: &Path, host: Option<&str>) -> Result<()> {
    let probe = DnsProbe::new(Arc::new(SystemDriver::new()), Arc::new(FileStore::new(path)));
    let result = probe.test_dns(host).await?;

    let note = if result.synthetic { " (literal)" } else { "" };
    println!("{}{}", result.hostname, note);
    for addr in &result.addresses {
        println!("  {addr}");
    }

    Ok(())
}

fn cmd_compile(path: &Path) -> Result<()> {
    let cfg = Config::load_from(path)?;

    let mut compiled = Vec::new();
    let mut failures = 0;
    for record in &cfg.interfaces {
        match compiler::compile_record(record) {
            Ok(c) => compiled.push(c),
            Err(e) => {
                eprintln!("{}: {}", record.name, e);
                failures += 1;
            }
        }
    }

    println!("{}", serde_json::to_string_pretty(&compiled)?);

    if failures > 0 {
        bail!("{} interface record(s) failed to compile", failures);
    }
    Ok(())
}

fn cmd_save_interface(path: &Path, record: NetworkInterfaceRecord) -> Result<()> {
    let mut cfg = Config::load_from(path).unwrap_or_default();
    let name = record.name.clone();

    cfg.add_interface(record);
    cfg.save_to(path)?;

    println!("Saved interface '{}' to {}", name, path.display());
    Ok(())
}

fn cmd_show_config(path: &Path) -> Result<()> {
    println!("Config file: {}", path.display());
    println!();

    let cfg = Config::load_from(path)?;

    if cfg.interfaces.is_empty() {
        println!("No saved interfaces.");
    } else {
        println!("{:<12} {:<10} {:<24} {:<10} {}", "INTERFACE", "TYPE", "SSID", "IPV4", "SECRET");
        println!("{}", "-".repeat(70));
        for record in &cfg.interfaces {
            let kind = match record.interface_type {
                InterfaceType::Wired => "wired",
                InterfaceType::Wireless => "wireless",
            };
            let method = match record.ipv4_method {
                Ipv4Method::Dhcp => "dhcp",
                Ipv4Method::Static => "static",
            };
            let secret = record.psk.as_deref().or(record.password.as_deref());
            let masked = secret.map_or_else(|| "-".to_string(), |s| "*".repeat(s.len().min(12)));
            println!(
                "{:<12} {:<10} {:<24} {:<10} {}",
                record.name,
                kind,
                record.ssid.as_deref().unwrap_or("-"),
                method,
                masked
            );
        }
    }

    let settings = NetworkSettings::from_store(&cfg);
    println!();
    println!("API server:   {}", settings.api_server_url.as_deref().unwrap_or("-"));
    println!("DNS probe:    {}", settings.default_dns_name);
    println!("NTP servers:  {}", settings.ntp_servers.join(", "));

    Ok(())
}

async fn cmd_run(path: PathBuf, http_port: Option<u16>) -> Result<()> {
    let store: Arc<dyn ConfigStore> = Arc::new(FileStore::new(&path));
    let settings = NetworkSettings::from_store(store.as_ref());
    let driver: Arc<dyn Driver> = Arc::new(SystemDriver::new());
    let scan = ScanEngine::new(
        Arc::clone(&driver),
        ScanOptions {
            timeout: Some(settings.scan_timeout),
            ..ScanOptions::default()
        },
    );

    let network = InterfaceSupervisor::new(
        Arc::clone(&store),
        Arc::clone(&driver),
        Arc::clone(&scan),
        NetworkOptions::default(),
    );
    let mut tree = RootTree::new(Arc::clone(&network));
    if let Some(port) = http_port {
        let state = ApiState {
            driver: Arc::clone(&driver),
            scan,
            dns: DnsProbe::new(driver, store),
            network: network.handle(),
        };
        tree = tree.with_collaborator(
            Collaborator::Rpc,
            Arc::new(HttpApi::new(ServerConfig::local(port), state)),
        );
    }

    tracing::info!(config = %path.display(), "starting supervision tree");
    let shutdown = CancellationToken::new();
    let (_root, mut join) = tree.start(shutdown.clone());

    tokio::select! {
        result = &mut join => {
            result.context("Root supervisor task failed")??;
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl-C")?;
            tracing::info!("shutting down");
            shutdown.cancel();
            join.await.context("Root supervisor task failed")??;
        }
    }

    Ok(())
}
