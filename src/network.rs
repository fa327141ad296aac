//! Dynamic interface supervision.
//!
//! [`InterfaceSupervisor`] turns the persisted interface records into one
//! [`InterfaceWorker`] per compiled configuration and keeps them running
//! under a one-for-one [`Supervisor`]. It is itself a [`Worker`], so the root
//! tree restarts it when its own restart intensity is exceeded.
//!
//! A [`NotFoundTimer`] always runs ahead of the interface workers. It covers
//! the boot case where no interface is configured or present yet: on every
//! tick with no interface worker running, interfaces are listed again and
//! the records are reloaded from the store once any appear.

use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use crate::compiler::{to_driver_config, CompiledConfig};
use crate::config::{ConfigStore, NetworkInterfaceRecord, NetworkSettings};
use crate::driver::Driver;
use crate::error::NetworkError;
use crate::interface::{list_interfaces, DEFAULT_MAX_ATTEMPTS};
use crate::scan::ScanEngine;
use crate::error::SupervisorError;
use crate::supervisor::{ChildSpec, Intensity, Supervisor, SupervisorHandle, Worker};

/// Child id of the sentinel timer.
pub const NOT_FOUND_TIMER_ID: &str = "interfaces-not-found";

/// At most 20 restarts per second before the subtree gives up.
pub const NETWORK_INTENSITY: Intensity = Intensity::new(20, Duration::from_secs(1));

pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy)]
pub struct NetworkOptions {
    pub intensity: Intensity,
    /// Overrides `network.not_found_timeout_secs` when set.
    pub not_found_timeout: Option<Duration>,
    /// Pause after a failed bring-up before the worker exits with an error.
    pub retry_delay: Duration,
    pub health_interval: Duration,
}

impl Default for NetworkOptions {
    fn default() -> Self {
        Self {
            intensity: NETWORK_INTENSITY,
            not_found_timeout: None,
            retry_delay: DEFAULT_RETRY_DELAY,
            health_interval: DEFAULT_HEALTH_INTERVAL,
        }
    }
}

/// Owns one interface for as long as its configuration is active.
pub struct InterfaceWorker {
    config: CompiledConfig,
    driver: Arc<dyn Driver>,
    scan: Arc<ScanEngine>,
    retry_delay: Duration,
    health_interval: Duration,
}

#[async_trait]
impl Worker for InterfaceWorker {
    async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let name = self.config.interface_name.as_str();

        if let Err(e) = self.driver.bring_up(name, &self.config.driver_options).await {
            tracing::warn!(interface = %name, "bring-up failed: {e}");
            if !self.retry_delay.is_zero() {
                tokio::select! {
                    _ = shutdown.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(self.retry_delay) => {}
                }
            }
            return Err(e).with_context(|| format!("Failed to bring up {name}"));
        }

        let _session = self.config.is_wireless().then(|| self.scan.register(name));
        tracing::info!(interface = %name, kind = ?self.config.interface_type, "interface up");

        let start = tokio::time::Instant::now() + self.health_interval;
        let mut health = tokio::time::interval_at(start, self.health_interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = health.tick() => match self.driver.interface_status(name).await {
                    Ok(status) => {
                        tracing::trace!(interface = %name, operstate = %status.operstate, "health check");
                    }
                    Err(NetworkError::InterfaceNotFound(_)) => {
                        anyhow::bail!("interface {name} disappeared");
                    }
                    Err(e) => tracing::warn!(interface = %name, "health check failed: {e}"),
                },
            }
        }

        if let Err(e) = self.driver.bring_down(name).await {
            tracing::warn!(interface = %name, "bring-down failed: {e}");
        }
        tracing::info!(interface = %name, "interface stopped");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NetworkEvent {
    NotFoundTick,
}

/// Sentinel that reports to the supervisor every `timeout`.
pub struct NotFoundTimer {
    timeout: Duration,
    events: mpsc::UnboundedSender<NetworkEvent>,
}

#[async_trait]
impl Worker for NotFoundTimer {
    async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.timeout) => {
                    if self.events.send(NetworkEvent::NotFoundTick).is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Outcome of applying a set of records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReinitReport {
    pub started: Vec<String>,
    pub stopped: Vec<String>,
    pub unchanged: Vec<String>,
    /// Records that did not compile, with the reason.
    pub failed: Vec<(String, String)>,
}

enum NetworkCommand {
    Reinitialize {
        records: Vec<NetworkInterfaceRecord>,
        reply: oneshot::Sender<ReinitReport>,
    },
    Reload {
        reply: oneshot::Sender<ReinitReport>,
    },
    ActiveInterfaces {
        reply: oneshot::Sender<Vec<CompiledConfig>>,
    },
}

/// Cloneable address of the interface supervisor.
///
/// Requests queue while the supervisor restarts and are served once it is
/// running again.
#[derive(Clone)]
pub struct NetworkHandle {
    tx: mpsc::Sender<NetworkCommand>,
}

impl NetworkHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> NetworkCommand,
    ) -> Result<T, NetworkError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| NetworkError::SupervisorGone)?;
        rx.await.map_err(|_| NetworkError::SupervisorGone)
    }

    /// Replace the active configuration with `records`.
    pub async fn reinitialize(
        &self,
        records: Vec<NetworkInterfaceRecord>,
    ) -> Result<ReinitReport, NetworkError> {
        self.request(|reply| NetworkCommand::Reinitialize { records, reply })
            .await
    }

    /// Re-read the records from the store and apply them.
    pub async fn reload(&self) -> Result<ReinitReport, NetworkError> {
        self.request(|reply| NetworkCommand::Reload { reply }).await
    }

    pub async fn active_interfaces(&self) -> Result<Vec<CompiledConfig>, NetworkError> {
        self.request(|reply| NetworkCommand::ActiveInterfaces { reply })
            .await
    }
}

pub struct InterfaceSupervisor {
    store: Arc<dyn ConfigStore>,
    driver: Arc<dyn Driver>,
    scan: Arc<ScanEngine>,
    options: NetworkOptions,
    control: Mutex<mpsc::Receiver<NetworkCommand>>,
    control_tx: mpsc::Sender<NetworkCommand>,
}

impl InterfaceSupervisor {
    pub fn new(
        store: Arc<dyn ConfigStore>,
        driver: Arc<dyn Driver>,
        scan: Arc<ScanEngine>,
        options: NetworkOptions,
    ) -> Arc<Self> {
        let (control_tx, control) = mpsc::channel(16);
        Arc::new(Self {
            store,
            driver,
            scan,
            options,
            control: Mutex::new(control),
            control_tx,
        })
    }

    pub fn handle(&self) -> NetworkHandle {
        NetworkHandle {
            tx: self.control_tx.clone(),
        }
    }

    pub fn scan_engine(&self) -> Arc<ScanEngine> {
        Arc::clone(&self.scan)
    }

    fn worker_spec(&self, config: CompiledConfig) -> ChildSpec {
        let id = config.interface_name.clone();
        ChildSpec::transient(
            id,
            Arc::new(InterfaceWorker {
                config,
                driver: Arc::clone(&self.driver),
                scan: Arc::clone(&self.scan),
                retry_delay: self.options.retry_delay,
                health_interval: self.options.health_interval,
            }),
        )
    }

    /// Compile `records` into configs keyed by interface name.
    ///
    /// Identical configs collapse into one. When two records for the same
    /// interface disagree the first one wins.
    async fn compile_all(
        &self,
        records: Vec<NetworkInterfaceRecord>,
        report: &mut ReinitReport,
    ) -> BTreeMap<String, CompiledConfig> {
        let mut compiled = BTreeMap::new();
        for record in records {
            match to_driver_config(&record, self.driver.as_ref()).await {
                Ok(config) => match compiled.get(&config.interface_name) {
                    Some(existing) if *existing == config => {}
                    Some(_) => {
                        tracing::warn!(interface = %config.interface_name, "conflicting records, keeping the first");
                        report.failed.push((
                            config.interface_name.clone(),
                            "conflicting duplicate record".to_string(),
                        ));
                    }
                    None => {
                        compiled.insert(config.interface_name.clone(), config);
                    }
                },
                Err(e) => {
                    tracing::error!(interface = %record.name, "failed to compile interface config: {e}");
                    report.failed.push((record.name.clone(), e.to_string()));
                }
            }
        }
        compiled
    }

    /// Move the supervised set from `current` to the configs compiled from
    /// `records`. Workers whose config is unchanged keep running.
    async fn apply(
        &self,
        supervisor: &SupervisorHandle,
        current: &mut BTreeMap<String, CompiledConfig>,
        records: Vec<NetworkInterfaceRecord>,
    ) -> anyhow::Result<ReinitReport> {
        let mut report = ReinitReport::default();
        let next = self.compile_all(records, &mut report).await;

        let stale: Vec<String> = current
            .iter()
            .filter(|(name, config)| next.get(*name) != Some(*config))
            .map(|(name, _)| name.clone())
            .collect();
        for name in stale {
            supervisor.terminate_child(&name).await?;
            current.remove(&name);
            tracing::info!(interface = %name, "interface worker stopped");
            report.stopped.push(name);
        }

        for (name, config) in next {
            if current.contains_key(&name) {
                report.unchanged.push(name);
                continue;
            }
            match supervisor.start_child(self.worker_spec(config.clone())).await {
                Ok(()) => {
                    current.insert(name.clone(), config);
                    report.started.push(name);
                }
                // A record named like the sentinel must not take the subtree down.
                Err(SupervisorError::AlreadyStarted(id)) => {
                    tracing::error!(interface = %name, "child id '{id}' is already in use");
                    report.failed.push((name, format!("child id '{id}' is already in use")));
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(report)
    }

    async fn rediscover(
        &self,
        supervisor: &SupervisorHandle,
        current: &mut BTreeMap<String, CompiledConfig>,
    ) -> anyhow::Result<()> {
        if !current.is_empty() {
            return Ok(());
        }
        let found = match list_interfaces(self.driver.as_ref(), DEFAULT_MAX_ATTEMPTS).await {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!("interface rediscovery failed: {e}");
                return Ok(());
            }
        };
        if found.is_empty() {
            tracing::warn!("no network interfaces found");
            return Ok(());
        }

        tracing::info!(count = found.len(), "interfaces found, reloading configuration");
        let report = self
            .apply(supervisor, current, self.store.network_interface_records())
            .await?;
        tracing::debug!(?report, "rediscovery applied");
        Ok(())
    }
}

#[async_trait]
impl Worker for InterfaceSupervisor {
    async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let mut control = self.control.lock().await;

        let settings = NetworkSettings::from_store(self.store.as_ref());
        if let Err(e) = self.driver.set_ntp_servers(&settings.ntp_servers).await {
            tracing::warn!("failed to set NTP servers: {e}");
        }

        let (events_tx, mut events) = mpsc::unbounded_channel();
        let timer = NotFoundTimer {
            timeout: self
                .options
                .not_found_timeout
                .unwrap_or(settings.not_found_timeout),
            events: events_tx,
        };
        let (supervisor, mut join) = Supervisor::new("network")
            .with_intensity(self.options.intensity)
            .child(ChildSpec::transient(NOT_FOUND_TIMER_ID, Arc::new(timer)))
            .start(shutdown.child_token());

        let mut current = BTreeMap::new();
        let report = self
            .apply(&supervisor, &mut current, self.store.network_interface_records())
            .await?;
        tracing::info!(
            started = report.started.len(),
            failed = report.failed.len(),
            "network supervisor started"
        );

        loop {
            tokio::select! {
                result = &mut join => {
                    return match result {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(e)) => Err(e.into()),
                        Err(e) => Err(anyhow::anyhow!("network supervisor task failed: {e}")),
                    };
                }
                Some(NetworkEvent::NotFoundTick) = events.recv() => {
                    self.rediscover(&supervisor, &mut current).await?;
                }
                Some(cmd) = control.recv() => match cmd {
                    NetworkCommand::Reinitialize { records, reply } => {
                        let report = self.apply(&supervisor, &mut current, records).await?;
                        tracing::info!(?report, "network reinitialized");
                        let _ = reply.send(report);
                    }
                    NetworkCommand::Reload { reply } => {
                        let records = self.store.network_interface_records();
                        let report = self.apply(&supervisor, &mut current, records).await?;
                        tracing::info!(?report, "network reloaded");
                        let _ = reply.send(report);
                    }
                    NetworkCommand::ActiveInterfaces { reply } => {
                        let _ = reply.send(current.values().cloned().collect());
                    }
                },
            }
        }
    }
}
