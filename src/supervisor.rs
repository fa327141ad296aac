//! One-for-one supervision of async workers.
//!
//! A [`Supervisor`] owns a set of children, each a [`Worker`] running in its
//! own tokio task. When a child exits, only that child is considered for a
//! restart; its siblings keep running. Whether it comes back depends on its
//! [`RestartPolicy`]:
//!
//! - `Permanent`: always restarted
//! - `Transient`: restarted only after an abnormal exit (error or panic)
//! - `Temporary`: never restarted
//!
//! Restarts are rate limited by an [`Intensity`]. More than `max_restarts`
//! restarts within `window` stops every child and makes the supervisor's own
//! run future resolve to [`SupervisorError::RestartIntensityExceeded`]. A
//! supervisor running as a child of another supervisor therefore looks like
//! a failing worker to its parent, which decides what happens next.
//!
//! Children are started in the order they were added and stopped in reverse.
//! Stopping a child cancels its token and waits up to
//! [`ChildSpec::shutdown_timeout`] before aborting the task.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::SupervisorError;

pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// A unit of work run under supervision.
///
/// `Ok(())` is a normal exit. An `Err` or a panic is abnormal. Workers must
/// return promptly once `shutdown` is cancelled.
#[async_trait]
pub trait Worker: Send + Sync + 'static {
    async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    Permanent,
    Transient,
    Temporary,
}

impl RestartPolicy {
    fn should_restart(self, reason: &ExitReason) -> bool {
        match self {
            RestartPolicy::Permanent => true,
            RestartPolicy::Transient => reason.is_abnormal(),
            RestartPolicy::Temporary => false,
        }
    }
}

/// Maximum restart rate before a supervisor gives up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Intensity {
    pub max_restarts: usize,
    pub window: Duration,
}

impl Intensity {
    pub const fn new(max_restarts: usize, window: Duration) -> Self {
        Self { max_restarts, window }
    }
}

impl Default for Intensity {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(5))
    }
}

#[derive(Clone)]
pub struct ChildSpec {
    pub id: String,
    pub restart: RestartPolicy,
    pub shutdown_timeout: Duration,
    pub worker: Arc<dyn Worker>,
}

impl ChildSpec {
    pub fn new(id: impl Into<String>, restart: RestartPolicy, worker: Arc<dyn Worker>) -> Self {
        Self {
            id: id.into(),
            restart,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            worker,
        }
    }

    pub fn permanent(id: impl Into<String>, worker: Arc<dyn Worker>) -> Self {
        Self::new(id, RestartPolicy::Permanent, worker)
    }

    pub fn transient(id: impl Into<String>, worker: Arc<dyn Worker>) -> Self {
        Self::new(id, RestartPolicy::Transient, worker)
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

impl std::fmt::Debug for ChildSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildSpec")
            .field("id", &self.id)
            .field("restart", &self.restart)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    Normal,
    Failed(String),
    Panicked,
    Aborted,
}

impl ExitReason {
    pub fn is_abnormal(&self) -> bool {
        !matches!(self, ExitReason::Normal)
    }
}

enum Control {
    StartChild(ChildSpec, oneshot::Sender<Result<(), SupervisorError>>),
    TerminateChild(String, oneshot::Sender<bool>),
    WhichChildren(oneshot::Sender<Vec<String>>),
    Shutdown(oneshot::Sender<()>),
}

struct Exit {
    id: String,
    generation: u64,
    reason: ExitReason,
}

struct RunningChild {
    spec: ChildSpec,
    generation: u64,
    token: CancellationToken,
    task: AbortHandle,
    monitor: JoinHandle<()>,
}

/// Address of a running supervisor.
#[derive(Clone)]
pub struct SupervisorHandle {
    name: Arc<str>,
    tx: mpsc::Sender<Control>,
}

impl SupervisorHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Control,
    ) -> Result<T, SupervisorError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| SupervisorError::ChannelClosed(self.name.to_string()))?;
        rx.await
            .map_err(|_| SupervisorError::ChannelClosed(self.name.to_string()))
    }

    pub async fn start_child(&self, spec: ChildSpec) -> Result<(), SupervisorError> {
        self.request(|reply| Control::StartChild(spec, reply)).await?
    }

    /// Stop a child and forget it. Returns `false` when no such child exists.
    pub async fn terminate_child(&self, id: &str) -> Result<bool, SupervisorError> {
        let id = id.to_string();
        self.request(|reply| Control::TerminateChild(id, reply)).await
    }

    /// Ids of the supervised children, in start order.
    pub async fn which_children(&self) -> Result<Vec<String>, SupervisorError> {
        self.request(Control::WhichChildren).await
    }

    pub async fn shutdown(&self) -> Result<(), SupervisorError> {
        self.request(Control::Shutdown).await
    }
}

pub struct Supervisor {
    name: String,
    intensity: Intensity,
    children: Vec<ChildSpec>,
}

impl Supervisor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            intensity: Intensity::default(),
            children: Vec::new(),
        }
    }

    pub fn with_intensity(mut self, intensity: Intensity) -> Self {
        self.intensity = intensity;
        self
    }

    pub fn child(mut self, spec: ChildSpec) -> Self {
        self.children.push(spec);
        self
    }

    /// Spawn the supervisor. The join handle resolves when it stops, with an
    /// error if it gave up on its children.
    pub fn start(
        self,
        shutdown: CancellationToken,
    ) -> (SupervisorHandle, JoinHandle<Result<(), SupervisorError>>) {
        let (tx, rx) = mpsc::channel(32);
        let handle = SupervisorHandle {
            name: Arc::from(self.name.as_str()),
            tx,
        };
        let join = tokio::spawn(self.run(rx, shutdown));
        (handle, join)
    }

    async fn run(
        self,
        mut control: mpsc::Receiver<Control>,
        shutdown: CancellationToken,
    ) -> Result<(), SupervisorError> {
        let (exit_tx, mut exits) = mpsc::unbounded_channel();
        let mut state = State {
            name: self.name,
            intensity: self.intensity,
            shutdown,
            exit_tx,
            children: Vec::new(),
            restarts: VecDeque::new(),
            next_generation: 0,
        };

        tracing::info!(supervisor = %state.name, children = self.children.len(), "supervisor starting");
        for spec in self.children {
            state.spawn(spec);
        }

        let mut control_open = true;
        loop {
            tokio::select! {
                _ = state.shutdown.cancelled() => {
                    state.stop_all().await;
                    return Ok(());
                }
                Some(exit) = exits.recv() => {
                    state.handle_exit(exit).await?;
                }
                cmd = control.recv(), if control_open => match cmd {
                    Some(Control::StartChild(spec, reply)) => {
                        let result = if state.position(&spec.id).is_some() {
                            Err(SupervisorError::AlreadyStarted(spec.id.clone()))
                        } else {
                            state.spawn(spec);
                            Ok(())
                        };
                        let _ = reply.send(result);
                    }
                    Some(Control::TerminateChild(id, reply)) => {
                        let found = match state.position(&id) {
                            Some(pos) => {
                                let child = state.children.remove(pos);
                                state.stop_child(child).await;
                                true
                            }
                            None => false,
                        };
                        let _ = reply.send(found);
                    }
                    Some(Control::WhichChildren(reply)) => {
                        let _ = reply.send(state.children.iter().map(|c| c.spec.id.clone()).collect());
                    }
                    Some(Control::Shutdown(reply)) => {
                        state.stop_all().await;
                        let _ = reply.send(());
                        return Ok(());
                    }
                    // Every handle is gone; keep supervising until cancelled.
                    None => control_open = false,
                },
            }
        }
    }
}

struct State {
    name: String,
    intensity: Intensity,
    shutdown: CancellationToken,
    exit_tx: mpsc::UnboundedSender<Exit>,
    children: Vec<RunningChild>,
    restarts: VecDeque<Instant>,
    next_generation: u64,
}

impl State {
    fn position(&self, id: &str) -> Option<usize> {
        self.children.iter().position(|c| c.spec.id == id)
    }

    fn launch(&mut self, spec: ChildSpec) -> RunningChild {
        self.next_generation += 1;
        let generation = self.next_generation;
        let token = self.shutdown.child_token();

        let worker = Arc::clone(&spec.worker);
        let worker_token = token.clone();
        let task = tokio::spawn(async move { worker.run(worker_token).await });
        let abort = task.abort_handle();

        let exits = self.exit_tx.clone();
        let id = spec.id.clone();
        let monitor = tokio::spawn(async move {
            let reason = match task.await {
                Ok(Ok(())) => ExitReason::Normal,
                Ok(Err(e)) => ExitReason::Failed(format!("{e:#}")),
                Err(e) if e.is_panic() => ExitReason::Panicked,
                Err(_) => ExitReason::Aborted,
            };
            let _ = exits.send(Exit { id, generation, reason });
        });

        tracing::debug!(supervisor = %self.name, child = %spec.id, generation, "child started");
        RunningChild {
            spec,
            generation,
            token,
            task: abort,
            monitor,
        }
    }

    fn spawn(&mut self, spec: ChildSpec) {
        let child = self.launch(spec);
        self.children.push(child);
    }

    async fn handle_exit(&mut self, exit: Exit) -> Result<(), SupervisorError> {
        // Exits from children that were already stopped or replaced are stale.
        let Some(pos) = self
            .children
            .iter()
            .position(|c| c.spec.id == exit.id && c.generation == exit.generation)
        else {
            return Ok(());
        };

        // Anything the child spawned on its token goes down with it.
        self.children[pos].token.cancel();
        let spec = self.children[pos].spec.clone();
        match &exit.reason {
            ExitReason::Normal => {
                tracing::info!(supervisor = %self.name, child = %exit.id, "child exited normally");
            }
            reason => {
                tracing::warn!(supervisor = %self.name, child = %exit.id, ?reason, "child exited abnormally");
            }
        }

        if !spec.restart.should_restart(&exit.reason) {
            self.children.remove(pos);
            return Ok(());
        }

        if !self.record_restart() {
            tracing::error!(
                supervisor = %self.name,
                child = %exit.id,
                max_restarts = self.intensity.max_restarts,
                window = ?self.intensity.window,
                "restart intensity exceeded, shutting down"
            );
            self.children.remove(pos);
            self.stop_all().await;
            return Err(SupervisorError::RestartIntensityExceeded {
                supervisor: self.name.clone(),
                restarts: self.intensity.max_restarts,
                window: self.intensity.window,
            });
        }

        tracing::info!(supervisor = %self.name, child = %exit.id, "restarting child");
        let child = self.launch(spec);
        self.children[pos] = child;
        Ok(())
    }

    /// Record a restart, returning `false` once the intensity is exceeded.
    fn record_restart(&mut self) -> bool {
        let now = Instant::now();
        while let Some(oldest) = self.restarts.front() {
            if now.duration_since(*oldest) >= self.intensity.window {
                self.restarts.pop_front();
            } else {
                break;
            }
        }
        self.restarts.push_back(now);
        self.restarts.len() <= self.intensity.max_restarts
    }

    async fn stop_child(&self, child: RunningChild) {
        child.token.cancel();
        let mut monitor = child.monitor;
        if tokio::time::timeout(child.spec.shutdown_timeout, &mut monitor)
            .await
            .is_err()
        {
            tracing::warn!(supervisor = %self.name, child = %child.spec.id, "child ignored shutdown, aborting");
            child.task.abort();
            let _ = monitor.await;
        }
        tracing::debug!(supervisor = %self.name, child = %child.spec.id, "child stopped");
    }

    async fn stop_all(&mut self) {
        while let Some(child) = self.children.pop() {
            self.stop_child(child).await;
        }
        tracing::info!(supervisor = %self.name, "supervisor stopped");
    }
}
