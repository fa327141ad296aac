//! Top-level process tree.
//!
//! The root is a one-for-one supervisor over the device's long-lived
//! subsystems. Every child is permanent. The networking subtree is always
//! present; the other collaborators are supplied by the embedding
//! application and are started in [`Collaborator`] order.

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::SupervisorError;
use crate::network::InterfaceSupervisor;
use crate::supervisor::{ChildSpec, Intensity, Supervisor, SupervisorHandle, Worker};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Collaborator {
    Storage,
    Network,
    RemoteShell,
    BotState,
    Serial,
    ApiSync,
    Scheduler,
    Rpc,
}

impl Collaborator {
    pub fn id(self) -> &'static str {
        match self {
            Collaborator::Storage => "storage",
            Collaborator::Network => "network",
            Collaborator::RemoteShell => "remote-shell",
            Collaborator::BotState => "bot-state",
            Collaborator::Serial => "serial",
            Collaborator::ApiSync => "api-sync",
            Collaborator::Scheduler => "scheduler",
            Collaborator::Rpc => "rpc",
        }
    }
}

pub struct RootTree {
    intensity: Intensity,
    children: BTreeMap<Collaborator, Arc<dyn Worker>>,
}

impl RootTree {
    pub fn new(network: Arc<InterfaceSupervisor>) -> Self {
        let mut children: BTreeMap<Collaborator, Arc<dyn Worker>> = BTreeMap::new();
        children.insert(Collaborator::Network, network);
        Self {
            intensity: Intensity::default(),
            children,
        }
    }

    /// Add (or replace) a collaborator subtree.
    pub fn with_collaborator(mut self, kind: Collaborator, worker: Arc<dyn Worker>) -> Self {
        self.children.insert(kind, worker);
        self
    }

    pub fn with_intensity(mut self, intensity: Intensity) -> Self {
        self.intensity = intensity;
        self
    }

    pub fn start(
        self,
        shutdown: CancellationToken,
    ) -> (SupervisorHandle, JoinHandle<Result<(), SupervisorError>>) {
        self.children
            .into_iter()
            .fold(
                Supervisor::new("root").with_intensity(self.intensity),
                |root, (kind, worker)| root.child(ChildSpec::permanent(kind.id(), worker)),
            )
            .start(shutdown)
    }
}
