//! Node registry: the lifecycle state machine for lab nodes.
//!
//! The registry is the only component callers invoke directly. It owns
//! every node record and the display-port pool, sequences each operation
//! against the process supervisor, image store, and connection broker,
//! and persists state write-through after every mutation.
//!
//! Multi-step operations compensate on failure: a failed start releases
//! its port and deletes any broker connection it created before the
//! error is surfaced, so callers never observe a half-provisioned node.

use std::collections::{BTreeSet, HashMap};
use std::ops::RangeInclusive;
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};
use vmlab_id::NodeId;

use crate::broker::{BrokerClient, BrokerError};
use crate::images::{ImageError, ImageStore};
use crate::node::{NodeRecord, RuntimeState};
use crate::ports::{PortExhausted, PortPool};
use crate::process::{LaunchSpec, ProcessSupervisor, SupervisorError};
use crate::state::{PersistedState, StateStore, StoreError};

/// Errors surfaced by registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("node {0} not found")]
    NotFound(NodeId),

    #[error("node {0} is already running")]
    InvalidState(NodeId),

    #[error(transparent)]
    ResourceExhausted(#[from] PortExhausted),

    #[error("failed to provision node: {0}")]
    ProvisionFailed(#[source] ImageError),

    #[error("failed to wipe node: {0}")]
    WipeFailed(#[source] ImageError),

    #[error("failed to start node: {0}")]
    StartFailed(#[source] StartError),

    #[error("failed to persist state: {0}")]
    Store(#[from] StoreError),
}

/// The start-sequence step that failed.
#[derive(Debug, Error)]
pub enum StartError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Launch(#[from] SupervisorError),
}

/// Everything the registry guards: the node map and the port pool change
/// together, under one lock, and are persisted together.
struct RegistryState {
    nodes: HashMap<NodeId, NodeRecord>,
    ports: PortPool,
}

/// Owner of all node lifecycle state on this host.
pub struct NodeRegistry {
    state: Mutex<RegistryState>,
    store: StateStore,
    supervisor: Arc<dyn ProcessSupervisor>,
    images: Arc<dyn ImageStore>,
    broker: Arc<BrokerClient>,
}

impl NodeRegistry {
    /// Load persisted state and reconcile it with reality: running nodes
    /// whose process died while the daemon was down are demoted to
    /// stopped, and the port pool is rebuilt from the configured range
    /// minus the ports still held.
    pub fn recover(
        store: StateStore,
        port_range: RangeInclusive<u16>,
        supervisor: Arc<dyn ProcessSupervisor>,
        images: Arc<dyn ImageStore>,
        broker: Arc<BrokerClient>,
    ) -> Result<Self, RegistryError> {
        let persisted = store.load()?.unwrap_or_default();

        let mut nodes = persisted.nodes;
        let mut demoted = 0usize;
        for node in nodes.values_mut() {
            if let Some(runtime) = &node.runtime {
                if !supervisor.is_alive(runtime.pid) {
                    warn!(
                        node_id = %node.id,
                        pid = runtime.pid,
                        "node was running but its process is gone, marking stopped"
                    );
                    node.runtime = None;
                    demoted += 1;
                }
            }
        }

        let held: BTreeSet<u16> = nodes
            .values()
            .filter_map(|n| n.runtime.as_ref().map(|rt| rt.display_port))
            .collect();
        let ports = PortPool::with_held(port_range, &held);

        let state = RegistryState { nodes, ports };
        Self::persist(&store, &state)?;

        if demoted > 0 {
            info!(demoted, "demoted stale running nodes during recovery");
        }

        Ok(Self {
            state: Mutex::new(state),
            store,
            supervisor,
            images,
            broker,
        })
    }

    fn persist(store: &StateStore, state: &RegistryState) -> Result<(), StoreError> {
        store.save(&PersistedState {
            nodes: state.nodes.clone(),
            free_ports: state.ports.free_ports(),
        })
    }

    /// Provision a new stopped node: overlay disk plus seed image.
    ///
    /// If the seed fails after the overlay succeeded, the overlay is
    /// rolled back so no orphan artifact remains.
    pub async fn create(&self) -> Result<NodeRecord, RegistryError> {
        let mut state = self.state.lock().await;

        let id = NodeId::new();
        let overlay_path = self
            .images
            .create_overlay(id)
            .await
            .map_err(RegistryError::ProvisionFailed)?;

        if let Err(e) = self.images.create_seed(id).await {
            warn!(node_id = %id, error = %e, "seed creation failed, rolling back overlay");
            self.images.remove(id).await;
            return Err(RegistryError::ProvisionFailed(e));
        }

        let node = NodeRecord::new(id, overlay_path);
        state.nodes.insert(id, node.clone());
        Self::persist(&self.store, &state)?;

        info!(node_id = %id, "created node");
        Ok(node)
    }

    /// Start a stopped node.
    ///
    /// A node marked running whose process is verifiably dead is first
    /// self-healed to stopped and then started normally.
    pub async fn start(&self, id: NodeId) -> Result<NodeRecord, RegistryError> {
        let mut state = self.state.lock().await;

        let stale_port = {
            let node = state.nodes.get(&id).ok_or(RegistryError::NotFound(id))?;
            match &node.runtime {
                Some(rt) if self.supervisor.is_alive(rt.pid) => {
                    return Err(RegistryError::InvalidState(id));
                }
                Some(rt) => Some(rt.display_port),
                None => None,
            }
        };

        if let Some(port) = stale_port {
            warn!(node_id = %id, "node marked running but its process is dead, self-healing to stopped");
            if let Some(node) = state.nodes.get_mut(&id) {
                node.runtime = None;
            }
            state.ports.release(port);
            Self::persist(&self.store, &state)?;
        }

        let overlay_path = state
            .nodes
            .get(&id)
            .ok_or(RegistryError::NotFound(id))?
            .overlay_path
            .clone();

        let port = state.ports.acquire()?;

        match self.provision_runtime(id, port, &overlay_path).await {
            Ok(runtime) => {
                let pid = runtime.pid;
                let node = state.nodes.get_mut(&id).ok_or(RegistryError::NotFound(id))?;
                node.runtime = Some(runtime);
                let snapshot = node.clone();
                Self::persist(&self.store, &state)?;
                info!(node_id = %id, port, pid, "node started");
                Ok(snapshot)
            }
            Err(e) => {
                // The port never reached persisted state, so releasing it
                // restores exactly the pre-start document.
                state.ports.release(port);
                Err(RegistryError::StartFailed(e))
            }
        }
    }

    /// Steps 3-5 of the start sequence: broker connection, then process.
    ///
    /// Rolls the broker connection back itself if the launch fails; the
    /// caller owns the port.
    async fn provision_runtime(
        &self,
        id: NodeId,
        port: u16,
        overlay_path: &Path,
    ) -> Result<RuntimeState, StartError> {
        let token = self.broker.authenticate().await?;

        let name = format!("node-{}", id.short());
        let connection_id = self.broker.create_connection(&token, &name, port).await?;

        let launch = LaunchSpec {
            node_id: id,
            overlay_path: overlay_path.to_path_buf(),
            seed_path: self.images.seed_path(id),
            display_port: port,
        };

        match self.supervisor.start(&launch).await {
            Ok(pid) => Ok(RuntimeState {
                pid,
                display_port: port,
                connection_id,
            }),
            Err(e) => {
                // Best-effort rollback; the launch failure is what the
                // caller must see, not a secondary broker error.
                if let Err(del) = self.broker.delete_connection(&token, &connection_id).await {
                    warn!(
                        node_id = %id,
                        connection_id = %connection_id,
                        error = %del,
                        "failed to roll back broker connection after launch failure"
                    );
                }
                Err(StartError::Launch(e))
            }
        }
    }

    /// Stop a running node. Stopping an already-stopped node is a no-op.
    pub async fn stop(&self, id: NodeId) -> Result<NodeRecord, RegistryError> {
        let mut state = self.state.lock().await;
        self.stop_locked(&mut state, id).await?;
        state
            .nodes
            .get(&id)
            .cloned()
            .ok_or(RegistryError::NotFound(id))
    }

    async fn stop_locked(
        &self,
        state: &mut RegistryState,
        id: NodeId,
    ) -> Result<(), RegistryError> {
        let node = state.nodes.get(&id).ok_or(RegistryError::NotFound(id))?;
        let Some(runtime) = node.runtime.clone() else {
            return Ok(());
        };

        self.supervisor.stop(runtime.pid).await;

        // Broker cleanup is secondary: the node must end up stopped even
        // if the connection record lingers remotely.
        match self.broker.authenticate().await {
            Ok(token) => {
                if let Err(e) = self
                    .broker
                    .delete_connection(&token, &runtime.connection_id)
                    .await
                {
                    warn!(
                        node_id = %id,
                        connection_id = %runtime.connection_id,
                        error = %e,
                        "failed to delete broker connection"
                    );
                }
            }
            Err(e) => {
                warn!(node_id = %id, error = %e, "broker authentication failed, leaving connection behind");
            }
        }

        state.ports.release(runtime.display_port);
        if let Some(node) = state.nodes.get_mut(&id) {
            node.runtime = None;
        }
        Self::persist(&self.store, state)?;

        info!(node_id = %id, "node stopped");
        Ok(())
    }

    /// Reset a node to a pristine overlay. A running node is stopped
    /// first; a stopped node only has its disks reset.
    pub async fn wipe(&self, id: NodeId) -> Result<NodeRecord, RegistryError> {
        let mut state = self.state.lock().await;
        self.stop_locked(&mut state, id).await?;

        self.images
            .reset(id)
            .await
            .map_err(RegistryError::WipeFailed)?;

        info!(node_id = %id, "node wiped");
        state
            .nodes
            .get(&id)
            .cloned()
            .ok_or(RegistryError::NotFound(id))
    }

    /// Remove a node entirely. A running node is stopped first; file
    /// cleanup is best-effort and never blocks removal of the record.
    pub async fn delete(&self, id: NodeId) -> Result<(), RegistryError> {
        let mut state = self.state.lock().await;
        self.stop_locked(&mut state, id).await?;

        self.images.remove(id).await;

        state.nodes.remove(&id);
        Self::persist(&self.store, &state)?;

        info!(node_id = %id, "node deleted");
        Ok(())
    }

    /// All nodes, with running status re-validated against process
    /// liveness. Demotions are persisted before the list is returned, so
    /// a repeated enumeration makes no further change.
    pub async fn list(&self) -> Result<Vec<NodeRecord>, RegistryError> {
        let mut state = self.state.lock().await;

        let stale: Vec<(NodeId, u16)> = state
            .nodes
            .values()
            .filter_map(|node| {
                node.runtime
                    .as_ref()
                    .filter(|rt| !self.supervisor.is_alive(rt.pid))
                    .map(|rt| (node.id, rt.display_port))
            })
            .collect();

        if !stale.is_empty() {
            for (id, port) in &stale {
                warn!(node_id = %id, "node process died, demoting to stopped");
                if let Some(node) = state.nodes.get_mut(id) {
                    node.runtime = None;
                }
                state.ports.release(*port);
            }
            Self::persist(&self.store, &state)?;
        }

        let mut nodes: Vec<NodeRecord> = state.nodes.values().cloned().collect();
        nodes.sort_by_key(|node| node.id);
        Ok(nodes)
    }
}
