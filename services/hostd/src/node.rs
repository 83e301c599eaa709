//! Node records and lifecycle status.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use vmlab_id::NodeId;

/// Lifecycle status of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Stopped,
    Running,
}

/// Fields that exist only while a node is running.
///
/// Grouping them in one struct keeps pid, display port, and broker
/// connection id present together or absent together; there is no
/// representable half-running node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeState {
    /// OS process id of the hypervisor.
    pub pid: u32,

    /// Display port the hypervisor's VNC server listens on.
    pub display_port: u16,

    /// Broker connection record pointing at the display port.
    pub connection_id: String,
}

/// One managed node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Stable identity, assigned at creation.
    pub id: NodeId,

    /// The node's private writable disk image. Set at creation, survives
    /// stop/start, removed at deletion.
    pub overlay_path: PathBuf,

    /// Present iff the node is running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<RuntimeState>,
}

impl NodeRecord {
    /// Create a freshly provisioned, stopped node.
    pub fn new(id: NodeId, overlay_path: PathBuf) -> Self {
        Self {
            id,
            overlay_path,
            runtime: None,
        }
    }

    /// The node's current status, derived from runtime presence.
    pub fn status(&self) -> NodeStatus {
        if self.runtime.is_some() {
            NodeStatus::Running
        } else {
            NodeStatus::Stopped
        }
    }
}
