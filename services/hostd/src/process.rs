//! Hypervisor process supervision.
//!
//! The supervisor interface abstracts the three facts the registry needs
//! about hypervisor processes: whether a pid is alive, how to launch one
//! for a node, and how to terminate one. A mock implementation backed by
//! an in-memory process table is provided for tests.

use std::collections::HashSet;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};
use vmlab_id::NodeId;

/// VNC display numbers are offsets from this base port.
const VNC_BASE_PORT: u16 = 5900;

/// Errors from supervising hypervisor processes.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to launch hypervisor: {0}")]
    LaunchFailed(#[source] std::io::Error),
}

/// What the supervisor needs to boot one node.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub node_id: NodeId,

    /// The node's private writable disk.
    pub overlay_path: PathBuf,

    /// Deterministic seed image path; may not exist, which is tolerated.
    pub seed_path: PathBuf,

    /// Port the guest's VNC server must listen on.
    pub display_port: u16,
}

/// Hypervisor process lifecycle operations.
#[async_trait]
pub trait ProcessSupervisor: Send + Sync {
    /// True iff a process with this pid currently exists and is signalable.
    /// Never errors for arbitrary or stale pids.
    fn is_alive(&self, pid: u32) -> bool;

    /// Launch the hypervisor for a node, returning the new process id.
    async fn start(&self, launch: &LaunchSpec) -> Result<u32, SupervisorError>;

    /// Terminate a process: graceful signal, bounded grace period, then a
    /// forceful kill only if still alive. "Already gone" is success.
    async fn stop(&self, pid: u32);
}

/// Configuration for the QEMU supervisor.
#[derive(Debug, Clone)]
pub struct QemuSupervisorConfig {
    /// Path to the qemu binary.
    pub qemu_path: PathBuf,
    /// Guest memory in MiB.
    pub memory_mib: u32,
    /// How long to wait after SIGTERM before escalating to SIGKILL.
    pub grace_period: Duration,
}

impl Default for QemuSupervisorConfig {
    fn default() -> Self {
        Self {
            qemu_path: PathBuf::from("qemu-system-x86_64"),
            memory_mib: 2048,
            grace_period: Duration::from_secs(1),
        }
    }
}

/// Supervisor that launches real QEMU processes.
pub struct QemuSupervisor {
    config: QemuSupervisorConfig,
}

impl QemuSupervisor {
    pub fn new(config: QemuSupervisorConfig) -> Self {
        Self { config }
    }

    fn signal(pid: u32, signal: i32) {
        // A non-positive pid would address a process group, never a node.
        let Ok(pid) = i32::try_from(pid) else { return };
        if pid <= 0 {
            return;
        }
        // Safety: sending a signal to a pid we do not own is harmless; the
        // kernel rejects it with ESRCH/EPERM.
        unsafe {
            libc::kill(pid, signal);
        }
    }
}

#[async_trait]
impl ProcessSupervisor for QemuSupervisor {
    fn is_alive(&self, pid: u32) -> bool {
        let Ok(pid) = i32::try_from(pid) else {
            return false;
        };
        if pid <= 0 {
            return false;
        }
        // Signal 0 probes existence without delivering anything.
        (unsafe { libc::kill(pid, 0) }) == 0
    }

    async fn start(&self, launch: &LaunchSpec) -> Result<u32, SupervisorError> {
        let display = launch.display_port.saturating_sub(VNC_BASE_PORT);

        let mut command = Command::new(&self.config.qemu_path);
        command
            .arg("-cpu")
            .arg("host")
            .arg("-machine")
            .arg("type=q35,accel=kvm")
            .arg("-m")
            .arg(self.config.memory_mib.to_string())
            .arg("-nographic")
            .arg("-netdev")
            .arg("user,id=net0")
            .arg("-device")
            .arg("virtio-net-pci,netdev=net0")
            .arg("-drive")
            .arg(format!(
                "file={},if=virtio,format=qcow2",
                launch.overlay_path.display()
            ));

        if launch.seed_path.exists() {
            command.arg("-drive").arg(format!(
                "file={},format=raw,if=virtio",
                launch.seed_path.display()
            ));
        } else {
            warn!(
                node_id = %launch.node_id,
                seed_path = %launch.seed_path.display(),
                "no seed image found, booting without first-boot configuration"
            );
        }

        command
            .arg("-vnc")
            .arg(format!("0.0.0.0:{display}"))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        let mut child = command.spawn().map_err(SupervisorError::LaunchFailed)?;

        let Some(pid) = child.id() else {
            return Err(SupervisorError::LaunchFailed(std::io::Error::other(
                "hypervisor exited during startup",
            )));
        };

        // Reap the child when it exits so dead hypervisors do not linger
        // as zombies and fool the liveness probe.
        let node_id = launch.node_id;
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => info!(node_id = %node_id, pid, %status, "hypervisor process exited"),
                Err(e) => warn!(node_id = %node_id, pid, error = %e, "failed to reap hypervisor process"),
            }
        });

        info!(
            node_id = %launch.node_id,
            pid,
            display_port = launch.display_port,
            "hypervisor process launched"
        );

        Ok(pid)
    }

    async fn stop(&self, pid: u32) {
        if !self.is_alive(pid) {
            debug!(pid, "process already gone");
            return;
        }

        Self::signal(pid, libc::SIGTERM);
        tokio::time::sleep(self.config.grace_period).await;

        if self.is_alive(pid) {
            warn!(pid, "process survived graceful termination, sending SIGKILL");
            Self::signal(pid, libc::SIGKILL);
        }
    }
}

/// Mock supervisor backed by an in-memory process table.
///
/// Tests can "kill" a pid externally to simulate hypervisor death and flip
/// launches into a failing mode.
pub struct MockSupervisor {
    next_pid: AtomicU32,
    alive: Mutex<HashSet<u32>>,
    launches: Mutex<Vec<LaunchSpec>>,
    fail_starts: AtomicBool,
}

impl MockSupervisor {
    pub fn new() -> Self {
        Self {
            next_pid: AtomicU32::new(1000),
            alive: Mutex::new(HashSet::new()),
            launches: Mutex::new(Vec::new()),
            fail_starts: AtomicBool::new(false),
        }
    }

    /// Make subsequent launches fail (or succeed again).
    pub fn set_fail_starts(&self, fail: bool) {
        self.fail_starts.store(fail, Ordering::SeqCst);
    }

    /// Simulate a process dying outside the registry's control.
    pub fn kill(&self, pid: u32) {
        self.alive
            .lock()
            .expect("mock process table lock poisoned")
            .remove(&pid);
    }

    /// Simulate every tracked process dying at once, e.g. a host reboot.
    pub fn kill_all(&self) {
        self.alive
            .lock()
            .expect("mock process table lock poisoned")
            .clear();
    }

    /// Every launch the supervisor has performed.
    pub fn launches(&self) -> Vec<LaunchSpec> {
        self.launches
            .lock()
            .expect("mock process table lock poisoned")
            .clone()
    }
}

impl Default for MockSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessSupervisor for MockSupervisor {
    fn is_alive(&self, pid: u32) -> bool {
        self.alive
            .lock()
            .expect("mock process table lock poisoned")
            .contains(&pid)
    }

    async fn start(&self, launch: &LaunchSpec) -> Result<u32, SupervisorError> {
        if self.fail_starts.load(Ordering::SeqCst) {
            return Err(SupervisorError::LaunchFailed(std::io::Error::other(
                "mock launch failure",
            )));
        }

        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        self.alive
            .lock()
            .expect("mock process table lock poisoned")
            .insert(pid);
        self.launches
            .lock()
            .expect("mock process table lock poisoned")
            .push(launch.clone());
        Ok(pid)
    }

    async fn stop(&self, pid: u32) {
        self.kill(pid);
    }
}
