//! Node disk artifacts: overlay disks and cloud-init seed images.
//!
//! Each node owns a private qcow2 overlay layered on a shared read-only
//! base image, plus a small seed image that injects first-boot
//! configuration. Both live at deterministic paths under the overlay
//! directory so they can be found again from just the node id.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};
use vmlab_id::NodeId;

/// Bound on any disk-tool subprocess.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

const USER_DATA: &str = "\
#cloud-config
ssh_pwauth: true
chpasswd:
  expire: false
  list: |
    ubuntu:ubuntu
users:
  - name: ubuntu
    groups: sudo
    shell: /bin/bash
";

/// Errors from building or removing disk artifacts.
#[derive(Debug, Error)]
pub enum ImageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{command} failed: {stderr}")]
    CommandFailed {
        command: &'static str,
        stderr: String,
    },

    #[error("{command} timed out after {timeout:?}")]
    Timeout {
        command: &'static str,
        timeout: Duration,
    },
}

/// Disk artifact operations for one node.
#[async_trait]
pub trait ImageStore: Send + Sync {
    /// Deterministic path of the node's overlay disk.
    fn overlay_path(&self, id: NodeId) -> PathBuf;

    /// Deterministic path of the node's seed image.
    fn seed_path(&self, id: NodeId) -> PathBuf;

    /// Create a fresh overlay disk on top of the base image.
    async fn create_overlay(&self, id: NodeId) -> Result<PathBuf, ImageError>;

    /// Create the node's cloud-init seed image.
    async fn create_seed(&self, id: NodeId) -> Result<PathBuf, ImageError>;

    /// Delete and re-create the overlay from the base image. The seed is
    /// re-created best-effort; a node can boot without one.
    async fn reset(&self, id: NodeId) -> Result<(), ImageError>;

    /// Best-effort removal of both artifacts. Never fails; problems are
    /// logged so removal of the node record is not blocked.
    async fn remove(&self, id: NodeId);
}

/// Image store backed by `qemu-img` and `cloud-localds`.
pub struct QemuImageStore {
    base_image: PathBuf,
    overlay_dir: PathBuf,
}

impl QemuImageStore {
    pub fn new(base_image: impl Into<PathBuf>, overlay_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_image: base_image.into(),
            overlay_dir: overlay_dir.into(),
        }
    }

    async fn run(command: &'static str, args: &[&str]) -> Result<(), ImageError> {
        let output = tokio::time::timeout(
            COMMAND_TIMEOUT,
            Command::new(command).args(args).output(),
        )
        .await
        .map_err(|_| ImageError::Timeout {
            command,
            timeout: COMMAND_TIMEOUT,
        })??;

        if !output.status.success() {
            return Err(ImageError::CommandFailed {
                command,
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        Ok(())
    }

    async fn build_overlay(&self, path: &Path) -> Result<(), ImageError> {
        Self::run(
            "qemu-img",
            &[
                "create",
                "-f",
                "qcow2",
                "-F",
                "qcow2",
                "-b",
                &self.base_image.display().to_string(),
                &path.display().to_string(),
            ],
        )
        .await
    }

    fn remove_file_if_present(path: &Path) {
        match std::fs::remove_file(path) {
            Ok(()) => debug!(path = %path.display(), "removed artifact"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "failed to remove artifact"),
        }
    }
}

#[async_trait]
impl ImageStore for QemuImageStore {
    fn overlay_path(&self, id: NodeId) -> PathBuf {
        self.overlay_dir.join(format!("{id}.qcow2"))
    }

    fn seed_path(&self, id: NodeId) -> PathBuf {
        self.overlay_dir.join(format!("seed_{id}.img"))
    }

    async fn create_overlay(&self, id: NodeId) -> Result<PathBuf, ImageError> {
        let path = self.overlay_path(id);
        self.build_overlay(&path).await?;
        debug!(node_id = %id, path = %path.display(), "created overlay disk");
        Ok(path)
    }

    async fn create_seed(&self, id: NodeId) -> Result<PathBuf, ImageError> {
        let path = self.seed_path(id);

        let scratch = tempfile::tempdir()?;
        let user_data_path = scratch.path().join("user-data.yml");
        let meta_data_path = scratch.path().join("meta-data.yml");

        std::fs::write(&user_data_path, USER_DATA)?;
        std::fs::write(
            &meta_data_path,
            format!("instance-id: {id}\nlocal-hostname: node-{}\n", id.short()),
        )?;

        Self::run(
            "cloud-localds",
            &[
                &path.display().to_string(),
                &user_data_path.display().to_string(),
                &meta_data_path.display().to_string(),
            ],
        )
        .await?;

        debug!(node_id = %id, path = %path.display(), "created seed image");
        Ok(path)
    }

    async fn reset(&self, id: NodeId) -> Result<(), ImageError> {
        let overlay = self.overlay_path(id);
        let seed = self.seed_path(id);

        Self::remove_file_if_present(&overlay);
        Self::remove_file_if_present(&seed);

        self.build_overlay(&overlay).await?;

        if let Err(e) = self.create_seed(id).await {
            warn!(node_id = %id, error = %e, "failed to re-create seed image, node will boot without one");
        }

        Ok(())
    }

    async fn remove(&self, id: NodeId) {
        Self::remove_file_if_present(&self.overlay_path(id));
        Self::remove_file_if_present(&self.seed_path(id));
    }
}

/// In-memory-configurable image store used by registry tests.
///
/// Artifacts are plain empty files under a test-owned directory; failure
/// modes can be toggled per operation.
pub struct MockImageStore {
    root: PathBuf,
    fail_overlay: AtomicBool,
    fail_seed: AtomicBool,
    fail_reset: AtomicBool,
    resets: Mutex<Vec<NodeId>>,
}

impl MockImageStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            fail_overlay: AtomicBool::new(false),
            fail_seed: AtomicBool::new(false),
            fail_reset: AtomicBool::new(false),
            resets: Mutex::new(Vec::new()),
        }
    }

    pub fn set_fail_overlay(&self, fail: bool) {
        self.fail_overlay.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_seed(&self, fail: bool) {
        self.fail_seed.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_reset(&self, fail: bool) {
        self.fail_reset.store(fail, Ordering::SeqCst);
    }

    /// Node ids that have been reset, in order.
    pub fn resets(&self) -> Vec<NodeId> {
        self.resets.lock().expect("mock image store lock poisoned").clone()
    }

    fn mock_failure(command: &'static str) -> ImageError {
        ImageError::CommandFailed {
            command,
            stderr: "mock failure".to_string(),
        }
    }
}

#[async_trait]
impl ImageStore for MockImageStore {
    fn overlay_path(&self, id: NodeId) -> PathBuf {
        self.root.join(format!("{id}.qcow2"))
    }

    fn seed_path(&self, id: NodeId) -> PathBuf {
        self.root.join(format!("seed_{id}.img"))
    }

    async fn create_overlay(&self, id: NodeId) -> Result<PathBuf, ImageError> {
        if self.fail_overlay.load(Ordering::SeqCst) {
            return Err(Self::mock_failure("qemu-img"));
        }
        let path = self.overlay_path(id);
        std::fs::write(&path, b"")?;
        Ok(path)
    }

    async fn create_seed(&self, id: NodeId) -> Result<PathBuf, ImageError> {
        if self.fail_seed.load(Ordering::SeqCst) {
            return Err(Self::mock_failure("cloud-localds"));
        }
        let path = self.seed_path(id);
        std::fs::write(&path, b"")?;
        Ok(path)
    }

    async fn reset(&self, id: NodeId) -> Result<(), ImageError> {
        if self.fail_reset.load(Ordering::SeqCst) {
            return Err(Self::mock_failure("qemu-img"));
        }
        std::fs::write(self.overlay_path(id), b"")?;
        std::fs::write(self.seed_path(id), b"")?;
        self.resets
            .lock()
            .expect("mock image store lock poisoned")
            .push(id);
        Ok(())
    }

    async fn remove(&self, id: NodeId) {
        let _ = std::fs::remove_file(self.overlay_path(id));
        let _ = std::fs::remove_file(self.seed_path(id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_paths_are_deterministic() {
        let store = QemuImageStore::new("/images/base.qcow2", "/overlays");
        let id = NodeId::new();
        assert_eq!(store.overlay_path(id), store.overlay_path(id));
        assert_eq!(
            store.overlay_path(id),
            PathBuf::from(format!("/overlays/{id}.qcow2"))
        );
        assert_eq!(
            store.seed_path(id),
            PathBuf::from(format!("/overlays/seed_{id}.img"))
        );
    }

    #[tokio::test]
    async fn mock_store_creates_and_removes_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = MockImageStore::new(dir.path());
        let id = NodeId::new();

        let overlay = store.create_overlay(id).await.unwrap();
        let seed = store.create_seed(id).await.unwrap();
        assert!(overlay.exists());
        assert!(seed.exists());

        store.remove(id).await;
        assert!(!overlay.exists());
        assert!(!seed.exists());
    }

    #[tokio::test]
    async fn mock_store_failure_modes() {
        let dir = tempfile::tempdir().unwrap();
        let store = MockImageStore::new(dir.path());
        let id = NodeId::new();

        store.set_fail_overlay(true);
        assert!(store.create_overlay(id).await.is_err());
        store.set_fail_overlay(false);

        store.set_fail_seed(true);
        assert!(store.create_seed(id).await.is_err());

        store.set_fail_reset(true);
        assert!(store.reset(id).await.is_err());
        assert!(store.resets().is_empty());
    }

    #[tokio::test]
    async fn mock_store_records_resets() {
        let dir = tempfile::tempdir().unwrap();
        let store = MockImageStore::new(dir.path());
        let id = NodeId::new();
        store.reset(id).await.unwrap();
        assert_eq!(store.resets(), vec![id]);
    }
}
