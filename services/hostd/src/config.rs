//! Configuration for the host daemon.

use std::net::SocketAddr;
use std::ops::RangeInclusive;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use crate::broker::BrokerConfig;

/// Host daemon configuration, loaded from `VMLAB_`-prefixed environment
/// variables with development-friendly defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP API listens on.
    pub listen_addr: SocketAddr,

    /// Read-only base image overlays are layered on.
    pub base_image: PathBuf,

    /// Directory for per-node overlays, seeds, and the state file.
    pub overlay_dir: PathBuf,

    /// Path of the durable state document.
    pub state_file: PathBuf,

    /// Inclusive display port range.
    pub port_range_start: u16,
    pub port_range_end: u16,

    /// Guest memory per node in MiB.
    pub guest_memory_mib: u32,

    /// Connection broker settings.
    pub broker: BrokerConfig,

    /// Base URL clients open broker sessions under.
    pub client_base_url: String,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let listen_addr = env_or("VMLAB_LISTEN_ADDR", "127.0.0.1:8000")
            .parse()
            .context("invalid VMLAB_LISTEN_ADDR")?;

        let base_image = PathBuf::from(env_or(
            "VMLAB_BASE_IMAGE",
            "/var/lib/vmlab/images/base.qcow2",
        ));
        let overlay_dir = PathBuf::from(env_or("VMLAB_OVERLAY_DIR", "/var/lib/vmlab/overlays"));

        let state_file = std::env::var("VMLAB_STATE_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| overlay_dir.join("state.json"));

        let port_range_start = env_or("VMLAB_PORT_RANGE_START", "5900")
            .parse()
            .context("invalid VMLAB_PORT_RANGE_START")?;
        let port_range_end = env_or("VMLAB_PORT_RANGE_END", "5920")
            .parse()
            .context("invalid VMLAB_PORT_RANGE_END")?;
        if port_range_start > port_range_end {
            bail!("VMLAB_PORT_RANGE_START must not exceed VMLAB_PORT_RANGE_END");
        }

        let guest_memory_mib = env_or("VMLAB_GUEST_MEMORY_MIB", "2048")
            .parse()
            .context("invalid VMLAB_GUEST_MEMORY_MIB")?;

        let broker = BrokerConfig {
            base_url: env_or("VMLAB_BROKER_URL", "http://127.0.0.1:8080/guacamole"),
            username: env_or("VMLAB_BROKER_USERNAME", "guacadmin"),
            password: env_or("VMLAB_BROKER_PASSWORD", "guacadmin"),
            data_source: env_or("VMLAB_BROKER_DATA_SOURCE", "postgresql"),
            vnc_host: env_or("VMLAB_VNC_HOST", "127.0.0.1"),
        };

        let client_base_url = env_or(
            "VMLAB_CLIENT_BASE_URL",
            "http://127.0.0.1:8080/guacamole",
        );

        let log_level = env_or("VMLAB_LOG_LEVEL", "info");

        Ok(Self {
            listen_addr,
            base_image,
            overlay_dir,
            state_file,
            port_range_start,
            port_range_end,
            guest_memory_mib,
            broker,
            client_base_url,
            log_level,
        })
    }

    /// The configured display port range.
    pub fn port_range(&self) -> RangeInclusive<u16> {
        self.port_range_start..=self.port_range_end
    }
}
