//! vmlab host daemon
//!
//! Serves the node lifecycle API and drives VM nodes on this host. On
//! startup, persisted state is loaded and reconciled against live
//! processes before the first request is served.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use vmlab_hostd::api::{self, AppState};
use vmlab_hostd::broker::BrokerClient;
use vmlab_hostd::config::Config;
use vmlab_hostd::images::QemuImageStore;
use vmlab_hostd::process::{QemuSupervisor, QemuSupervisorConfig};
use vmlab_hostd::registry::NodeRegistry;
use vmlab_hostd::state::StateStore;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to VMLAB_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting vmlab host daemon");
    info!(
        listen_addr = %config.listen_addr,
        overlay_dir = %config.overlay_dir.display(),
        base_image = %config.base_image.display(),
        "Configuration loaded"
    );

    std::fs::create_dir_all(&config.overlay_dir).with_context(|| {
        format!(
            "failed to create overlay directory {}",
            config.overlay_dir.display()
        )
    })?;

    let supervisor = Arc::new(QemuSupervisor::new(QemuSupervisorConfig {
        memory_mib: config.guest_memory_mib,
        ..Default::default()
    }));
    let images = Arc::new(QemuImageStore::new(
        config.base_image.clone(),
        config.overlay_dir.clone(),
    ));
    let broker = Arc::new(BrokerClient::new(config.broker.clone()));
    let store = StateStore::new(config.state_file.clone());

    let registry = match NodeRegistry::recover(
        store,
        config.port_range(),
        supervisor,
        images,
        Arc::clone(&broker),
    ) {
        Ok(registry) => {
            info!("Registry state recovered");
            registry
        }
        Err(e) => {
            error!(error = %e, "Failed to recover registry state");
            return Err(e.into());
        }
    };

    let state = AppState::new(
        registry,
        config.client_base_url.clone(),
        config.broker.data_source.clone(),
    );
    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, "Listening for connections");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received shutdown signal");
        })
        .await?;

    info!("Host daemon shutdown complete");
    Ok(())
}
