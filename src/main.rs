//! wristlink - Wearable device link
//!
//! Connects to a watch (emulator TCP pipe or serial device), keeps the
//! connection alive, logs device events and optionally installs a bundle.

use clap::Parser;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;
use wristlink_client::{Config, DeviceConnector, DeviceHandle, Supervisor, TransportKind};
use wristlink_core::{
    ConnectionState, DeviceEvent, FsInstallSource, InstallKind, InstallRequest, Installable,
    MemorySampleStore,
};
use wristlink_protocol::AppMetadata;

#[derive(Parser)]
#[command(name = "wristlink")]
#[command(about = "Talk to a watch over its multiplexed wire protocol")]
#[command(version)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, env = "WRISTLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Device address: host:port for the emulator, or a serial device path
    #[arg(short, long)]
    address: Option<String>,

    /// Transport override (auto, serial, emulator)
    #[arg(short, long)]
    transport: Option<String>,

    /// Install manifest (YAML); binaries are read next to it
    #[arg(short, long)]
    install: Option<PathBuf>,

    /// Exit once the install finishes
    #[arg(long, requires = "install")]
    exit_after_install: bool,
}

/// Install bundle description read from YAML.
#[derive(Debug, Deserialize)]
struct Manifest {
    kind: InstallKind,
    uuid: Uuid,
    installables: Vec<Installable>,
    #[serde(default)]
    metadata: Option<AppMetadata>,
}

impl Manifest {
    fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&content)?)
    }

    fn request(&self, app_id: Option<u32>) -> InstallRequest {
        InstallRequest {
            kind: self.kind,
            uuid: self.uuid,
            app_id,
            installables: self.installables.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => {
            let mut config = Config::from_file(path).map_err(|e| {
                tracing::error!("Failed to load config: {}", e);
                e
            })?;
            config.apply_env_overrides();
            tracing::info!("Loaded config from {}", path.display());
            config
        }
        None => Config::from_env(),
    };

    if let Some(address) = cli.address {
        config.device.address = address;
    }
    if let Some(transport) = cli.transport.as_deref() {
        config.device.transport = match transport {
            "auto" => TransportKind::Auto,
            "serial" => TransportKind::Serial,
            "emulator" => TransportKind::Emulator,
            other => return Err(format!("unknown transport '{}'", other).into()),
        };
    }
    config.validate()?;

    let manifest = match &cli.install {
        Some(path) => Some(Manifest::load(path).map_err(|e| {
            tracing::error!("Failed to read install manifest {}: {}", path.display(), e);
            e
        })?),
        None => None,
    };
    let bundle_dir = cli
        .install
        .as_deref()
        .and_then(Path::parent)
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let connector = DeviceConnector::from_config(&config.device);
    tracing::info!("Starting wristlink");
    tracing::info!("  Device: {}", config.device.address);
    tracing::info!("  Transport: {:?}", connector.target());
    tracing::info!(
        "  Reconnect: {} attempts",
        config.connection.reconnect_attempts
    );

    let store = Arc::new(MemorySampleStore::new());
    let source = Arc::new(FsInstallSource::new(bundle_dir));
    let (supervisor, handle, mut events) = Supervisor::new(connector, &config, store, source);

    let supervisor_task = tokio::spawn(supervisor.run());

    let shutdown = handle.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, disconnecting...");
        shutdown.quit().await.ok();
    });

    let exit_after_install = cli.exit_after_install;
    let mut install_sent = false;
    while let Some(event) = events.recv().await {
        match serde_json::to_string(&event) {
            Ok(json) => tracing::info!("{}", json),
            Err(e) => tracing::warn!("Unserializable event {:?}: {}", event, e),
        }

        if let Some(manifest) = &manifest {
            on_install_event(&handle, manifest, &event, &mut install_sent, exit_after_install)
                .await;
        }
    }

    supervisor_task.await??;
    tracing::info!("Disconnected");
    Ok(())
}

/// Drives the optional install from the event stream.
async fn on_install_event(
    handle: &DeviceHandle,
    manifest: &Manifest,
    event: &DeviceEvent,
    install_sent: &mut bool,
    exit_after_install: bool,
) {
    let request = match event {
        DeviceEvent::Connection {
            state: ConnectionState::Initialized,
        } if !*install_sent => Some(manifest.request(None)),
        DeviceEvent::AppFetchRequest { uuid, app_id } if *uuid == manifest.uuid => {
            Some(manifest.request(Some(*app_id)))
        }
        DeviceEvent::InstallFinished { .. } if exit_after_install => {
            handle.quit().await.ok();
            None
        }
        _ => None,
    };

    if let Some(request) = request {
        *install_sent = true;
        if let Err(e) = handle.install(request).await {
            tracing::error!("Failed to queue install: {}", e);
        }
    }
}
