// src/server/mod.rs

use crate::client;
use crate::config::CellConfig;
use crate::core::aha::AhaCell;
use crate::core::cell::{BaseCell, CellLogic};
use crate::core::errors::AhaError;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

mod connection_loop;
pub mod http_api;
mod initialization;
mod spawner;
mod stream;

pub use stream::AnyStream;

/// A running cell's listeners and background tasks, shut down as a unit.
pub struct ServerHandle {
    pub shutdown_tx: broadcast::Sender<()>,
    pub dmon_addr: Option<SocketAddr>,
    pub prov_addr: Option<SocketAddr>,
    pub http_addr: Option<SocketAddr>,
    local_name: String,
}

impl ServerHandle {
    /// The in-process URL of this cell, for local admin tools.
    pub fn local_url(&self) -> String {
        format!("cell://{}", self.local_name)
    }

    /// Signals every task and listener to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        client::unregister_local_cell(&self.local_name);
    }
}

fn local_name(dirn: &Path) -> String {
    dirn.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "cell".to_string())
}

/// Starts an AHA server from an opened cell: binds listeners, spawns the
/// background tasks, and registers the cell for `cell://` dials.
pub async fn launch_aha(aha: Arc<AhaCell>) -> Result<ServerHandle, AhaError> {
    let (shutdown_tx, _) = broadcast::channel(1);

    let listeners = initialization::setup(&aha.cell).await?;
    let dmon_addr = listeners.dmon.local_addr();
    let prov_addr = listeners.prov.as_ref().and_then(|l| l.local_addr());

    {
        let logic = aha.clone() as Arc<dyn CellLogic>;
        let shutdown = shutdown_tx.clone();
        tokio::spawn(connection_loop::run_listener(
            logic,
            listeners.dmon,
            false,
            shutdown,
        ));
    }
    if let Some(prov) = listeners.prov {
        let logic = aha.clone() as Arc<dyn CellLogic>;
        let shutdown = shutdown_tx.clone();
        tokio::spawn(connection_loop::run_listener(logic, prov, true, shutdown));
    }

    let mut http_addr = None;
    if let Some(port) = aha.cell.conf.https_port {
        http_addr = Some(http_api::start(aha.clone(), port, shutdown_tx.subscribe()).await?);
    }

    spawner::spawn_all(&aha, &shutdown_tx);

    let name = local_name(&aha.cell.dirn);
    client::register_local_cell(&name, aha.clone());

    Ok(ServerHandle {
        shutdown_tx,
        dmon_addr,
        prov_addr,
        http_addr,
        local_name: name,
    })
}

/// Boots a member cell from its directory: provisions it when a one-time
/// URL is pending, binds its RPC listener, and starts the registry client.
pub async fn boot_cell(dirn: &Path) -> Result<(Arc<BaseCell>, ServerHandle), AhaError> {
    let mut conf = CellConfig::from_dir(dirn)?;
    if client::bootstrap::needs_provisioning(dirn, &conf)? {
        conf = client::bootstrap::provision_cell(dirn, &conf).await?;
    }

    let cell = BaseCell::new(dirn, conf)?;
    let handle = launch_cell(cell.clone()).await?;
    Ok((cell, handle))
}

/// Starts a member cell's listener and registry client task.
pub async fn launch_cell(cell: Arc<BaseCell>) -> Result<ServerHandle, AhaError> {
    let (shutdown_tx, _) = broadcast::channel(1);

    let listeners = initialization::setup(&cell.cell).await?;
    let dmon_addr = listeners.dmon.local_addr();

    {
        let logic = cell.clone() as Arc<dyn CellLogic>;
        let shutdown = shutdown_tx.clone();
        tokio::spawn(connection_loop::run_listener(
            logic,
            listeners.dmon,
            false,
            shutdown,
        ));
    }

    {
        let logic = cell.clone() as Arc<dyn CellLogic>;
        let active_rx = cell.active_rx();
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(client::run_registry_client(logic, active_rx, shutdown_rx));
    }

    let name = local_name(&cell.cell.dirn);
    client::register_local_cell(&name, cell.clone());

    Ok(ServerHandle {
        shutdown_tx,
        dmon_addr,
        prov_addr: None,
        http_addr: None,
        local_name: name,
    })
}

/// The blocking server entry point used by `main`: opens the AHA cell in
/// `dirn` and serves until SIGINT/SIGTERM.
pub async fn run(dirn: &Path, conf: CellConfig) -> Result<(), AhaError> {
    let aha = AhaCell::open(dirn, conf).await?;
    let handle = launch_aha(aha.clone()).await?;

    connection_loop::await_shutdown_signal().await;

    handle.shutdown();
    // Give listeners and tasks a moment to observe the signal, then take
    // the final snapshot if the spawner's task lost the race.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    aha.save_snapshot().await?;
    info!("Server shutdown complete.");
    Ok(())
}
