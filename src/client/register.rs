// src/client/register.rs

//! The registry client task every member cell runs: dial an AHA from
//! `aha:registry`, register, maintain the leader alias as the active flag
//! moves, and re-register after every reconnect.

use super::proxy::Proxy;
use super::{DialOpts, open_url_opts};
use crate::core::cell::CellLogic;
use crate::core::errors::AhaError;
use crate::core::registry::SvcInfo;
use crate::core::urls::UrlInfo;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

const RECONNECT_DELAY: Duration = Duration::from_millis(200);

/// Runs until shutdown, keeping this cell registered with one AHA.
pub async fn run_registry_client(
    logic: Arc<dyn CellLogic>,
    mut active_rx: watch::Receiver<bool>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let state = logic.cell_state();
    if state.conf.aha_registry.is_empty() || state.conf.aha_name.is_none() {
        debug!("no aha:registry configured; registry client idle");
        return;
    }

    let opts = DialOpts {
        certdir: Some(state.certdir.clone()),
        network: state.conf.aha_network.clone(),
        insecure: false,
        timeout: Some(state.conf.aha_timeout),
    };

    loop {
        let proxy = match connect(&logic, &opts).await {
            Some(proxy) => proxy,
            None => {
                tokio::select! {
                    _ = shutdown_rx.recv() => return,
                    _ = tokio::time::sleep(RECONNECT_DELAY) => continue,
                }
            }
        };

        if let Err(e) = register(&logic, &proxy, &opts).await {
            warn!("aha registration failed: {e}");
            proxy.fini().await;
            tokio::select! {
                _ = shutdown_rx.recv() => return,
                _ = tokio::time::sleep(RECONNECT_DELAY) => continue,
            }
        }

        // Stay connected: a dropped session means our records go offline
        // on the AHA, so re-register as soon as we can.
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    proxy.fini().await;
                    return;
                }
                _ = proxy.wait_fini() => {
                    info!("aha session dropped; re-registering");
                    break;
                }
                changed = active_rx.changed() => {
                    if changed.is_err() {
                        proxy.fini().await;
                        return;
                    }
                    if let Err(e) = on_active_change(&logic, &proxy, &opts).await {
                        warn!("aha re-registration after active change failed: {e}");
                    }
                }
            }
        }

        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

async fn connect(logic: &Arc<dyn CellLogic>, opts: &DialOpts) -> Option<Arc<Proxy>> {
    for url in &logic.cell_state().conf.aha_registry {
        match open_url_opts(url, opts).await {
            Ok(proxy) => return Some(proxy),
            Err(e) => debug!("aha registry {url} not reachable: {e}"),
        }
    }
    None
}

/// The `(name, network)` pair this cell registers under.
fn reg_names(logic: &Arc<dyn CellLogic>) -> (String, Option<String>) {
    let conf = &logic.cell_state().conf;
    (
        conf.aha_name.clone().unwrap_or_default(),
        conf.aha_network.clone(),
    )
}

/// Builds the svcinfo this cell advertises.
fn svc_info(logic: &Arc<dyn CellLogic>) -> SvcInfo {
    let state = logic.cell_state();
    let bound = *state.dmon_addr.lock();

    let urlinfo = bound.map(|addr| {
        let listen = state
            .conf
            .dmon_listen
            .as_deref()
            .and_then(|u| UrlInfo::chop(u).ok());
        let scheme = listen
            .as_ref()
            .map(|l| l.scheme.clone())
            .unwrap_or_else(|| "tcp".to_string());
        // A wildcard bind is not dialable; advertise loopback instead.
        let host = match listen.as_ref().and_then(|l| l.host.clone()) {
            Some(host) if host != "0.0.0.0" && !host.is_empty() => host,
            _ => "127.0.0.1".to_string(),
        };
        UrlInfo {
            scheme,
            host: Some(host),
            port: Some(addr.port()),
            ..Default::default()
        }
    });

    SvcInfo {
        urlinfo,
        online: None,
        ready: Some(true),
        leader: Some(state.is_active() && state.conf.aha_leader.is_some()),
        run: Some(state.run_iden.clone()),
    }
}

/// Registers this cell's record(s): the numbered name always, the leader
/// alias only while active.
async fn register(
    logic: &Arc<dyn CellLogic>,
    proxy: &Arc<Proxy>,
    opts: &DialOpts,
) -> Result<(), AhaError> {
    let (name, network) = reg_names(logic);
    let info = svc_info(logic);
    let state = logic.cell_state();

    proxy
        .call(
            "addAhaSvc",
            json!({"name": name, "network": network.clone(), "info": info.clone()}),
            opts.timeout(),
        )
        .await?;

    if state.is_active()
        && let Some(leader) = state.conf.aha_leader.clone()
    {
        proxy
            .call(
                "addAhaSvc",
                json!({"name": leader, "network": network, "info": info}),
                opts.timeout(),
            )
            .await?;
    }
    Ok(())
}

/// Reconciles records after a local active/passive flip.
async fn on_active_change(
    logic: &Arc<dyn CellLogic>,
    proxy: &Arc<Proxy>,
    opts: &DialOpts,
) -> Result<(), AhaError> {
    let state = logic.cell_state();
    let (_, network) = reg_names(logic);

    if !state.is_active()
        && let Some(leader) = state.conf.aha_leader.clone()
    {
        proxy
            .call(
                "delAhaSvc",
                json!({"name": leader, "network": network}),
                opts.timeout(),
            )
            .await?;
    }

    register(logic, proxy, opts).await
}
