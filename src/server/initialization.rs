// src/server/initialization.rs

//! Binds the cell's listeners: the main RPC surface (`dmon:listen`), the
//! one-time provisioning surface (`provision:listen`), and the TLS
//! acceptors both need.

use crate::core::cell::CellState;
use crate::core::certs::{self, CertKind};
use crate::core::errors::AhaError;
use crate::core::urls::UrlInfo;
use rustls::RootCertStore;
use rustls::server::WebPkiClientVerifier;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, UnixListener};
use tokio_rustls::{TlsAcceptor, rustls};
use tracing::info;

/// One bound listener plus everything needed to finish its handshakes.
pub enum BoundListener {
    Tcp {
        listener: TcpListener,
        tls: Option<TlsAcceptor>,
    },
    Unix {
        listener: UnixListener,
    },
}

impl BoundListener {
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            BoundListener::Tcp { listener, .. } => listener.local_addr().ok(),
            BoundListener::Unix { .. } => None,
        }
    }
}

/// All listeners of one AHA server.
pub struct Listeners {
    pub dmon: BoundListener,
    pub prov: Option<BoundListener>,
}

/// Parses `dmon:listen` / `provision:listen` and binds them.
pub async fn setup(state: &CellState) -> Result<Listeners, AhaError> {
    let conf = &state.conf;

    let dmon_url = conf
        .dmon_listen
        .clone()
        .ok_or(AhaError::NeedConfValu("dmon:listen".to_string()))?;
    let dmon = bind(state, &UrlInfo::chop(&dmon_url)?, true).await?;
    if let Some(addr) = dmon.local_addr() {
        *state.dmon_addr.lock() = Some(addr);
        info!("RPC surface listening on {addr}");
    } else {
        info!("RPC surface listening on {dmon_url}");
    }

    let mut prov = None;
    if let Some(listen) = conf.provision_listen.clone() {
        let info = UrlInfo::chop(&listen)?;
        if info.scheme != "ssl" {
            return Err(AhaError::BadConfValu(
                "provision:listen must be an ssl:// url".to_string(),
            ));
        }
        let bound = bind(state, &info, false).await?;
        if let Some(addr) = bound.local_addr() {
            *state.prov_addr.lock() = Some(addr);
            info!("provisioning surface listening on {addr}");
        }
        prov = Some(bound);
    }

    Ok(Listeners { dmon, prov })
}

async fn bind(
    state: &CellState,
    info: &UrlInfo,
    mutual: bool,
) -> Result<BoundListener, AhaError> {
    match info.scheme.as_str() {
        "tcp" => {
            let listener = bind_tcp(info).await?;
            Ok(BoundListener::Tcp {
                listener,
                tls: None,
            })
        }
        "ssl" => {
            let listener = bind_tcp(info).await?;
            let acceptor = tls_acceptor(state, info, mutual)?;
            Ok(BoundListener::Tcp {
                listener,
                tls: Some(acceptor),
            })
        }
        "unix" => {
            let path = info
                .path
                .clone()
                .ok_or_else(|| AhaError::BadConfValu("unix listen url has no path".to_string()))?;
            // A stale socket file from a previous run blocks the bind.
            let _ = std::fs::remove_file(&path);
            let listener = UnixListener::bind(&path)?;
            Ok(BoundListener::Unix { listener })
        }
        other => Err(AhaError::BadConfValu(format!(
            "cannot listen on scheme '{other}'"
        ))),
    }
}

async fn bind_tcp(info: &UrlInfo) -> Result<TcpListener, AhaError> {
    let host = info.host.clone().unwrap_or_else(|| "0.0.0.0".to_string());
    let port = info.port.unwrap_or(0);
    Ok(TcpListener::bind((host.as_str(), port)).await?)
}

/// Builds the TLS acceptor for a listen URL. The server certificate is the
/// host cert named by the `hostname` query (default: the cell fullname);
/// mutual listeners verify client certs against the network CA.
fn tls_acceptor(
    state: &CellState,
    info: &UrlInfo,
    mutual: bool,
) -> Result<TlsAcceptor, AhaError> {
    let conf = &state.conf;
    let certdir = &state.certdir;

    let hostname = info
        .query
        .get("hostname")
        .cloned()
        .or_else(|| conf.fullname())
        .ok_or(AhaError::NeedConfValu("aha:name".to_string()))?;

    let cert_pem = certdir
        .load_cert(CertKind::Host, &hostname)
        .ok_or_else(|| AhaError::NoSuchName(format!("no host certificate for {hostname}")))?;
    let key_pem = certdir
        .load_key(CertKind::Host, &hostname)
        .ok_or_else(|| AhaError::NoSuchName(format!("no host key for {hostname}")))?;

    let certs = certs::pem_to_certs(&cert_pem)?;
    let key = certs::pem_to_key(&key_pem)?;

    let builder = rustls::ServerConfig::builder();
    let config = if mutual {
        let network = info
            .query
            .get("ca")
            .cloned()
            .or_else(|| conf.aha_network.clone())
            .ok_or(AhaError::NeedConfValu("aha:network".to_string()))?;
        let ca_pem = certdir
            .load_ca_cert(&network)
            .ok_or_else(|| AhaError::NoSuchName(format!("no CA for network {network}")))?;

        let mut roots = RootCertStore::empty();
        for der in certs::pem_to_certs(&ca_pem)? {
            roots
                .add(der)
                .map_err(|e| AhaError::BadArg(format!("bad CA certificate: {e}")))?;
        }
        let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|e| AhaError::Internal(format!("client verifier: {e}")))?;
        builder
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs, key)?
    } else {
        builder.with_no_client_auth().with_single_cert(certs, key)?
    };

    Ok(TlsAcceptor::from(Arc::new(config)))
}
