// src/client/mod.rs

//! The client resolver: turns `tcp://`, `ssl://`, `unix://`, `cell://`
//! and `aha://` URLs into authenticated transport sessions.

pub mod bootstrap;
mod cache;
mod pool;
mod proxy;
mod register;

pub use cache::{add_aha_url, del_aha_url, get_aha_proxy, load_tele_conf, num_aha_clients};
pub use pool::PoolProxy;
pub use proxy::Proxy;
pub use register::run_registry_client;

use crate::core::cell::CellLogic;
use crate::core::certs::{self, CertDir, CertKind};
use crate::core::errors::AhaError;
use crate::core::urls::UrlInfo;
use crate::core::wire;
use crate::connection::{ConnectionHandler, PeerAuth, PeerInfo};
use crate::server::AnyStream;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rustls::pki_types::ServerName;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpStream, UnixStream};
use tokio_rustls::{TlsConnector, rustls};

/// Options shared by every dial.
#[derive(Debug, Clone, Default)]
pub struct DialOpts {
    /// Where CA, host, and user certificates live for `ssl://` dials.
    pub certdir: Option<CertDir>,
    /// The default network, used to expand `name...` shorthand.
    pub network: Option<String>,
    /// Skip server certificate verification. Used only by provisioning
    /// clients that do not hold the network CA yet.
    pub insecure: bool,
    /// Per-call and connect deadline.
    pub timeout: Option<Duration>,
}

impl DialOpts {
    pub fn timeout(&self) -> Duration {
        self.timeout.unwrap_or(Duration::from_secs(10))
    }
}

/// In-process cells reachable through `cell://<name>` URLs.
static LOCAL_CELLS: Lazy<Mutex<HashMap<String, Arc<dyn CellLogic>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Registers a cell for in-process dials. The server does this at launch.
pub fn register_local_cell(name: &str, logic: Arc<dyn CellLogic>) {
    LOCAL_CELLS.lock().insert(name.to_string(), logic);
}

pub fn unregister_local_cell(name: &str) {
    LOCAL_CELLS.lock().remove(name);
}

/// Opens an in-process session to a cell, as the trusted local root user.
pub fn open_local(logic: Arc<dyn CellLogic>) -> Arc<Proxy> {
    let (ours, theirs) = tokio::io::duplex(wire::MAX_FRAME_BYTES);

    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
    let peer = PeerInfo {
        auth: PeerAuth::TrustedLocal,
        prov_only: false,
    };
    tokio::spawn(async move {
        // The sender must outlive the session; its drop would read as an
        // immediate shutdown.
        let _shutdown_tx = shutdown_tx;
        ConnectionHandler::new(AnyStream::Mem(theirs), logic, peer, shutdown_rx)
            .run()
            .await;
    });

    Proxy::from_stream(AnyStream::Mem(ours))
}

/// Dials any supported URL and returns an open session.
pub async fn open_url(text: &str) -> Result<Arc<Proxy>, AhaError> {
    open_url_opts(text, &DialOpts::default()).await
}

pub async fn open_url_opts(text: &str, opts: &DialOpts) -> Result<Arc<Proxy>, AhaError> {
    let info = UrlInfo::chop(text)?;
    open_info(&info, opts).await
}

/// Dials a parsed URL.
pub async fn open_info(info: &UrlInfo, opts: &DialOpts) -> Result<Arc<Proxy>, AhaError> {
    match info.scheme.as_str() {
        "tcp" => open_tcp(info, opts).await,
        "ssl" => open_ssl(info, opts).await,
        "unix" => open_unix(info).await,
        "cell" => open_cell(info),
        "aha" => cache::open_aha(info, opts).await,
        other => Err(AhaError::BadArg(format!("cannot dial scheme '{other}'"))),
    }
}

/// Dials an `aha://<pool>...` URL, returning a rebalancing pool handle.
pub async fn open_pool(text: &str, opts: &DialOpts) -> Result<Arc<PoolProxy>, AhaError> {
    let info = UrlInfo::chop(text)?;
    if info.scheme != "aha" {
        return Err(AhaError::BadArg("pool handles require an aha:// url".to_string()));
    }
    cache::open_aha_pool(&info, opts).await
}

async fn open_tcp(info: &UrlInfo, opts: &DialOpts) -> Result<Arc<Proxy>, AhaError> {
    let host = info
        .host
        .clone()
        .ok_or_else(|| AhaError::BadArg("tcp url has no host".to_string()))?;
    let port = info
        .port
        .ok_or_else(|| AhaError::BadArg("tcp url has no port".to_string()))?;

    let socket = tokio::time::timeout(opts.timeout(), TcpStream::connect((host.as_str(), port)))
        .await
        .map_err(|_| AhaError::Timeout(format!("connect to {host}:{port}")))??;

    let proxy = Proxy::from_stream(AnyStream::Tcp(socket));
    auth_if_needed(&proxy, info, opts).await?;
    Ok(proxy)
}

async fn open_unix(info: &UrlInfo) -> Result<Arc<Proxy>, AhaError> {
    let path = info
        .path
        .clone()
        .ok_or_else(|| AhaError::BadArg("unix url has no path".to_string()))?;
    let socket = UnixStream::connect(&path).await?;
    Ok(Proxy::from_stream(AnyStream::Unix(socket)))
}

fn open_cell(info: &UrlInfo) -> Result<Arc<Proxy>, AhaError> {
    let name = info
        .host
        .clone()
        .ok_or_else(|| AhaError::BadArg("cell url has no name".to_string()))?;
    let logic = LOCAL_CELLS
        .lock()
        .get(&name)
        .cloned()
        .ok_or_else(|| AhaError::NoSuchName(format!("no local cell named {name}")))?;
    Ok(open_local(logic))
}

async fn open_ssl(info: &UrlInfo, opts: &DialOpts) -> Result<Arc<Proxy>, AhaError> {
    let host = info
        .host
        .clone()
        .ok_or_else(|| AhaError::BadArg("ssl url has no host".to_string()))?;
    let port = info
        .port
        .ok_or_else(|| AhaError::BadArg("ssl url has no port".to_string()))?;

    // The certificate hostname may differ from the dialed address.
    let hostname = info.query.get("hostname").cloned().unwrap_or(host.clone());
    let network = info
        .query
        .get("ca")
        .cloned()
        .or_else(|| hostname.split_once('.').map(|(_, netw)| netw.to_string()));

    let config = ssl_client_config(info, opts, network.as_deref())?;
    let connector = TlsConnector::from(Arc::new(config));

    let server_name = ServerName::try_from(hostname.clone())
        .map_err(|_| AhaError::BadArg(format!("'{hostname}' is not a valid TLS name")))?;

    let socket = tokio::time::timeout(opts.timeout(), TcpStream::connect((host.as_str(), port)))
        .await
        .map_err(|_| AhaError::Timeout(format!("connect to {host}:{port}")))??;

    let stream = connector
        .connect(server_name, socket)
        .await
        .map_err(|e| AhaError::AuthDeny(format!("TLS handshake with {hostname} failed: {e}")))?;

    let proxy = Proxy::from_stream(AnyStream::Tls(Box::new(stream.into())));
    auth_if_needed(&proxy, info, opts).await?;
    Ok(proxy)
}

fn ssl_client_config(
    info: &UrlInfo,
    opts: &DialOpts,
    network: Option<&str>,
) -> Result<rustls::ClientConfig, AhaError> {
    let builder = if opts.insecure {
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerify::new()))
    } else {
        let certdir = opts.certdir.as_ref().ok_or_else(|| {
            AhaError::NotReady("ssl dial requires a certificate directory".to_string())
        })?;
        let network = network.ok_or_else(|| {
            AhaError::BadArg("ssl url names no CA network".to_string())
        })?;
        let ca_pem = certdir.load_ca_cert(network).ok_or_else(|| {
            AhaError::AuthDeny(format!("no CA certificate for network {network}"))
        })?;

        let mut roots = rustls::RootCertStore::empty();
        for der in certs::pem_to_certs(&ca_pem)? {
            roots
                .add(der)
                .map_err(|e| AhaError::AuthDeny(format!("bad CA certificate: {e}")))?;
        }
        rustls::ClientConfig::builder().with_root_certificates(roots)
    };

    // Present the user certificate when the URL names a user we hold
    // credentials for.
    if let (Some(certdir), Some(user), Some(network)) =
        (opts.certdir.as_ref(), info.user.as_deref(), network)
    {
        let cn = format!("{user}@{network}");
        if let (Some(cert_pem), Some(key_pem)) = (
            certdir.load_cert(CertKind::User, &cn),
            certdir.load_key(CertKind::User, &cn),
        ) {
            return builder
                .with_client_auth_cert(certs::pem_to_certs(&cert_pem)?, certs::pem_to_key(&key_pem)?)
                .map_err(|e| AhaError::AuthDeny(format!("client certificate rejected: {e}")));
        }
    }

    Ok(builder.with_no_client_auth())
}

/// Issues the `auth` call when the URL carries a password identity.
async fn auth_if_needed(
    proxy: &Arc<Proxy>,
    info: &UrlInfo,
    opts: &DialOpts,
) -> Result<(), AhaError> {
    if let (Some(user), Some(passwd)) = (info.user.as_deref(), info.passwd.as_deref()) {
        proxy
            .call(
                "auth",
                json!({"user": user, "passwd": passwd}),
                opts.timeout(),
            )
            .await?;
    }
    Ok(())
}

/// Accepts any server certificate. Only reachable through
/// [`DialOpts::insecure`], which only the provisioning bootstrap sets.
#[derive(Debug)]
struct NoVerify {
    schemes: Vec<rustls::SignatureScheme>,
}

impl NoVerify {
    fn new() -> Self {
        let provider = rustls::crypto::aws_lc_rs::default_provider();
        Self {
            schemes: provider
                .signature_verification_algorithms
                .supported_schemes(),
        }
    }
}

impl rustls::client::danger::ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.schemes.clone()
    }
}
