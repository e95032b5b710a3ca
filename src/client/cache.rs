// src/client/cache.rs

//! The process-wide, reference-counted cache of AHA clients.
//!
//! Identical URL tuples share one underlying client; the registry owns the
//! single shared session for as long as the refcount is positive. `add`
//! and `del` serialise on the cache mutex, so a racing `del` only ever
//! drops a fully inserted entry.

use super::pool::PoolProxy;
use super::proxy::Proxy;
use super::{DialOpts, open_info, open_url_opts};
use crate::core::errors::AhaError;
use crate::core::registry::SvcRecord;
use crate::core::urls::UrlInfo;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

struct CacheEntry {
    refs: usize,
    client: Arc<AhaClient>,
}

static AHA_CLIENTS: Lazy<Mutex<HashMap<String, CacheEntry>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

fn cache_key(urls: &[String]) -> String {
    urls.join(",")
}

/// One cached AHA server set: the URLs, the lazily opened session, and the
/// network learned from it.
#[derive(Debug)]
pub struct AhaClient {
    urls: Vec<String>,
    opts: DialOpts,
    session: tokio::sync::Mutex<Option<Arc<Proxy>>>,
    network: Mutex<Option<String>>,
}

impl AhaClient {
    fn new(urls: Vec<String>, opts: DialOpts) -> Self {
        Self {
            urls,
            opts,
            session: tokio::sync::Mutex::new(None),
            network: Mutex::new(None),
        }
    }

    /// The network this AHA serves, once a session has been established.
    pub fn network(&self) -> Option<String> {
        self.network.lock().clone()
    }

    /// Returns the shared session, dialing the URL list in order until one
    /// answers. Reconnects transparently after a drop.
    pub async fn proxy(&self) -> Result<Arc<Proxy>, AhaError> {
        let mut session = self.session.lock().await;
        if let Some(proxy) = session.as_ref()
            && !proxy.is_fini()
        {
            return Ok(proxy.clone());
        }

        let mut last = AhaError::NotReady("no aha server urls".to_string());
        for url in &self.urls {
            match Box::pin(open_url_opts(url, &self.opts)).await {
                Ok(proxy) => {
                    if let Ok(info) = proxy
                        .call("getCellInfo", json!({}), self.opts.timeout())
                        .await
                        && let Some(network) = info
                            .pointer("/cell/aha/network")
                            .and_then(|v| v.as_str())
                    {
                        *self.network.lock() = Some(network.to_string());
                    }
                    *session = Some(proxy.clone());
                    return Ok(proxy);
                }
                Err(e) => {
                    debug!("aha server {url} not available: {e}");
                    last = e;
                }
            }
        }
        Err(last)
    }
}

/// Registers a URL tuple (or bumps its refcount). Returns the refcount.
pub fn add_aha_url(urls: &[String]) -> usize {
    add_aha_url_opts(urls, DialOpts::default())
}

pub fn add_aha_url_opts(urls: &[String], opts: DialOpts) -> usize {
    let key = cache_key(urls);
    let mut cache = AHA_CLIENTS.lock();
    let entry = cache.entry(key).or_insert_with(|| CacheEntry {
        refs: 0,
        client: Arc::new(AhaClient::new(urls.to_vec(), opts)),
    });
    entry.refs += 1;
    entry.refs
}

/// Drops one reference. The entry (and its shared session) is released
/// when the count reaches zero. Unknown URLs return 0.
pub fn del_aha_url(urls: &[String]) -> usize {
    let key = cache_key(urls);
    let mut cache = AHA_CLIENTS.lock();
    let Some(entry) = cache.get_mut(&key) else {
        return 0;
    };
    entry.refs -= 1;
    let refs = entry.refs;
    if refs == 0 {
        cache.remove(&key);
    }
    refs
}

/// The number of registered AHA clients. Used by tests.
pub fn num_aha_clients() -> usize {
    AHA_CLIENTS.lock().len()
}

fn all_clients() -> Vec<Arc<AhaClient>> {
    AHA_CLIENTS.lock().values().map(|e| e.client.clone()).collect()
}

/// Loads `telepath.toml` (version 1) from a directory, registering its
/// `aha:servers` in the cache. Returns how many server sets were added.
pub fn load_tele_conf(dirn: &Path, opts: DialOpts) -> Result<usize, AhaError> {
    let path = dirn.join("telepath.toml");
    if !path.exists() {
        return Ok(0);
    }
    let text = std::fs::read_to_string(&path)?;
    let table: toml::Table = toml::from_str(&text)
        .map_err(|e| AhaError::BadConfValu(format!("telepath.toml: {e}")))?;

    let version = table.get("version").and_then(|v| v.as_integer()).unwrap_or(0);
    if version != 1 {
        return Err(AhaError::BadStorageVersion(format!(
            "telepath.toml version {version}, expected 1"
        )));
    }

    let mut count = 0;
    if let Some(servers) = table.get("aha:servers").and_then(|v| v.as_array()) {
        for server in servers {
            if let Some(url) = server.as_str() {
                add_aha_url_opts(&[url.to_string()], opts.clone());
                count += 1;
            }
        }
    }
    Ok(count)
}

/// Returns an open session to an AHA server able to answer for `host`.
/// No host fails `no-such-name`; an empty cache fails `not-ready`.
pub async fn get_aha_proxy(host: Option<&str>) -> Result<Arc<Proxy>, AhaError> {
    let Some(host) = host else {
        return Err(AhaError::NoSuchName("no aha service name given".to_string()));
    };
    let clients = all_clients();
    if clients.is_empty() {
        return Err(AhaError::NotReady(format!(
            "no aha servers registered to resolve {host}"
        )));
    }
    let mut last = AhaError::NotReady(format!("no aha servers answered for {host}"));
    for client in clients {
        match client.proxy().await {
            Ok(proxy) => return Ok(proxy),
            Err(e) => last = e,
        }
    }
    Err(last)
}

/// Resolves one `aha://` URL to a direct session with the named service.
pub(super) async fn open_aha(info: &UrlInfo, opts: &DialOpts) -> Result<Arc<Proxy>, AhaError> {
    let clients = all_clients();
    if clients.is_empty() {
        return Err(AhaError::NotReady(
            "no aha servers registered".to_string(),
        ));
    }

    let mut last = AhaError::NoSuchName(format!(
        "could not resolve {}",
        info.host.as_deref().unwrap_or("")
    ));

    for client in clients {
        let aha = match client.proxy().await {
            Ok(aha) => aha,
            Err(e) => {
                last = e;
                continue;
            }
        };

        let defnetw = opts.network.clone().or_else(|| client.network());
        let fullname = match info.aha_name(defnetw.as_deref()) {
            Ok(name) => name,
            Err(e) => {
                last = e;
                continue;
            }
        };

        // Pool names get a rebalancing handle, not a direct session.
        let pool = aha
            .call("getAhaPool", json!({"name": fullname}), opts.timeout())
            .await;
        if let Ok(pool) = pool
            && !pool.is_null()
        {
            return Err(AhaError::BadArg(format!(
                "{fullname} is a service pool; dial it as a pool"
            )));
        }

        match resolve_svc(&aha, &fullname, opts).await {
            Ok(svc) => return dial_svc(&svc, info, opts).await,
            Err(e) => last = e,
        }
    }
    Err(last)
}

/// Opens a pool handle over an `aha://<pool>...` URL.
pub(super) async fn open_aha_pool(
    info: &UrlInfo,
    opts: &DialOpts,
) -> Result<Arc<PoolProxy>, AhaError> {
    let clients = all_clients();
    if clients.is_empty() {
        return Err(AhaError::NotReady("no aha servers registered".to_string()));
    }

    let mut last = AhaError::NoSuchName(format!(
        "could not resolve {}",
        info.host.as_deref().unwrap_or("")
    ));
    for client in clients {
        let aha = match client.proxy().await {
            Ok(aha) => aha,
            Err(e) => {
                last = e;
                continue;
            }
        };
        let defnetw = opts.network.clone().or_else(|| client.network());
        let fullname = match info.aha_name(defnetw.as_deref()) {
            Ok(name) => name,
            Err(e) => {
                last = e;
                continue;
            }
        };
        match PoolProxy::open(client.clone(), &fullname, info, opts.clone()).await {
            Ok(pool) => return Ok(pool),
            Err(e) => last = e,
        }
    }
    Err(last)
}

/// Asks one AHA for the current online record of a fullname.
pub(super) async fn resolve_svc(
    aha: &Arc<Proxy>,
    fullname: &str,
    opts: &DialOpts,
) -> Result<SvcRecord, AhaError> {
    let value = aha
        .call("getAhaSvc", json!({"name": fullname}), opts.timeout())
        .await?;
    if value.is_null() {
        return Err(AhaError::NoSuchName(format!("no such service: {fullname}")));
    }
    let svc: SvcRecord = serde_json::from_value(value)
        .map_err(|e| AhaError::Internal(format!("bad service record: {e}")))?;
    if svc.svcinfo.online.is_none() {
        return Err(AhaError::NoSuchName(format!(
            "service {fullname} is not online"
        )));
    }
    Ok(svc)
}

/// Dials the transport described by a resolved service record, carrying
/// over the identity from the original `aha://` URL.
pub(super) async fn dial_svc(
    svc: &SvcRecord,
    info: &UrlInfo,
    opts: &DialOpts,
) -> Result<Arc<Proxy>, AhaError> {
    let urlinfo = svc.svcinfo.urlinfo.clone().ok_or_else(|| {
        AhaError::NoSuchName(format!("service {} has no address", svc.fullname()))
    })?;

    let mut target = urlinfo;
    target.user = info.user.clone();
    target.passwd = info.passwd.clone();
    if target.scheme == "ssl" {
        let fullname = svc.fullname();
        target
            .query
            .entry("hostname".to_string())
            .or_insert(fullname);
        target
            .query
            .entry("ca".to_string())
            .or_insert(svc.network.clone());
    }
    Box::pin(open_info(&target, opts)).await
}
