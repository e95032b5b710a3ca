// src/core/aha.rs

//! The AHA cell: service directory, certificate authority, provisioning
//! authority, and pool manager, all mutating through one nexus log.

use crate::config::CellConfig;
use crate::core::auth::{self, UserDef};
use crate::core::cell::{CellLogic, CellState, SessionCtx, new_iden};
use crate::core::certs::{self, CertKind, PemPair};
use crate::core::errors::AhaError;
use crate::core::hive::Hive;
use crate::core::nexus::{NexusApplier, NexusEdit, NexusRoot, WalRecord};
use crate::core::pool::{self, PoolDef};
use crate::core::provision::{self, ProvKind, ProvToken};
use crate::core::registry::{self, SvcInfo, SvcRecord};
use crate::core::topics::TopicHub;
use crate::core::urls::UrlInfo;
use crate::core::waiter::Waiter;
use crate::core::wire::WireMsg;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Current layout version of the hive snapshot file.
const SNAP_VERSION: u64 = 1;

/// The AHA service directory and provisioning authority.
pub struct AhaCell {
    pub cell: CellState,
    pub hive: Arc<Hive>,
    pub nexus: Arc<NexusRoot>,
    pub topics: Arc<TopicHub>,
    /// link iden -> (name, network) pairs registered by that session.
    /// Guarded by one mutex; the accurate-offline-detection table.
    links: Mutex<HashMap<String, Vec<(String, String)>>>,
    /// The session to the upstream leader, when running as a mirror.
    pub upstream: tokio::sync::Mutex<Option<Arc<crate::client::Proxy>>>,
}

impl AhaCell {
    /// Opens an AHA cell from its directory: loads the snapshot, replays
    /// the nexus log tail, and (on a leader) asserts bootstrap state.
    pub async fn open(dirn: &Path, conf: CellConfig) -> Result<Arc<Self>, AhaError> {
        let follower = conf.mirror.is_some();
        // With the durable log disabled, appends still serialise through
        // the same file but skip the per-edit fsync.
        let fsync = if conf.nexslog_en {
            conf.nexslog_fsync
        } else {
            crate::core::nexus::WalFsync::No
        };
        let cell = CellState::new(dirn, conf)?;

        let (nexus, recs) =
            NexusRoot::open(&dirn.join("slabs").join("nexus.log"), fsync, follower).await?;

        let aha = Arc::new(Self {
            cell,
            hive: Arc::new(Hive::new()),
            nexus: Arc::new(nexus),
            topics: Arc::new(TopicHub::new()),
            links: Mutex::new(HashMap::new()),
            upstream: tokio::sync::Mutex::new(None),
        });

        aha.load_snapshot().await?;
        aha.replay(recs)?;

        if !follower {
            aha.bootstrap().await?;
        }

        Ok(aha)
    }

    fn snap_path(&self) -> std::path::PathBuf {
        self.cell.dirn.join("slabs").join("hive.db")
    }

    async fn load_snapshot(&self) -> Result<(), AhaError> {
        let path = self.snap_path();
        if !path.exists() {
            return Ok(());
        }
        let buf = tokio::fs::read(&path).await?;
        let snap: Value = serde_json::from_slice(&buf)?;

        let version = snap.get("version").and_then(Value::as_u64).unwrap_or(0);
        if version != SNAP_VERSION {
            return Err(AhaError::BadStorageVersion(format!(
                "hive snapshot version {version}, expected {SNAP_VERSION}"
            )));
        }

        let indx = snap.get("indx").and_then(Value::as_u64).unwrap_or(0);
        self.hive
            .load(snap.get("tree").cloned().unwrap_or(Value::Null))
            .map_err(|e| AhaError::BadStorageVersion(format!("hive snapshot: {e}")))?;
        self.nexus.mark_applied(indx);
        Ok(())
    }

    /// Writes the hive snapshot atomically (tmp file + rename).
    pub async fn save_snapshot(&self) -> Result<(), AhaError> {
        let path = self.snap_path();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let snap = json!({
            "version": SNAP_VERSION,
            "indx": self.nexus.current_indx(),
            "tree": self.hive.snapshot(),
        });
        let buf = serde_json::to_vec(&snap)?;

        let tmp = path.with_extension("db.tmp");
        tokio::fs::write(&tmp, &buf).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Replays log records left over past the snapshot offset.
    fn replay(&self, recs: Vec<WalRecord>) -> Result<(), AhaError> {
        let mut count = self.nexus.current_indx();
        for rec in recs {
            if rec.indx < count {
                continue;
            }
            if rec.indx > count {
                // The log starts past our snapshot; a mirror will resync.
                warn!(
                    "nexus log starts at offset {} but snapshot holds {}; dropping tail",
                    rec.indx, count
                );
                break;
            }
            let edit: NexusEdit = serde_json::from_slice(&rec.edit)?;
            self.apply(rec.indx, &edit);
            count = rec.indx + 1;
        }
        self.nexus.mark_applied(count);
        Ok(())
    }

    /// Asserts boot-time state on the leader: root password, the
    /// `aha:admin` identity, and the cell's own certificate trio.
    async fn bootstrap(self: &Arc<Self>) -> Result<(), AhaError> {
        if let Some(passwd) = self.cell.conf.auth_passwd.clone() {
            let current = auth::get_user(&self.hive, "root");
            let stale = match &current {
                Some(user) => match user.shadow.as_deref() {
                    Some(shadow) => !auth::check_passwd(shadow, &passwd),
                    None => true,
                },
                None => true,
            };
            if stale {
                let user = UserDef {
                    iden: current.map(|u| u.iden).unwrap_or(new_iden()?),
                    name: "root".to_string(),
                    shadow: Some(auth::hash_passwd(&passwd)?),
                    admin: true,
                    locked: false,
                };
                self.issue(NexusEdit::UserAdd { user }).await?;
            }
        }

        // The aha:admin account is re-asserted on every boot: admin and
        // unlocked, even if it was mutated while the cell was down.
        if let Some(admin) = self.cell.conf.aha_admin.clone() {
            match auth::get_user(&self.hive, &admin) {
                Some(user) if user.admin && !user.locked => {}
                Some(_) => {
                    self.issue(NexusEdit::UserAdmin {
                        name: admin.clone(),
                        admin: true,
                    })
                    .await?;
                    self.issue(NexusEdit::UserLocked {
                        name: admin,
                        locked: false,
                    })
                    .await?;
                }
                None => {
                    let user = UserDef {
                        iden: new_iden()?,
                        name: admin,
                        shadow: None,
                        admin: true,
                        locked: false,
                    };
                    self.issue(NexusEdit::UserAdd { user }).await?;
                }
            }
        }

        if let Some(network) = self.cell.conf.aha_network.clone() {
            self.gen_ca_cert(&network).await?;
            self.bootstrap_own_certs(&network).await?;
        }

        Ok(())
    }

    /// Issues the AHA's own host cert and the admin user cert, once.
    async fn bootstrap_own_certs(self: &Arc<Self>, network: &str) -> Result<(), AhaError> {
        let certdir = &self.cell.certdir;

        if let Some(fullname) = self.cell.conf.fullname()
            && certdir.load_cert(CertKind::Host, &fullname).is_none()
        {
            let csr = certdir.gen_csr(CertKind::Host, &fullname)?;
            let cert = self.sign_host_csr(&csr).await?;
            certdir.save_cert(CertKind::Host, &fullname, &cert)?;
        }

        if let Some(admin) = self.cell.conf.aha_admin.clone()
            && admin.ends_with(&format!("@{network}"))
            && certdir.load_cert(CertKind::User, &admin).is_none()
        {
            let csr = certdir.gen_csr(CertKind::User, &admin)?;
            let cert = self.sign_user_csr(&csr).await?;
            certdir.save_cert(CertKind::User, &admin, &cert)?;
        }

        Ok(())
    }

    /// Downs every record still marked online from a previous run. Spawned
    /// shortly after boot so subscribers catch the `aha:svcdown` burst.
    pub async fn down_stale_svcs(self: &Arc<Self>) -> Result<(), AhaError> {
        if self.nexus.is_follower() {
            return Ok(());
        }
        for rec in registry::online_svcs(&self.hive) {
            if let Some(link) = rec.svcinfo.online.clone() {
                self.issue(NexusEdit::SvcDown {
                    name: rec.name,
                    network: rec.network,
                    link,
                })
                .await?;
            }
        }
        Ok(())
    }

    async fn issue(&self, edit: NexusEdit) -> Result<u64, AhaError> {
        self.nexus.issue(edit, self).await
    }

    /// A counting waiter on a fabric topic; create it before the action.
    pub fn waiter(&self, count: usize, topic: &str) -> Waiter {
        self.topics.waiter(count, topic)
    }

    /// On a mirror, waits until this cell has applied everything the
    /// upstream leader has committed. A no-op on the leader.
    pub async fn sync(&self, timeout: Duration) -> Result<(), AhaError> {
        let upstream = self.upstream.lock().await.clone();
        let Some(proxy) = upstream else {
            return Ok(());
        };
        let indx = proxy
            .call("getNexsIndx", json!({}), timeout)
            .await?
            .as_u64()
            .unwrap_or(0);
        self.nexus.wait_offs(indx, timeout).await
    }

    /// Expands the `name...` shorthand against this AHA's own network.
    fn expand_name(&self, name: &str) -> Result<String, AhaError> {
        let Some(base) = name.strip_suffix("...") else {
            return Ok(name.to_string());
        };
        let netw = self
            .cell
            .conf
            .aha_network
            .as_deref()
            .ok_or_else(|| AhaError::NotReady(format!("no network to expand '{name}'")))?;
        Ok(format!("{base}.{netw}"))
    }

    /// Splits a name into `(name, network)` using the explicit network,
    /// the AHA's own network, or the name's own first dot, in that order.
    fn resolve_name(&self, name: &str, network: Option<&str>) -> Result<(String, String), AhaError> {
        let name = &self.expand_name(name)?;
        if let Some(netw) = network.or(self.cell.conf.aha_network.as_deref()) {
            let short = name
                .strip_suffix(&format!(".{netw}"))
                .unwrap_or(name)
                .to_string();
            return Ok((short, netw.to_string()));
        }
        match name.split_once('.') {
            Some((short, netw)) if !short.is_empty() && !netw.is_empty() => {
                Ok((short.to_string(), netw.to_string()))
            }
            _ => Err(AhaError::BadArg(format!(
                "service name '{name}' requires a network"
            ))),
        }
    }

    // --- Service registry operations ---

    /// Registers (or re-registers) a service. When a live session performs
    /// the call, its link iden becomes the record's `online` marker and the
    /// link table learns the mapping for teardown.
    pub async fn add_aha_svc(
        &self,
        name: &str,
        mut info: SvcInfo,
        network: Option<&str>,
        link: Option<&str>,
    ) -> Result<(), AhaError> {
        let (name, network) = self.resolve_name(name, network)?;

        if let Some(link) = link {
            info.online = Some(link.to_string());
            let mut links = self.links.lock();
            let registered = links.entry(link.to_string()).or_default();
            let pair = (name.clone(), network.clone());
            if !registered.contains(&pair) {
                registered.push(pair);
            }
        }

        self.issue(NexusEdit::SvcAdd {
            name,
            network,
            info,
        })
        .await?;
        Ok(())
    }

    /// Marks a service offline iff `link` still owns the record. A stale
    /// close for a link that no longer matches is a silent no-op.
    pub async fn set_aha_svc_down(
        &self,
        name: &str,
        link: &str,
        network: Option<&str>,
    ) -> Result<(), AhaError> {
        let (name, network) = self.resolve_name(name, network)?;

        let current = registry::get_svc(&self.hive, &format!("{name}.{network}"))
            .and_then(|rec| rec.svcinfo.online);
        if current.as_deref() != Some(link) {
            return Ok(());
        }

        self.issue(NexusEdit::SvcDown {
            name,
            network,
            link: link.to_string(),
        })
        .await?;
        Ok(())
    }

    /// Applies a whitelisted update to a record's svcinfo.
    pub async fn mod_aha_svc_info(&self, fullname: &str, info: Value) -> Result<(), AhaError> {
        registry::check_mod_info(&info)?;
        let rec = self
            .get_aha_svc(fullname)
            .ok_or_else(|| AhaError::NoSuchName(format!("no such service: {fullname}")))?;

        self.issue(NexusEdit::SvcMod {
            name: rec.name,
            network: rec.network,
            info,
        })
        .await?;
        Ok(())
    }

    /// Removes a record and any leader alias referring to it. An alias
    /// shares the record's run iden and its fullname is the record's
    /// fullname with the instance prefix stripped, so deleting an alias
    /// never cascades back to numbered records.
    pub async fn del_aha_svc(&self, name: &str, network: Option<&str>) -> Result<(), AhaError> {
        let (name, network) = self.resolve_name(name, network)?;
        let fullname = format!("{name}.{network}");

        let run = registry::get_svc(&self.hive, &fullname).and_then(|rec| rec.svcinfo.run);

        self.issue(NexusEdit::SvcDel {
            name: name.clone(),
            network: network.clone(),
        })
        .await?;

        if let Some(run) = run {
            let aliases: Vec<SvcRecord> = registry::get_svcs(&self.hive, None)
                .into_iter()
                .filter(|rec| {
                    rec.svcinfo.run.as_deref() == Some(run.as_str())
                        && rec.svcinfo.leader == Some(true)
                        && fullname.ends_with(&format!(".{}", rec.fullname()))
                })
                .collect();
            for alias in aliases {
                self.issue(NexusEdit::SvcDel {
                    name: alias.name,
                    network: alias.network,
                })
                .await?;
            }
        }
        Ok(())
    }

    pub fn get_aha_svc(&self, fullname: &str) -> Option<SvcRecord> {
        let fullname = self.expand_name(fullname).ok()?;
        registry::get_svc(&self.hive, &fullname)
    }

    pub fn get_aha_svcs(&self, network: Option<&str>) -> Vec<SvcRecord> {
        registry::get_svcs(&self.hive, network)
    }

    /// The URLs this AHA advertises: configured `aha:urls`, else derived
    /// from the bound RPC listener.
    pub fn get_aha_urls(&self) -> Vec<String> {
        if !self.cell.conf.aha_urls.is_empty() {
            return self.cell.conf.aha_urls.clone();
        }
        let (Some(fullname), Some(addr)) = (self.cell.conf.fullname(), *self.cell.dmon_addr.lock())
        else {
            return Vec::new();
        };
        // Unix listeners have no advertisable address.
        if self
            .cell
            .conf
            .dmon_listen
            .as_deref()
            .is_some_and(|u| u.starts_with("unix://"))
        {
            return Vec::new();
        }
        vec![format!("ssl://{fullname}:{}", addr.port())]
    }

    // --- Certificate authority ---

    /// Returns the network CA cert, creating the pair on first call.
    /// Repeated calls return byte-identical PEM.
    pub async fn gen_ca_cert(&self, network: &str) -> Result<String, AhaError> {
        if let Some(cert) = self.get_ca_cert(network) {
            return Ok(cert);
        }
        let pair = certs::gen_ca_pair(network)?;
        self.issue(NexusEdit::CaAdd {
            network: network.to_string(),
            cert: pair.cert.clone(),
            key: pair.key,
        })
        .await?;
        Ok(pair.cert)
    }

    pub fn get_ca_cert(&self, network: &str) -> Option<String> {
        self.hive
            .get(&["certs", "cas", network])
            .and_then(|v| v.get("cert").and_then(Value::as_str).map(str::to_string))
    }

    fn ca_pair(&self, network: &str) -> Result<PemPair, AhaError> {
        let value = self
            .hive
            .get(&["certs", "cas", network])
            .ok_or_else(|| AhaError::NoSuchName(format!("no CA for network {network}")))?;
        let cert = value.get("cert").and_then(Value::as_str).unwrap_or_default();
        let key = value.get("key").and_then(Value::as_str).unwrap_or_default();
        Ok(PemPair {
            cert: cert.to_string(),
            key: key.to_string(),
        })
    }

    /// Signs a host CSR. The CN must sit inside this AHA's network (or, on
    /// a network-less AHA, inside a network it has a CA for).
    pub async fn sign_host_csr(&self, pem: &str) -> Result<String, AhaError> {
        let cn = certs::csr_cn(pem)?;
        let network = match self.cell.conf.aha_network.as_deref() {
            Some(network) => {
                certs::check_host_cn(&cn, network)?;
                network.to_string()
            }
            None => match cn.split_once('.') {
                Some((_, network)) => network.to_string(),
                None => {
                    return Err(AhaError::BadArg(format!(
                        "host CSR CN '{cn}' carries no network"
                    )));
                }
            },
        };
        self.sign_csr_for(&network, pem, "host", &cn).await
    }

    /// Signs a user CSR; CN form `<user>@<network>`.
    pub async fn sign_user_csr(&self, pem: &str) -> Result<String, AhaError> {
        let cn = certs::csr_cn(pem)?;
        let network = match self.cell.conf.aha_network.as_deref() {
            Some(network) => {
                certs::check_user_cn(&cn, network)?;
                network.to_string()
            }
            None => match cn.split_once('@') {
                Some((_, network)) => network.to_string(),
                None => {
                    return Err(AhaError::BadArg(format!(
                        "user CSR CN '{cn}' carries no network"
                    )));
                }
            },
        };
        self.sign_csr_for(&network, pem, "user", &cn).await
    }

    async fn sign_csr_for(
        &self,
        network: &str,
        pem: &str,
        kind: &str,
        cn: &str,
    ) -> Result<String, AhaError> {
        // Signing against a network we have not seen yet mints its CA.
        let _ = self.gen_ca_cert(network).await?;
        let ca = self.ca_pair(network)?;
        let signed = certs::sign_csr(&ca, pem)?;

        self.issue(NexusEdit::CertSign {
            kind: kind.to_string(),
            cn: cn.to_string(),
            serial: signed.serial,
        })
        .await?;
        Ok(signed.cert)
    }

    // --- Pools ---

    pub async fn add_aha_pool(&self, fullname: &str, creator: &str) -> Result<PoolDef, AhaError> {
        let (name, network) = self.resolve_name(fullname, None)?;
        self.issue(NexusEdit::PoolAdd {
            name: name.clone(),
            network: network.clone(),
            creator: creator.to_string(),
            created: Utc::now().timestamp_millis(),
        })
        .await?;
        pool::get_pool(&self.hive, &format!("{name}.{network}"))
            .ok_or_else(|| AhaError::Internal("pool vanished after creation".to_string()))
    }

    pub async fn del_aha_pool(&self, fullname: &str) -> Result<(), AhaError> {
        let pool = self
            .get_aha_pool(fullname)
            .ok_or_else(|| AhaError::NoSuchName(format!("no such pool: {fullname}")))?;
        self.issue(NexusEdit::PoolDel {
            name: pool.name,
            network: pool.network,
        })
        .await?;
        Ok(())
    }

    pub async fn add_aha_pool_svc(
        &self,
        poolname: &str,
        svcname: &str,
        creator: &str,
    ) -> Result<(), AhaError> {
        let pool = self
            .get_aha_pool(poolname)
            .ok_or_else(|| AhaError::NoSuchName(format!("no such pool: {poolname}")))?;

        let svc = self
            .get_aha_svc(svcname)
            .ok_or_else(|| AhaError::NoSuchName(format!("no such service: {svcname}")))?;

        self.issue(NexusEdit::PoolSvcAdd {
            name: pool.name,
            network: pool.network,
            svc: svc.fullname(),
            creator: creator.to_string(),
            created: Utc::now().timestamp_millis(),
        })
        .await?;
        Ok(())
    }

    pub async fn del_aha_pool_svc(&self, poolname: &str, svcname: &str) -> Result<(), AhaError> {
        let pool = self
            .get_aha_pool(poolname)
            .ok_or_else(|| AhaError::NoSuchName(format!("no such pool: {poolname}")))?;

        // Accept both fullnames and short names relative to the pool.
        let svc = match self.get_aha_svc(svcname) {
            Some(rec) => rec.fullname(),
            None => svcname.to_string(),
        };

        self.issue(NexusEdit::PoolSvcDel {
            name: pool.name,
            network: pool.network,
            svc,
        })
        .await?;
        Ok(())
    }

    pub fn get_aha_pool(&self, fullname: &str) -> Option<PoolDef> {
        let fullname = self.expand_name(fullname).ok()?;
        pool::get_pool(&self.hive, &fullname)
    }

    pub fn get_aha_pools(&self) -> Vec<PoolDef> {
        pool::get_pools(&self.hive)
    }

    // --- Provisioning ---

    fn prov_conf_keys(&self) -> Result<(String, UrlInfo), AhaError> {
        let conf = &self.cell.conf;
        let network = conf
            .aha_network
            .clone()
            .ok_or(AhaError::NeedConfValu("aha:network".to_string()))?;
        let listen = conf
            .provision_listen
            .clone()
            .ok_or(AhaError::NeedConfValu("provision:listen".to_string()))?;
        if conf.aha_urls.is_empty() && self.get_aha_urls().is_empty() {
            return Err(AhaError::NeedConfValu("aha:urls".to_string()));
        }
        Ok((network, UrlInfo::chop(&listen)?))
    }

    fn prov_url(&self, listen: &UrlInfo, iden: &str) -> String {
        let host = listen.host.clone().unwrap_or_else(|| "0.0.0.0".to_string());
        let bound = *self.cell.prov_addr.lock();
        let port = bound.map(|addr| addr.port()).or(listen.port).unwrap_or(0);
        format!("ssl://{host}:{port}/{iden}")
    }

    /// Mints a one-time service provisioning URL.
    pub async fn add_aha_svc_prov(
        &self,
        name: &str,
        provinfo: Option<Value>,
    ) -> Result<String, AhaError> {
        let (network, listen) = self.prov_conf_keys()?;
        let provinfo = provinfo.unwrap_or_else(|| json!({}));

        let mut conf = provinfo
            .get("conf")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        if let Some(want) = conf.get("aha:network").and_then(Value::as_str)
            && want != network
        {
            return Err(AhaError::BadConfValu(
                "Provisioning aha:network must be equal to the Aha servers network".to_string(),
            ));
        }

        let user = conf
            .get("aha:user")
            .and_then(Value::as_str)
            .unwrap_or("root")
            .to_string();

        conf.insert("aha:name".to_string(), json!(name));
        conf.insert("aha:network".to_string(), json!(network));
        conf.entry("aha:user".to_string()).or_insert(json!(user.clone()));

        // `00.axon` style names imply the logical leader `axon`.
        if !conf.contains_key("aha:leader")
            && let Some((prefix, rest)) = name.split_once('.')
            && !prefix.is_empty()
            && prefix.chars().all(|c| c.is_ascii_digit())
        {
            conf.insert("aha:leader".to_string(), json!(rest));
        }

        if let Some(mirror) = provinfo.get("mirror").and_then(Value::as_str) {
            conf.insert(
                "mirror".to_string(),
                json!(format!("aha://{user}@{mirror}.{network}")),
            );
            conf.insert("aha:leader".to_string(), json!(mirror));
        }

        let dmon_port = provinfo
            .get("dmon:port")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        conf.insert(
            "dmon:listen".to_string(),
            json!(format!(
                "ssl://0.0.0.0:{dmon_port}?hostname={name}.{network}&ca={network}"
            )),
        );

        if let Some(https) = provinfo.get("https:port").and_then(Value::as_u64) {
            conf.insert("https:port".to_string(), json!(https));
        }

        let registry: Vec<String> = self
            .get_aha_urls()
            .iter()
            .filter_map(|text| UrlInfo::chop(text).ok())
            .map(|info| info.with_user(&user).to_url())
            .collect();
        conf.insert("aha:registry".to_string(), json!(registry));

        let token = ProvToken::new(
            ProvKind::SvcProvision,
            &network,
            name,
            json!({"conf": Value::Object(conf)}),
        );
        let iden = token.iden.clone();
        self.issue(NexusEdit::ProvAdd { token }).await?;

        info!("one-time provisioning URL issued for service {name}.{network}");
        Ok(self.prov_url(&listen, &iden))
    }

    /// Mints a one-time user enrollment URL. The enrolled identity is also
    /// added to this AHA's own user database so the certificate can dial
    /// the directory once issued.
    pub async fn add_aha_user_enroll(&self, username: &str) -> Result<String, AhaError> {
        let (network, listen) = self.prov_conf_keys()?;

        let cn = format!("{username}@{network}");
        if auth::get_user(&self.hive, &cn).is_none() {
            let user = UserDef {
                iden: new_iden()?,
                name: cn,
                shadow: None,
                admin: false,
                locked: false,
            };
            self.issue(NexusEdit::UserAdd { user }).await?;
        }

        let servers: Vec<String> = self
            .get_aha_urls()
            .iter()
            .filter_map(|text| UrlInfo::chop(text).ok())
            .map(|info| info.with_user(username).to_url())
            .collect();

        let conf = json!({
            "conf": {
                "version": 1,
                "aha:network": network,
                "aha:user": username,
                "aha:servers": servers,
            },
        });

        let token = ProvToken::new(ProvKind::UserEnroll, &network, username, conf);
        let iden = token.iden.clone();
        self.issue(NexusEdit::ProvAdd { token }).await?;

        info!("one-time enrollment URL issued for user {username}@{network}");
        Ok(self.prov_url(&listen, &iden))
    }

    pub async fn del_aha_svc_prov(&self, iden: &str) -> Result<(), AhaError> {
        self.issue(NexusEdit::ProvDel {
            iden: iden.to_string(),
        })
        .await?;
        Ok(())
    }

    pub async fn del_aha_user_enroll(&self, iden: &str) -> Result<(), AhaError> {
        self.issue(NexusEdit::ProvDel {
            iden: iden.to_string(),
        })
        .await?;
        Ok(())
    }

    pub fn get_prov_token(&self, iden: &str) -> Result<ProvToken, AhaError> {
        provision::get_token(&self.hive, iden)
    }

    /// Consumes a token at the end of its one-time session.
    pub async fn consume_prov_token(&self, iden: &str) -> Result<(), AhaError> {
        if provision::get_token(&self.hive, iden).is_ok() {
            self.issue(NexusEdit::ProvConsume {
                iden: iden.to_string(),
            })
            .await?;
        }
        Ok(())
    }

    // --- Users ---

    pub async fn add_user(
        &self,
        name: &str,
        passwd: Option<&str>,
        admin: bool,
    ) -> Result<UserDef, AhaError> {
        let shadow = match passwd {
            Some(passwd) => Some(auth::hash_passwd(passwd)?),
            None => None,
        };
        let user = UserDef {
            iden: new_iden()?,
            name: name.to_string(),
            shadow,
            admin,
            locked: false,
        };
        self.issue(NexusEdit::UserAdd { user: user.clone() }).await?;
        Ok(user)
    }

    pub async fn set_user_passwd(&self, name: &str, passwd: &str) -> Result<(), AhaError> {
        if auth::get_user(&self.hive, name).is_none() {
            return Err(AhaError::NoSuchName(format!("no such user: {name}")));
        }
        self.issue(NexusEdit::UserPasswd {
            name: name.to_string(),
            shadow: auth::hash_passwd(passwd)?,
        })
        .await?;
        Ok(())
    }

    pub async fn set_user_locked(&self, name: &str, locked: bool) -> Result<(), AhaError> {
        if auth::get_user(&self.hive, name).is_none() {
            return Err(AhaError::NoSuchName(format!("no such user: {name}")));
        }
        self.issue(NexusEdit::UserLocked {
            name: name.to_string(),
            locked,
        })
        .await?;
        Ok(())
    }

    // --- Link lifecycle ---

    /// Downs every record a closing session registered. The only place
    /// offline transitions originate.
    pub async fn link_down(&self, link: &str) {
        let registered = self.links.lock().remove(link).unwrap_or_default();
        for (name, network) in registered {
            if let Err(e) = self.set_aha_svc_down(&name, link, Some(&network)).await {
                warn!("svcdown for {name}.{network} failed on link close: {e}");
            }
        }
    }
}

impl NexusApplier for AhaCell {
    fn apply(&self, indx: u64, edit: &NexusEdit) {
        debug!("nexus apply {}: {:?}", indx, edit);
        let hive = &self.hive;
        let topics = &self.topics;

        match edit {
            NexusEdit::SvcAdd {
                name,
                network,
                info,
            } => registry::apply_svc_add(hive, topics, name, network, info),
            NexusEdit::SvcDown {
                name,
                network,
                link,
            } => registry::apply_svc_down(hive, topics, name, network, link),
            NexusEdit::SvcMod {
                name,
                network,
                info,
            } => registry::apply_svc_mod(hive, name, network, info),
            NexusEdit::SvcDel { name, network } => {
                registry::apply_svc_del(hive, topics, name, network)
            }

            NexusEdit::PoolAdd {
                name,
                network,
                creator,
                created,
            } => pool::apply_pool_add(hive, name, network, creator, *created),
            NexusEdit::PoolDel { name, network } => {
                pool::apply_pool_del(hive, topics, name, network)
            }
            NexusEdit::PoolSvcAdd {
                name,
                network,
                svc,
                creator,
                created,
            } => pool::apply_pool_svc_add(hive, topics, name, network, svc, creator, *created),
            NexusEdit::PoolSvcDel { name, network, svc } => {
                pool::apply_pool_svc_del(hive, topics, name, network, svc)
            }

            NexusEdit::CaAdd { network, cert, key } => {
                hive.set(
                    &["certs", "cas", network],
                    json!({"cert": cert, "key": key}),
                );
                let pair = PemPair {
                    cert: cert.clone(),
                    key: key.clone(),
                };
                if let Err(e) = self.cell.certdir.save_ca_pair(network, &pair) {
                    warn!("could not write CA files for {network}: {e}");
                }
            }
            NexusEdit::CertSign { kind, cn, serial } => {
                hive.set(
                    &["certs", "issued", serial],
                    json!({"kind": kind, "cn": cn}),
                );
            }

            NexusEdit::ProvAdd { token } => provision::apply_prov_add(hive, token),
            NexusEdit::ProvConsume { iden } => provision::apply_prov_consume(hive, iden),
            NexusEdit::ProvDel { iden } => provision::apply_prov_del(hive, iden),

            NexusEdit::UserAdd { user } => auth::apply_user_add(hive, user),
            NexusEdit::UserPasswd { name, shadow } => {
                auth::apply_user_passwd(hive, name, shadow)
            }
            NexusEdit::UserLocked { name, locked } => {
                auth::apply_user_locked(hive, name, *locked)
            }
            NexusEdit::UserAdmin { name, admin } => auth::apply_user_admin(hive, name, *admin),
        }
    }
}

// --- RPC dispatch ---

fn p_str(params: &Value, key: &str) -> Result<String, AhaError> {
    params
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| AhaError::BadArg(format!("missing parameter '{key}'")))
}

fn p_opt_str(params: &Value, key: &str) -> Option<String> {
    params.get(key).and_then(Value::as_str).map(str::to_string)
}

#[async_trait]
impl CellLogic for AhaCell {
    fn cell_state(&self) -> &CellState {
        &self.cell
    }

    async fn handle_call(
        &self,
        ctx: &mut SessionCtx,
        method: &str,
        params: Value,
    ) -> Result<Value, AhaError> {
        // One-time provisioning sessions answer a bounded method set
        // scoped to their token; nothing else. The first call must resolve
        // the token named by the dialed URL's path.
        if ctx.prov_only {
            if method == "provResolve" {
                let iden = p_str(&params, "iden")?;
                self.get_prov_token(&iden)?;
                ctx.prov_iden = Some(iden);
                return Ok(json!(true));
            }
            let iden = ctx.prov_iden.clone().ok_or_else(|| {
                AhaError::AuthDeny("provisioning session has no resolved token".to_string())
            })?;
            return self.handle_prov_call(&iden, method, params).await;
        }

        match method {
            "auth" => {
                let user = p_str(&params, "user")?;
                let passwd = p_str(&params, "passwd")?;
                let (name, admin) = self.auth_user_passwd(&user, &passwd)?;
                ctx.user = Some(name);
                ctx.admin = admin;
                Ok(json!(true))
            }

            "getCellInfo" => {
                ctx.require_auth()?;
                Ok(self.cell.cell_info())
            }
            "getCellIden" => {
                ctx.require_auth()?;
                Ok(json!(self.cell.iden))
            }
            "getCellRunId" => {
                ctx.require_auth()?;
                Ok(json!(self.cell.run_iden))
            }

            "addAhaSvc" => {
                ctx.require_auth()?;
                let name = p_str(&params, "name")?;
                let network = p_opt_str(&params, "network");
                let info: SvcInfo =
                    serde_json::from_value(params.get("info").cloned().unwrap_or_else(|| json!({})))
                        .map_err(|e| AhaError::BadArg(format!("bad svcinfo: {e}")))?;
                self.add_aha_svc(&name, info, network.as_deref(), Some(&ctx.link))
                    .await?;
                Ok(Value::Null)
            }
            "setAhaSvcDown" => {
                ctx.require_auth()?;
                let name = p_str(&params, "name")?;
                let link = p_str(&params, "link")?;
                let network = p_opt_str(&params, "network");
                self.set_aha_svc_down(&name, &link, network.as_deref())
                    .await?;
                Ok(Value::Null)
            }
            "modAhaSvcInfo" => {
                ctx.require_auth()?;
                let fullname = p_str(&params, "name")?;
                let info = params.get("info").cloned().unwrap_or_default();
                self.mod_aha_svc_info(&fullname, info).await?;
                Ok(Value::Null)
            }
            "delAhaSvc" => {
                ctx.require_admin()?;
                let name = p_str(&params, "name")?;
                let network = p_opt_str(&params, "network");
                self.del_aha_svc(&name, network.as_deref()).await?;
                Ok(Value::Null)
            }
            "getAhaSvc" => {
                ctx.require_auth()?;
                let fullname = p_str(&params, "name")?;
                Ok(serde_json::to_value(self.get_aha_svc(&fullname))?)
            }
            "getAhaSvcs" => {
                ctx.require_auth()?;
                let network = p_opt_str(&params, "network");
                Ok(serde_json::to_value(self.get_aha_svcs(network.as_deref()))?)
            }
            "getAhaUrls" => {
                ctx.require_auth()?;
                Ok(json!(self.get_aha_urls()))
            }

            "genCaCert" => {
                ctx.require_admin()?;
                let network = p_str(&params, "network")?;
                Ok(json!(self.gen_ca_cert(&network).await?))
            }
            "getCaCert" => {
                ctx.require_auth()?;
                let network = p_str(&params, "network")?;
                Ok(serde_json::to_value(self.get_ca_cert(&network))?)
            }
            "signHostCsr" => {
                ctx.require_admin()?;
                let csr = p_str(&params, "csr")?;
                Ok(json!(self.sign_host_csr(&csr).await?))
            }
            "signUserCsr" => {
                ctx.require_admin()?;
                let csr = p_str(&params, "csr")?;
                Ok(json!(self.sign_user_csr(&csr).await?))
            }

            "addAhaPool" => {
                let user = ctx.require_admin()?.to_string();
                let name = p_str(&params, "name")?;
                Ok(serde_json::to_value(self.add_aha_pool(&name, &user).await?)?)
            }
            "delAhaPool" => {
                ctx.require_admin()?;
                let name = p_str(&params, "name")?;
                self.del_aha_pool(&name).await?;
                Ok(Value::Null)
            }
            "addAhaPoolSvc" => {
                let user = ctx.require_admin()?.to_string();
                let pool = p_str(&params, "pool")?;
                let svc = p_str(&params, "svc")?;
                self.add_aha_pool_svc(&pool, &svc, &user).await?;
                Ok(Value::Null)
            }
            "delAhaPoolSvc" => {
                ctx.require_admin()?;
                let pool = p_str(&params, "pool")?;
                let svc = p_str(&params, "svc")?;
                self.del_aha_pool_svc(&pool, &svc).await?;
                Ok(Value::Null)
            }
            "getAhaPool" => {
                ctx.require_auth()?;
                let name = p_str(&params, "name")?;
                Ok(serde_json::to_value(self.get_aha_pool(&name))?)
            }
            "getAhaPools" => {
                ctx.require_auth()?;
                Ok(serde_json::to_value(self.get_aha_pools())?)
            }

            "addAhaSvcProv" => {
                ctx.require_admin()?;
                let name = p_str(&params, "name")?;
                let provinfo = params.get("provinfo").cloned().filter(|v| !v.is_null());
                Ok(json!(self.add_aha_svc_prov(&name, provinfo).await?))
            }
            "delAhaSvcProv" => {
                ctx.require_admin()?;
                let iden = p_str(&params, "iden")?;
                self.del_aha_svc_prov(&iden).await?;
                Ok(Value::Null)
            }
            "addAhaUserEnroll" => {
                ctx.require_admin()?;
                let name = p_str(&params, "name")?;
                Ok(json!(self.add_aha_user_enroll(&name).await?))
            }
            "delAhaUserEnroll" => {
                ctx.require_admin()?;
                let iden = p_str(&params, "iden")?;
                self.del_aha_user_enroll(&iden).await?;
                Ok(Value::Null)
            }

            "getNexsIndx" => {
                ctx.require_admin()?;
                Ok(json!(self.nexus.current_indx()))
            }
            "getNexsEdits" => {
                ctx.require_admin()?;
                let offs = params.get("offs").and_then(Value::as_u64).unwrap_or(0);
                let entries = self.nexus.read_entries(offs).await?;
                Ok(serde_json::to_value(entries)?)
            }
            "getNexsSnapshot" => {
                ctx.require_admin()?;
                Ok(json!({
                    "indx": self.nexus.current_indx(),
                    "tree": self.hive.snapshot(),
                }))
            }
            "subscribeNexus" => {
                ctx.require_admin()?;
                let mut rx = self.nexus.subscribe();
                // A weak sender lets the session close even while this
                // forwarder is idle.
                let out = ctx.out_tx.downgrade();
                tokio::spawn(async move {
                    while let Ok(entry) = rx.recv().await {
                        let data = match serde_json::to_value(&entry) {
                            Ok(data) => data,
                            Err(_) => break,
                        };
                        let msg = WireMsg::Event {
                            topic: "nexus:log".to_string(),
                            data,
                        };
                        let Some(out) = out.upgrade() else { break };
                        if out.send(msg).await.is_err() {
                            break;
                        }
                    }
                });
                Ok(json!(true))
            }
            "waitNexsOffs" => {
                ctx.require_admin()?;
                let offs = params.get("offs").and_then(Value::as_u64).unwrap_or(0);
                let millis = params.get("timeout").and_then(Value::as_u64).unwrap_or(6000);
                self.nexus
                    .wait_offs(offs, Duration::from_millis(millis))
                    .await?;
                Ok(json!(true))
            }

            "subscribe" => {
                ctx.require_auth()?;
                let topic = p_str(&params, "topic")?;
                let mut rx = self.topics.subscribe(&topic);
                let out = ctx.out_tx.downgrade();
                tokio::spawn(async move {
                    loop {
                        match rx.recv().await {
                            Ok(data) => {
                                let msg = WireMsg::Event {
                                    topic: topic.clone(),
                                    data,
                                };
                                let Some(out) = out.upgrade() else { break };
                                if out.send(msg).await.is_err() {
                                    break;
                                }
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                            Err(_) => break,
                        }
                    }
                });
                Ok(json!(true))
            }

            "addUser" => {
                ctx.require_admin()?;
                let name = p_str(&params, "name")?;
                let passwd = p_opt_str(&params, "passwd");
                let admin = params.get("admin").and_then(Value::as_bool).unwrap_or(false);
                let user = self.add_user(&name, passwd.as_deref(), admin).await?;
                Ok(json!({"iden": user.iden, "name": user.name}))
            }
            "setUserLocked" => {
                ctx.require_admin()?;
                let name = p_str(&params, "name")?;
                let locked = params
                    .get("locked")
                    .and_then(Value::as_bool)
                    .ok_or_else(|| AhaError::BadArg("missing parameter 'locked'".to_string()))?;
                self.set_user_locked(&name, locked).await?;
                Ok(Value::Null)
            }
            "setUserPasswd" => {
                ctx.require_admin()?;
                let name = p_str(&params, "name")?;
                let passwd = p_str(&params, "passwd")?;
                self.set_user_passwd(&name, &passwd).await?;
                Ok(Value::Null)
            }

            _ => Err(AhaError::NoSuchName(format!("no such method: {method}"))),
        }
    }

    async fn on_link_down(&self, link: &str) {
        self.link_down(link).await;
    }

    async fn on_prov_session_fini(&self, iden: &str) {
        if let Err(e) = self.consume_prov_token(iden).await {
            warn!("could not consume provisioning token {iden}: {e}");
            return;
        }
        crate::core::metrics::PROV_TOKENS_CONSUMED_TOTAL.inc();
    }

    fn auth_user_passwd(&self, user: &str, passwd: &str) -> Result<(String, bool), AhaError> {
        let user = auth::auth_passwd(&self.hive, user, passwd)?;
        Ok((user.name, user.admin))
    }

    fn auth_user_cert(&self, cn: &str) -> Result<(String, bool), AhaError> {
        let user = auth::auth_cert_cn(&self.hive, cn)?;
        Ok((user.name, user.admin))
    }
}

impl AhaCell {
    /// The bounded method table served to a one-time provisioning session.
    async fn handle_prov_call(
        &self,
        iden: &str,
        method: &str,
        params: Value,
    ) -> Result<Value, AhaError> {
        let token = self.get_prov_token(iden)?;

        match method {
            "getProvInfo" => Ok(json!({
                "iden": token.iden,
                "conf": token.provinfo.get("conf").cloned().unwrap_or(json!({})),
            })),
            "getCaCert" => Ok(serde_json::to_value(self.get_ca_cert(&token.network))?),
            "signHostCsr" => {
                if token.kind != ProvKind::SvcProvision {
                    return Err(AhaError::BadArg(
                        "enrollment sessions cannot sign host certs".to_string(),
                    ));
                }
                let csr = p_str(&params, "csr")?;
                let cn = certs::csr_cn(&csr)?;
                let want = format!("{}.{}", token.name, token.network);
                if cn != want {
                    return Err(AhaError::BadArg(format!(
                        "provisioning session may only sign CN {want}, not {cn}"
                    )));
                }
                self.sign_csr_for(&token.network, &csr, "host", &cn).await.map(|c| json!(c))
            }
            "signUserCsr" => {
                let csr = p_str(&params, "csr")?;
                let cn = certs::csr_cn(&csr)?;
                let want = match token.kind {
                    ProvKind::SvcProvision => {
                        let user = token
                            .provinfo
                            .get("conf")
                            .and_then(|c| c.get("aha:user"))
                            .and_then(Value::as_str)
                            .unwrap_or("root");
                        format!("{user}@{}", token.network)
                    }
                    ProvKind::UserEnroll => format!("{}@{}", token.name, token.network),
                };
                if cn != want {
                    return Err(AhaError::BadArg(format!(
                        "provisioning session may only sign CN {want}, not {cn}"
                    )));
                }
                self.sign_csr_for(&token.network, &csr, "user", &cn).await.map(|c| json!(c))
            }
            _ => Err(AhaError::NoSuchName(format!(
                "no such provisioning method: {method}"
            ))),
        }
    }
}
