// src/core/cell.rs

//! The generic cell substrate shared by AHA and member cells: durable cell
//! identity, per-run identity, the active/passive flag, and the capability
//! surface a transport session dispatches into.

use crate::config::CellConfig;
use crate::core::certs::CertDir;
use crate::core::errors::AhaError;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

use crate::core::wire::WireMsg;

/// Context of one inbound transport session, handed to every dispatch.
#[derive(Clone)]
pub struct SessionCtx {
    /// Opaque per-session link identity. Correlates registry `online`
    /// fields with the session that set them.
    pub link: String,
    /// The authenticated user name, once auth has happened.
    pub user: Option<String>,
    pub admin: bool,
    /// True when the session arrived on the provisioning listener; such
    /// sessions see only the one-time method table.
    pub prov_only: bool,
    /// The one-time token this provisioning session resolved to.
    pub prov_iden: Option<String>,
    /// Outbound frame queue of the session, for server-push events.
    pub out_tx: mpsc::Sender<WireMsg>,
}

impl SessionCtx {
    pub fn require_auth(&self) -> Result<&str, AhaError> {
        self.user
            .as_deref()
            .ok_or_else(|| AhaError::AuthDeny("authentication required".to_string()))
    }

    pub fn require_admin(&self) -> Result<&str, AhaError> {
        let user = self.require_auth()?;
        if !self.admin {
            return Err(AhaError::AuthDeny(format!("user {user} is not an admin")));
        }
        Ok(user)
    }
}

/// The capability surface of a cell. The connection handler routes every
/// call here; cell types differ only in the methods they answer.
#[async_trait]
pub trait CellLogic: Send + Sync {
    /// Shared identity/lifecycle state.
    fn cell_state(&self) -> &CellState;

    /// Answers one RPC. Method names are symbolic; unknown ones fail
    /// `no-such-name`.
    async fn handle_call(
        &self,
        ctx: &mut SessionCtx,
        method: &str,
        params: Value,
    ) -> Result<Value, AhaError>;

    /// Observes the terminal link-down of a session. Called exactly once
    /// per session, after the transport is gone.
    async fn on_link_down(&self, link: &str);

    /// Observes the close of a one-time provisioning session. The default
    /// is a no-op; the AHA consumes the token here.
    async fn on_prov_session_fini(&self, _iden: &str) {}

    /// Password login hook for the `auth` method and HTTP basic auth.
    fn auth_user_passwd(&self, user: &str, passwd: &str) -> Result<(String, bool), AhaError>;

    /// Certificate login hook for mutual-TLS sessions.
    fn auth_user_cert(&self, cn: &str) -> Result<(String, bool), AhaError>;
}

/// Identity and lifecycle shared by every cell type.
pub struct CellState {
    pub conf: CellConfig,
    pub dirn: PathBuf,
    /// Durable cell iden, persisted in `cell.guid`.
    pub iden: String,
    /// Per-process run iden, regenerated on every start.
    pub run_iden: String,
    pub certdir: CertDir,
    /// Bound address of the RPC listener, once it is up.
    pub dmon_addr: Mutex<Option<SocketAddr>>,
    /// Bound address of the provisioning listener, once it is up.
    pub prov_addr: Mutex<Option<SocketAddr>>,
    active: AtomicBool,
}

impl CellState {
    pub fn new(dirn: &Path, conf: CellConfig) -> Result<Self, AhaError> {
        std::fs::create_dir_all(dirn)?;

        let guid_path = dirn.join("cell.guid");
        let iden = match std::fs::read_to_string(&guid_path) {
            Ok(text) => text.trim().to_string(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let iden = new_iden()?;
                std::fs::write(&guid_path, &iden)?;
                iden
            }
            Err(e) => return Err(e.into()),
        };

        // A cell with a mirror upstream starts passive and follows.
        let active = conf.mirror.is_none();

        Ok(Self {
            certdir: CertDir::new(dirn),
            conf,
            dirn: dirn.to_path_buf(),
            iden,
            run_iden: new_iden()?,
            dmon_addr: Mutex::new(None),
            prov_addr: Mutex::new(None),
            active: AtomicBool::new(active),
        })
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }

    /// The `getCellInfo` payload common to all cell types.
    pub fn cell_info(&self) -> Value {
        json!({
            "cell": {
                "iden": self.iden,
                "run": self.run_iden,
                "active": self.is_active(),
                "ready": true,
                "version": env!("CARGO_PKG_VERSION"),
                "aha": {
                    "name": self.conf.aha_name,
                    "network": self.conf.aha_network,
                    "leader": self.conf.aha_leader,
                },
            },
        })
    }
}

/// A fresh 32-hex iden, the fabric's standard identifier shape.
pub fn new_iden() -> Result<String, AhaError> {
    let mut buf = [0u8; 16];
    getrandom::fill(&mut buf).map_err(|e| AhaError::Internal(e.to_string()))?;
    Ok(hex::encode(buf))
}

/// A plain member cell: the smallest thing that can join the fabric.
/// It answers the cell-info surface, tracks a handful of users for its own
/// callers, and flips between active and passive on request.
pub struct BaseCell {
    pub cell: CellState,
    /// The root password, from `auth:passwd` or provisioning.
    passwd: Mutex<Option<String>>,
    /// Local users (name -> locked). Cert CNs resolve against this.
    users: Mutex<std::collections::HashMap<String, bool>>,
    active_tx: tokio::sync::watch::Sender<bool>,
}

impl BaseCell {
    pub fn new(dirn: &Path, conf: CellConfig) -> Result<Arc<Self>, AhaError> {
        let passwd = conf.auth_passwd.clone();
        let cell = CellState::new(dirn, conf)?;
        let (active_tx, _) = tokio::sync::watch::channel(cell.is_active());

        let mut users = std::collections::HashMap::new();
        users.insert("root".to_string(), false);
        if let Some(admin) = cell.conf.aha_admin.clone() {
            users.insert(admin, false);
        }
        if let Some(user) = cell.conf.aha_user.clone() {
            users.insert(user, false);
        }

        Ok(Arc::new(Self {
            cell,
            passwd: Mutex::new(passwd),
            users: Mutex::new(users),
            active_tx,
        }))
    }

    /// Observers of the active flag (the registry client task).
    pub fn active_rx(&self) -> tokio::sync::watch::Receiver<bool> {
        self.active_tx.subscribe()
    }

    pub fn set_cell_active(&self, active: bool) {
        self.cell.set_active(active);
        let _ = self.active_tx.send(active);
    }

    pub fn add_user(&self, name: &str) {
        self.users.lock().insert(name.to_string(), false);
    }

    pub fn set_user_locked(&self, name: &str, locked: bool) {
        self.users.lock().insert(name.to_string(), locked);
    }
}

#[async_trait]
impl CellLogic for BaseCell {
    fn cell_state(&self) -> &CellState {
        &self.cell
    }

    async fn handle_call(
        &self,
        ctx: &mut SessionCtx,
        method: &str,
        params: Value,
    ) -> Result<Value, AhaError> {
        match method {
            "auth" => {
                let user = params
                    .get("user")
                    .and_then(Value::as_str)
                    .ok_or_else(|| AhaError::BadArg("missing parameter 'user'".to_string()))?;
                let passwd = params
                    .get("passwd")
                    .and_then(Value::as_str)
                    .ok_or_else(|| AhaError::BadArg("missing parameter 'passwd'".to_string()))?;
                let (name, admin) = self.auth_user_passwd(user, passwd)?;
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
            "setCellActive" => {
                ctx.require_admin()?;
                let active = params
                    .get("active")
                    .and_then(Value::as_bool)
                    .ok_or_else(|| AhaError::BadArg("missing parameter 'active'".to_string()))?;
                self.set_cell_active(active);
                Ok(json!(active))
            }
            "addUser" => {
                ctx.require_admin()?;
                let name = params
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| AhaError::BadArg("missing parameter 'name'".to_string()))?;
                self.add_user(name);
                Ok(json!({"name": name}))
            }
            "setUserLocked" => {
                ctx.require_admin()?;
                let name = params
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| AhaError::BadArg("missing parameter 'name'".to_string()))?;
                let locked = params
                    .get("locked")
                    .and_then(Value::as_bool)
                    .ok_or_else(|| AhaError::BadArg("missing parameter 'locked'".to_string()))?;
                self.set_user_locked(name, locked);
                Ok(Value::Null)
            }
            _ => Err(AhaError::NoSuchName(format!("no such method: {method}"))),
        }
    }

    async fn on_link_down(&self, _link: &str) {}

    fn auth_user_passwd(&self, user: &str, passwd: &str) -> Result<(String, bool), AhaError> {
        if user != "root" {
            return Err(AhaError::AuthDeny(format!("no such user: {user}")));
        }
        match self.passwd.lock().as_deref() {
            Some(stored) if stored == passwd => Ok(("root".to_string(), true)),
            _ => Err(AhaError::AuthDeny("invalid password for root".to_string())),
        }
    }

    fn auth_user_cert(&self, cn: &str) -> Result<(String, bool), AhaError> {
        // CN form `<user>@<network>`; both the full CN and the bare user
        // name are accepted identities.
        let user = cn.split_once('@').map(|(u, _)| u).unwrap_or(cn);
        let users = self.users.lock();
        let locked = users
            .get(cn)
            .or_else(|| users.get(user))
            .copied()
            .ok_or_else(|| AhaError::AuthDeny(format!("no such user: {cn}")))?;
        if locked {
            return Err(AhaError::AuthDeny(format!("user {cn} is locked")));
        }
        let admin = user == "root" || self.cell.conf.aha_admin.as_deref() == Some(cn);
        Ok((user.to_string(), admin))
    }
}
