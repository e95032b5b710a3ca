// src/config.rs

//! Manages cell configuration: loading, override merging, and validation.
//!
//! A cell directory carries `cell.toml` (primary) and `cell.mods.toml`
//! (overrides, e.g. values punched in by an operator after provisioning).
//! Keys keep their fabric names (`aha:name`, `dmon:listen`, ...) via quoted
//! TOML keys.

use crate::core::errors::AhaError;
use crate::core::nexus::WalFsync;
use crate::core::urls::UrlInfo;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::time::Duration;

/// Accepts either a single string or a list where the fabric allows both
/// (e.g. `aha:registry`).
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn into_vec(self) -> Vec<String> {
        match self {
            OneOrMany::One(s) => vec![s],
            OneOrMany::Many(v) => v,
        }
    }
}

/// A raw representation of the config file before validation.
#[derive(Deserialize)]
struct RawConfig {
    #[serde(rename = "aha:name")]
    aha_name: Option<String>,
    #[serde(rename = "aha:network")]
    aha_network: Option<String>,
    #[serde(rename = "aha:leader")]
    aha_leader: Option<String>,
    #[serde(rename = "aha:admin")]
    aha_admin: Option<String>,
    #[serde(rename = "aha:user")]
    aha_user: Option<String>,
    #[serde(rename = "aha:urls")]
    aha_urls: Option<OneOrMany>,
    #[serde(rename = "aha:registry")]
    aha_registry: Option<OneOrMany>,
    #[serde(rename = "aha:provision")]
    aha_provision: Option<String>,
    #[serde(rename = "provision:listen")]
    provision_listen: Option<String>,
    #[serde(rename = "dmon:listen")]
    dmon_listen: Option<String>,
    #[serde(rename = "https:port")]
    https_port: Option<u16>,
    mirror: Option<String>,
    #[serde(rename = "nexslog:en", default = "default_nexslog_en")]
    nexslog_en: bool,
    #[serde(rename = "nexslog:fsync", default)]
    nexslog_fsync: WalFsync,
    #[serde(rename = "auth:passwd")]
    auth_passwd: Option<String>,
    #[serde(default = "default_log_level")]
    log_level: String,
    #[serde(
        rename = "aha:timeout",
        default = "default_aha_timeout",
        with = "humantime_serde"
    )]
    aha_timeout: Duration,
}

fn default_nexslog_en() -> bool {
    true
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_aha_timeout() -> Duration {
    Duration::from_secs(10)
}

/// The validated configuration of one cell (AHA or member).
#[derive(Debug, Clone, Serialize)]
pub struct CellConfig {
    /// Short logical name, e.g. `aha`, `0.cryo`, `00.axon.loop.vertex.link`.
    #[serde(rename = "aha:name", skip_serializing_if = "Option::is_none")]
    pub aha_name: Option<String>,
    /// DNS-like namespace the cell's identity is scoped to.
    #[serde(rename = "aha:network", skip_serializing_if = "Option::is_none")]
    pub aha_network: Option<String>,
    /// Logical leader name this cell serves while active.
    #[serde(rename = "aha:leader", skip_serializing_if = "Option::is_none")]
    pub aha_leader: Option<String>,
    /// A user (`user@network`) auto-added as admin on every boot.
    #[serde(rename = "aha:admin", skip_serializing_if = "Option::is_none")]
    pub aha_admin: Option<String>,
    /// The user identity this cell dials AHA services as.
    #[serde(rename = "aha:user", skip_serializing_if = "Option::is_none")]
    pub aha_user: Option<String>,
    /// URLs the AHA advertises to members.
    #[serde(rename = "aha:urls", skip_serializing_if = "Vec::is_empty")]
    pub aha_urls: Vec<String>,
    /// AHA URLs a member dials to register itself.
    #[serde(rename = "aha:registry", skip_serializing_if = "Vec::is_empty")]
    pub aha_registry: Vec<String>,
    /// One-time provisioning URL consumed at first boot.
    #[serde(rename = "aha:provision", skip_serializing_if = "Option::is_none")]
    pub aha_provision: Option<String>,
    /// Listen URL for one-time provisioning connections.
    #[serde(rename = "provision:listen", skip_serializing_if = "Option::is_none")]
    pub provision_listen: Option<String>,
    /// Listen URL for the main RPC surface.
    #[serde(rename = "dmon:listen", skip_serializing_if = "Option::is_none")]
    pub dmon_listen: Option<String>,
    /// Port for the admin HTTP API.
    #[serde(rename = "https:port", skip_serializing_if = "Option::is_none")]
    pub https_port: Option<u16>,
    /// Upstream URL when this cell runs as a mirror.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mirror: Option<String>,
    #[serde(rename = "nexslog:en")]
    pub nexslog_en: bool,
    #[serde(rename = "nexslog:fsync")]
    pub nexslog_fsync: WalFsync,
    /// Bootstrap root password, asserted on every boot.
    #[serde(rename = "auth:passwd", skip_serializing_if = "Option::is_none")]
    pub auth_passwd: Option<String>,
    pub log_level: String,
    /// Client-side timeout for AHA calls.
    #[serde(rename = "aha:timeout", with = "humantime_serde")]
    pub aha_timeout: Duration,
}

impl Default for CellConfig {
    fn default() -> Self {
        Self {
            aha_name: None,
            aha_network: None,
            aha_leader: None,
            aha_admin: None,
            aha_user: None,
            aha_urls: Vec::new(),
            aha_registry: Vec::new(),
            aha_provision: None,
            provision_listen: None,
            dmon_listen: None,
            https_port: None,
            mirror: None,
            nexslog_en: default_nexslog_en(),
            nexslog_fsync: WalFsync::default(),
            auth_passwd: None,
            log_level: default_log_level(),
            aha_timeout: default_aha_timeout(),
        }
    }
}

impl RawConfig {
    fn into_config(self) -> CellConfig {
        CellConfig {
            aha_name: self.aha_name,
            aha_network: self.aha_network,
            aha_leader: self.aha_leader,
            aha_admin: self.aha_admin,
            aha_user: self.aha_user,
            aha_urls: self.aha_urls.map(OneOrMany::into_vec).unwrap_or_default(),
            aha_registry: self
                .aha_registry
                .map(OneOrMany::into_vec)
                .unwrap_or_default(),
            aha_provision: self.aha_provision,
            provision_listen: self.provision_listen,
            dmon_listen: self.dmon_listen,
            https_port: self.https_port,
            mirror: self.mirror,
            nexslog_en: self.nexslog_en,
            nexslog_fsync: self.nexslog_fsync,
            auth_passwd: self.auth_passwd,
            log_level: self.log_level,
            aha_timeout: self.aha_timeout,
        }
    }
}

impl CellConfig {
    /// Loads `cell.toml` and overlays `cell.mods.toml` from a cell dir.
    pub fn from_dir(dirn: &Path) -> Result<Self, AhaError> {
        let base = load_table(&dirn.join("cell.toml"))?;
        let mods = load_table(&dirn.join("cell.mods.toml"))?;

        let mut merged = base.unwrap_or_default();
        if let Some(mods) = mods {
            for (key, value) in mods {
                merged.insert(key, value);
            }
        }

        let text = toml::to_string(&merged)
            .map_err(|e| AhaError::Internal(format!("could not render cell config: {e}")))?;
        Self::from_toml(&text)
    }

    /// Parses a config from TOML text. Used by tests and tools.
    pub fn from_toml(text: &str) -> Result<Self, AhaError> {
        let raw: RawConfig = toml::from_str(text)
            .map_err(|e| AhaError::BadConfValu(format!("invalid cell config: {e}")))?;
        let config = raw.into_config();
        config.validate()?;
        Ok(config)
    }

    /// Validates the resolved configuration for logical consistency.
    pub fn validate(&self) -> Result<(), AhaError> {
        for (key, urls) in [("aha:urls", &self.aha_urls), ("aha:registry", &self.aha_registry)] {
            for text in urls {
                UrlInfo::chop(text)
                    .map_err(|e| AhaError::BadConfValu(format!("{key} entry '{text}': {e}")))?;
            }
        }
        for (key, url) in [
            ("dmon:listen", &self.dmon_listen),
            ("provision:listen", &self.provision_listen),
            ("mirror", &self.mirror),
            ("aha:provision", &self.aha_provision),
        ] {
            if let Some(text) = url {
                UrlInfo::chop(text)
                    .map_err(|e| AhaError::BadConfValu(format!("{key} '{text}': {e}")))?;
            }
        }
        if let Some(name) = &self.aha_name
            && name.is_empty()
        {
            return Err(AhaError::BadConfValu("aha:name cannot be empty".to_string()));
        }
        Ok(())
    }

    /// The cell's `<name>.<network>` fullname, when both halves are known.
    /// A name that already carries the network is returned as-is.
    pub fn fullname(&self) -> Option<String> {
        let name = self.aha_name.as_deref()?;
        match self.aha_network.as_deref() {
            Some(network) if !name.ends_with(&format!(".{network}")) => {
                Some(format!("{name}.{network}"))
            }
            _ => Some(name.to_string()),
        }
    }

    /// The fullname of the leader alias, if one is configured.
    pub fn leader_fullname(&self) -> Option<String> {
        let leader = self.aha_leader.as_deref()?;
        match self.aha_network.as_deref() {
            Some(network) if !leader.ends_with(&format!(".{network}")) => {
                Some(format!("{leader}.{network}"))
            }
            _ => Some(leader.to_string()),
        }
    }

    /// Merges provisioning conf values into `cell.toml` and drops any keys
    /// the overrides file would shadow, then returns the updated config.
    pub fn apply_provisioning(dirn: &Path, conf: &Value) -> Result<Self, AhaError> {
        let Some(map) = conf.as_object() else {
            return Err(AhaError::BadArg("provinfo conf must be an object".to_string()));
        };

        let path = dirn.join("cell.toml");
        let mut base = load_table(&path)?.unwrap_or_default();
        // The one-time URL must not survive into the next boot.
        base.remove("aha:provision");
        for (key, value) in map {
            base.insert(key.clone(), json_to_toml(value)?);
        }
        std::fs::write(&path, toml::to_string(&base).map_err(|e| {
            AhaError::Internal(format!("could not render cell.toml: {e}"))
        })?)?;

        // Values in the overrides file that duplicate provisioning keys are
        // dropped so provisioning wins deterministically.
        let mods_path = dirn.join("cell.mods.toml");
        if let Some(mods) = load_table(&mods_path)? {
            let before = mods.len();
            let kept: toml::Table = mods
                .into_iter()
                .filter(|(key, _)| !map.contains_key(key))
                .collect();
            if kept.len() != before {
                std::fs::write(&mods_path, toml::to_string(&kept).map_err(|e| {
                    AhaError::Internal(format!("could not render cell.mods.toml: {e}"))
                })?)?;
            }
        }

        Self::from_dir(dirn)
    }
}

fn load_table(path: &Path) -> Result<Option<toml::Table>, AhaError> {
    if !path.exists() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(path)?;
    let table = toml::from_str(&text)
        .map_err(|e| AhaError::BadConfValu(format!("{}: {e}", path.display())))?;
    Ok(Some(table))
}

fn json_to_toml(value: &Value) -> Result<toml::Value, AhaError> {
    let out = match value {
        Value::Null => toml::Value::String(String::new()),
        Value::Bool(b) => toml::Value::Boolean(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                toml::Value::Integer(i)
            } else {
                toml::Value::Float(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => toml::Value::String(s.clone()),
        Value::Array(items) => {
            toml::Value::Array(items.iter().map(json_to_toml).collect::<Result<_, _>>()?)
        }
        Value::Object(map) => {
            let mut table = toml::Table::new();
            for (key, value) in map {
                table.insert(key.clone(), json_to_toml(value)?);
            }
            toml::Value::Table(table)
        }
    };
    Ok(out)
}
