// src/core/registry.rs

//! The service registry: `<name>.<network>` records with liveness,
//! leader-ness, readiness, and addressing.
//!
//! All mutations are expressed as nexus edits and land here through the
//! single apply path; reads are plain hive lookups.

use crate::core::errors::AhaError;
use crate::core::hive::Hive;
use crate::core::topics::TopicHub;
use crate::core::urls::UrlInfo;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Keys of `svcinfo` that `modAhaSvcInfo` may touch.
const MOD_WHITELIST: &[&str] = &["ready"];

/// The mutable half of a service record. Fields left `None` by a caller
/// are preserved on merge, matching the additive registration contract.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SvcInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub urlinfo: Option<UrlInfo>,
    /// The link iden of the inbound session currently holding this record
    /// online. Absent when the service is offline.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub online: Option<String>,
    /// Persisted across AHA restarts; cleared only by an explicit setter.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ready: Option<bool>,
    /// True iff the service self-reports as the active cell of a logical
    /// leader name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leader: Option<bool>,
    /// Per-process run iden, regenerated on every cell start.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run: Option<String>,
}

impl SvcInfo {
    /// Overlays the populated fields of `other` onto `self`.
    pub fn merge(&mut self, other: &SvcInfo) {
        if other.urlinfo.is_some() {
            self.urlinfo = other.urlinfo.clone();
        }
        if other.online.is_some() {
            self.online = other.online.clone();
        }
        if other.ready.is_some() {
            self.ready = other.ready;
        }
        if other.leader.is_some() {
            self.leader = other.leader;
        }
        if other.run.is_some() {
            self.run = other.run.clone();
        }
    }
}

/// A full registry record as returned by `getAhaSvc`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SvcRecord {
    pub name: String,
    pub network: String,
    pub svcinfo: SvcInfo,
}

impl SvcRecord {
    pub fn fullname(&self) -> String {
        format!("{}.{}", self.name, self.network)
    }
}

fn svc_path<'a>(network: &'a str, name: &'a str) -> [&'a str; 4] {
    ["aha", "services", network, name]
}

/// Validates a `modAhaSvcInfo` payload against the whitelist.
pub fn check_mod_info(info: &Value) -> Result<(), AhaError> {
    let Some(map) = info.as_object() else {
        return Err(AhaError::BadArg("svcinfo mod must be an object".to_string()));
    };
    for key in map.keys() {
        if !MOD_WHITELIST.contains(&key.as_str()) {
            return Err(AhaError::BadArg(format!(
                "'{key}' is not a settable svcinfo key"
            )));
        }
    }
    Ok(())
}

// --- Apply helpers, invoked from the nexus apply path only ---

/// Upserts a record, merging `info` into any existing svcinfo, and fires
/// `aha:svcadd`.
pub fn apply_svc_add(hive: &Hive, topics: &TopicHub, name: &str, network: &str, info: &SvcInfo) {
    let path = svc_path(network, name);

    let mut svcinfo = hive
        .get(&path)
        .and_then(|v| serde_json::from_value::<SvcRecord>(v).ok())
        .map(|rec| rec.svcinfo)
        .unwrap_or_default();
    svcinfo.merge(info);

    let rec = SvcRecord {
        name: name.to_string(),
        network: network.to_string(),
        svcinfo,
    };
    let value = serde_json::to_value(&rec).unwrap_or(Value::Null);
    hive.set(&path, value.clone());

    topics.publish("aha:svcadd", value);
}

/// Clears `online` iff the stored link matches, so a stale close can never
/// unseat a fresh session. Fires `aha:svcdown` only on a real transition.
pub fn apply_svc_down(hive: &Hive, topics: &TopicHub, name: &str, network: &str, link: &str) {
    let path = svc_path(network, name);
    let Some(value) = hive.get(&path) else {
        return;
    };
    let Ok(mut rec) = serde_json::from_value::<SvcRecord>(value) else {
        return;
    };

    if rec.svcinfo.online.as_deref() != Some(link) {
        return;
    }
    rec.svcinfo.online = None;

    let value = serde_json::to_value(&rec).unwrap_or(Value::Null);
    hive.set(&path, value.clone());
    topics.publish("aha:svcdown", value);
}

/// Applies a whitelisted partial update to `svcinfo`.
pub fn apply_svc_mod(hive: &Hive, name: &str, network: &str, info: &Value) {
    let path = svc_path(network, name);
    let Some(value) = hive.get(&path) else {
        return;
    };
    let Ok(mut rec) = serde_json::from_value::<SvcRecord>(value) else {
        return;
    };

    if let Some(map) = info.as_object() {
        if let Some(ready) = map.get("ready").and_then(Value::as_bool) {
            rec.svcinfo.ready = Some(ready);
        }
    }

    hive.set(&path, serde_json::to_value(&rec).unwrap_or(Value::Null));
}

/// Removes a record and fires `aha:svcdel`.
pub fn apply_svc_del(hive: &Hive, topics: &TopicHub, name: &str, network: &str) {
    if hive.pop(&svc_path(network, name)).is_some() {
        topics.publish("aha:svcdel", json!({"name": name, "network": network}));
    }
}

// --- Reads ---

/// Looks up one record by `<name>.<network>` fullname.
pub fn get_svc(hive: &Hive, fullname: &str) -> Option<SvcRecord> {
    // A fullname may contain dots in both halves; scan the known networks
    // for the longest matching suffix.
    for network in hive.kids(&["aha", "services"]) {
        if let Some(name) = fullname.strip_suffix(&format!(".{network}"))
            && let Some(value) = hive.get(&svc_path(&network, name))
        {
            return serde_json::from_value(value).ok();
        }
    }
    None
}

/// All records, optionally filtered to one network.
pub fn get_svcs(hive: &Hive, network: Option<&str>) -> Vec<SvcRecord> {
    let mut out = Vec::new();
    for netw in hive.kids(&["aha", "services"]) {
        if let Some(want) = network
            && want != netw
        {
            continue;
        }
        for (_name, value) in hive.dict(&["aha", "services", &netw]) {
            if let Ok(rec) = serde_json::from_value::<SvcRecord>(value) {
                out.push(rec);
            }
        }
    }
    out
}

/// Records currently online, for restart teardown.
pub fn online_svcs(hive: &Hive) -> Vec<SvcRecord> {
    get_svcs(hive, None)
        .into_iter()
        .filter(|rec| rec.svcinfo.online.is_some())
        .collect()
}
