// src/core/provision.rs

//! One-time provisioning tokens.
//!
//! A token is minted by an admin, encoded as an `ssl://host:port/<iden>`
//! URL, and redeemed exactly once by the prospective member. Redemption is
//! recorded through the nexus so mirrors agree on consumption.

use crate::core::errors::AhaError;
use crate::core::hive::Hive;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Tokens are good for one hour; a stale URL fails like a consumed one.
pub const TOKEN_TTL_MILLIS: i64 = 60 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProvKind {
    SvcProvision,
    UserEnroll,
}

/// A one-time provisioning token, stored under `aha/provisioning/<iden>`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProvToken {
    pub iden: String,
    pub kind: ProvKind,
    pub network: String,
    /// Service name for `svc-provision`, username for `user-enroll`.
    pub name: String,
    /// The configuration bundle handed to the member on redemption.
    #[serde(default)]
    pub provinfo: Value,
    pub created: i64,
    pub expires: i64,
    #[serde(default)]
    pub consumed: bool,
}

impl ProvToken {
    pub fn new(kind: ProvKind, network: &str, name: &str, provinfo: Value) -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            iden: uuid::Uuid::new_v4().simple().to_string(),
            kind,
            network: network.to_string(),
            name: name.to_string(),
            provinfo,
            created: now,
            expires: now + TOKEN_TTL_MILLIS,
            consumed: false,
        }
    }

    pub fn expired(&self) -> bool {
        Utc::now().timestamp_millis() >= self.expires
    }
}

fn prov_path(iden: &str) -> [&str; 3] {
    ["aha", "provisioning", iden]
}

// --- Apply helpers, invoked from the nexus apply path only ---

pub fn apply_prov_add(hive: &Hive, token: &ProvToken) {
    hive.set(
        &prov_path(&token.iden),
        serde_json::to_value(token).unwrap_or(Value::Null),
    );
}

/// Consumption removes the token outright; a consumed token and an unknown
/// token are indistinguishable to a second redeemer.
pub fn apply_prov_consume(hive: &Hive, iden: &str) {
    hive.pop(&prov_path(iden));
}

pub fn apply_prov_del(hive: &Hive, iden: &str) {
    hive.pop(&prov_path(iden));
}

// --- Reads ---

/// Resolves a live token. Expired or consumed tokens fail `no-such-name`,
/// the same as never-issued ones.
pub fn get_token(hive: &Hive, iden: &str) -> Result<ProvToken, AhaError> {
    let token: ProvToken = hive
        .get(&prov_path(iden))
        .and_then(|v| serde_json::from_value(v).ok())
        .ok_or_else(|| AhaError::NoSuchName(format!("no such provisioning token: {iden}")))?;

    if token.consumed || token.expired() {
        return Err(AhaError::NoSuchName(format!(
            "no such provisioning token: {iden}"
        )));
    }
    Ok(token)
}
