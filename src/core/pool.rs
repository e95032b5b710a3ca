// src/core/pool.rs

//! Service pools: named sets of equivalent back-ends with live membership
//! notifications on a per-pool topic.

use crate::core::hive::Hive;
use crate::core::topics::TopicHub;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Membership metadata for one service in a pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolSvcDef {
    pub created: i64,
    pub creator: String,
}

/// A persisted pool. `IndexMap` keeps members in join order so round-robin
/// behaviour is deterministic across leader and mirrors.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolDef {
    pub name: String,
    pub network: String,
    pub created: i64,
    pub creator: String,
    #[serde(default)]
    pub services: IndexMap<String, PoolSvcDef>,
}

impl PoolDef {
    pub fn fullname(&self) -> String {
        format!("{}.{}", self.name, self.network)
    }
}

fn pool_path<'a>(network: &'a str, name: &'a str) -> [&'a str; 4] {
    ["aha", "pools", network, name]
}

/// The topic a pool's membership deltas are published on.
pub fn pool_topic(fullname: &str) -> String {
    format!("aha:pool:{fullname}")
}

// --- Apply helpers, invoked from the nexus apply path only ---

pub fn apply_pool_add(hive: &Hive, name: &str, network: &str, creator: &str, created: i64) {
    let path = pool_path(network, name);
    if hive.get(&path).is_some() {
        return;
    }
    let pool = PoolDef {
        name: name.to_string(),
        network: network.to_string(),
        created,
        creator: creator.to_string(),
        services: IndexMap::new(),
    };
    hive.set(&path, serde_json::to_value(&pool).unwrap_or(Value::Null));
}

pub fn apply_pool_del(hive: &Hive, topics: &TopicHub, name: &str, network: &str) {
    if hive.pop(&pool_path(network, name)).is_some() {
        let fullname = format!("{name}.{network}");
        topics.publish(&pool_topic(&fullname), json!({"event": "pool:del"}));
    }
}

pub fn apply_pool_svc_add(
    hive: &Hive,
    topics: &TopicHub,
    name: &str,
    network: &str,
    svc: &str,
    creator: &str,
    created: i64,
) {
    let path = pool_path(network, name);
    let Some(mut pool) = hive
        .get(&path)
        .and_then(|v| serde_json::from_value::<PoolDef>(v).ok())
    else {
        return;
    };

    pool.services.insert(
        svc.to_string(),
        PoolSvcDef {
            created,
            creator: creator.to_string(),
        },
    );
    hive.set(&path, serde_json::to_value(&pool).unwrap_or(Value::Null));

    topics.publish(
        &pool_topic(&pool.fullname()),
        json!({"event": "svc:add", "svcname": svc}),
    );
}

pub fn apply_pool_svc_del(hive: &Hive, topics: &TopicHub, name: &str, network: &str, svc: &str) {
    let path = pool_path(network, name);
    let Some(mut pool) = hive
        .get(&path)
        .and_then(|v| serde_json::from_value::<PoolDef>(v).ok())
    else {
        return;
    };

    if pool.services.shift_remove(svc).is_none() {
        return;
    }
    hive.set(&path, serde_json::to_value(&pool).unwrap_or(Value::Null));

    topics.publish(
        &pool_topic(&pool.fullname()),
        json!({"event": "svc:del", "svcname": svc}),
    );
}

// --- Reads ---

pub fn get_pool(hive: &Hive, fullname: &str) -> Option<PoolDef> {
    for network in hive.kids(&["aha", "pools"]) {
        if let Some(name) = fullname.strip_suffix(&format!(".{network}"))
            && let Some(value) = hive.get(&pool_path(&network, name))
        {
            return serde_json::from_value(value).ok();
        }
    }
    None
}

pub fn get_pools(hive: &Hive) -> Vec<PoolDef> {
    let mut out = Vec::new();
    for network in hive.kids(&["aha", "pools"]) {
        for (_name, value) in hive.dict(&["aha", "pools", &network]) {
            if let Ok(pool) = serde_json::from_value::<PoolDef>(value) {
                out.push(pool);
            }
        }
    }
    out
}
